//! Pure payment arithmetic: period bucketing, billing quantization, pricing
//! and reservation window checks.
//!
//! Nothing here touches ledger state, so every function is safe to call from
//! any ledger implementation or from tests directly.

use crate::error::{Error, Result};
use crate::payment::types::{PaymentVaultParams, QuorumId, ReservedPayment};
use alloy_primitives::U256;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Current unix time in nanoseconds.
#[must_use]
pub fn unix_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Floor-aligned start of the bin containing `timestamp_sec`.
///
/// A zero window yields period 0.
#[must_use]
pub const fn reservation_period(timestamp_sec: u64, window: u64) -> u64 {
    if window == 0 {
        return 0;
    }
    timestamp_sec / window * window
}

/// [`reservation_period`] for a nanosecond timestamp. Negative input yields 0.
#[must_use]
pub fn reservation_period_by_ns(timestamp_ns: i64, window: u64) -> u64 {
    let secs = if timestamp_ns <= 0 {
        0
    } else {
        u64::try_from(timestamp_ns / NANOS_PER_SEC).unwrap_or(0)
    };
    reservation_period(secs, window)
}

/// Period that receives overflow from `period`: two windows later.
#[must_use]
pub const fn overflow_period(period: u64, window: u64) -> u64 {
    period.saturating_add(window.saturating_mul(2))
}

/// Capacity of a single bin.
#[must_use]
pub const fn bin_limit(symbols_per_second: u64, window: u64) -> u64 {
    symbols_per_second.saturating_mul(window)
}

/// Symbols billed for a request of `num_symbols`.
///
/// Requests at or below `min_symbols` pay for `min_symbols`; larger ones
/// round up to the next multiple. Saturates at `u64::MAX`.
#[must_use]
pub const fn symbols_charged(num_symbols: u64, min_symbols: u64) -> u64 {
    if num_symbols <= min_symbols {
        return min_symbols;
    }
    if min_symbols == 0 {
        return num_symbols;
    }
    match num_symbols.div_ceil(min_symbols).checked_mul(min_symbols) {
        Some(v) => v,
        None => u64::MAX,
    }
}

/// Price of `symbols` at `price_per_symbol`.
#[must_use]
pub fn payment_charged(symbols: u64, price_per_symbol: u64) -> U256 {
    U256::from(symbols) * U256::from(price_per_symbol)
}

/// Absolute period number of a floor-aligned period start.
///
/// # Errors
///
/// Returns a config error for a zero window and a validation error if the
/// period number does not fit the record index.
pub fn period_index(period: u64, window: u64) -> Result<u32> {
    if window == 0 {
        return Err(Error::Config("reservation rate limit window is zero".into()));
    }
    u32::try_from(period / window)
        .map_err(|_| Error::InvalidRequest(format!("period {period} out of range")))
}

/// A payment header with a non-zero cumulative payment is on-demand.
#[must_use]
pub fn is_on_demand_payment(cumulative_payment: U256) -> bool {
    !cumulative_payment.is_zero()
}

/// Check that every requested quorum is in `allowed`.
///
/// # Errors
///
/// Fails on an empty request or on the first quorum not allowed.
pub fn validate_quorum<'a, I>(requested: &[QuorumId], allowed: I) -> Result<()>
where
    I: IntoIterator<Item = &'a QuorumId> + Clone,
{
    if requested.is_empty() {
        return Err(Error::InvalidRequest(
            "no quorum numbers provided in the request".into(),
        ));
    }
    for quorum in requested {
        if !allowed.clone().into_iter().any(|q| q == quorum) {
            return Err(Error::ReservationUnavailable(format!(
                "quorum number mismatch: {quorum}"
            )));
        }
    }
    Ok(())
}

/// Replay-window rule for a reservation request.
///
/// The request period must be the current or the previous period relative to
/// `received_at_ns`, and must lie in `[floor(start), floor(end))`.
#[must_use]
pub fn validate_reservation_period(
    reservation: &ReservedPayment,
    request_period: u64,
    window: u64,
    received_at_ns: i64,
) -> bool {
    if window == 0 {
        return false;
    }
    let current = reservation_period_by_ns(received_at_ns, window);
    let previous = current.checked_sub(window);
    if request_period != current && Some(request_period) != previous {
        return false;
    }
    let start = reservation_period(reservation.start_timestamp, window);
    let end = reservation_period(reservation.end_timestamp, window);
    start <= request_period && request_period < end
}

/// Validate an account's reservations against a request.
///
/// # Errors
///
/// - config error if a reserved quorum has no protocol config
/// - reservation error if a requested quorum is not reserved, inactive at
///   `received_at_ns`, or addressed outside the replay window
pub fn validate_reservations(
    reservations: &BTreeMap<QuorumId, ReservedPayment>,
    params: &PaymentVaultParams,
    requested: &[QuorumId],
    header_timestamp_ns: i64,
    received_at_ns: i64,
) -> Result<()> {
    for quorum in reservations.keys() {
        params.protocol_config(*quorum)?;
    }
    validate_quorum(requested, reservations.keys())?;

    for quorum in requested {
        let reservation = reservations.get(quorum).ok_or_else(|| {
            Error::ReservationUnavailable(format!("no reservation for quorum {quorum}"))
        })?;
        if !reservation.is_active_at_ns(received_at_ns) {
            return Err(Error::ReservationUnavailable(format!(
                "reservation not active for quorum {quorum}"
            )));
        }
        let window = params.protocol_config(*quorum)?.reservation_rate_limit_window;
        if window == 0 {
            return Err(Error::Config(format!(
                "invalid zero reservation rate limit window for quorum {quorum}"
            )));
        }
        let period = reservation_period_by_ns(header_timestamp_ns, window);
        if !validate_reservation_period(reservation, period, window, received_at_ns) {
            return Err(Error::ReservationUnavailable(format!(
                "invalid reservation period {period} for quorum {quorum}"
            )));
        }
    }
    Ok(())
}
