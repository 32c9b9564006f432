//! Account ledgers.
//!
//! # Debit flow
//!
//! ```text
//! DebitSlip
//!    │
//!    ▼
//! ┌─────────────────────────┐   config error
//! │ validate reservations   │──────────────────▶ NoPaymentMethod
//! └─────────┬───────────────┘
//!           │ ok / capacity error
//!           ▼
//! ┌─────────────────────────┐   all quorums fit
//! │ charge bins on a copy   │──────────────────▶ swap copy, Reservation
//! └─────────┬───────────────┘
//!           │ any quorum full
//!           ▼
//! ┌─────────────────────────┐   within deposit
//! │ on-demand charge        │──────────────────▶ OnDemand
//! └─────────┬───────────────┘
//!           │
//!           ▼
//!    PaymentUnavailable
//! ```
//!
//! [`LocalAccountLedger`] keeps its state in memory; [`ServerAccountLedger`]
//! applies the same decision through a [`MeteringStore`](crate::storage::MeteringStore).

mod batch;
mod local;
mod registry;
mod server;

pub use batch::{BatchCharge, BatchLedger, BlobCertificate, BlobHeader, DispersalBatch};
pub use local::LocalAccountLedger;
pub use registry::ServerLedger;
pub use server::ServerAccountLedger;

use crate::error::{Error, Result};
use crate::payment::logic::{
    bin_limit, overflow_period, payment_charged, period_index, reservation_period,
    reservation_period_by_ns, symbols_charged,
};
use crate::payment::{
    AccountState, DebitSlip, PaymentVaultParams, QuorumId, QuorumPeriodRecords, ReservedPayment,
};
use alloy_primitives::U256;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Symbols placed in an overflow bin by one debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowCharge {
    /// Floor-aligned start of the overflow period.
    pub period: u64,
    /// Absolute number of the overflow period.
    pub index: u32,
    /// Symbols placed there.
    pub symbols: u64,
}

/// Reservation usage recorded for one quorum by one debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationCharge {
    /// Quorum charged.
    pub quorum: QuorumId,
    /// Floor-aligned start of the charged period.
    pub period: u64,
    /// Absolute number of the charged period.
    pub index: u32,
    /// Symbols added to the charged period.
    pub symbols: u64,
    /// Spill into the overflow period, if any.
    pub overflow: Option<OverflowCharge>,
}

impl ReservationCharge {
    /// Symbols billed across both bins.
    #[must_use]
    pub fn total_symbols(&self) -> u64 {
        self.symbols
            .saturating_add(self.overflow.map_or(0, |o| o.symbols))
    }
}

/// How a successful debit was paid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    /// Reservation bins absorbed the request.
    Reservation {
        /// Per-quorum usage recorded.
        charges: Vec<ReservationCharge>,
    },
    /// The cumulative on-demand payment advanced.
    OnDemand {
        /// Amount added to the cumulative payment.
        charged: U256,
        /// Cumulative payment after the debit.
        cumulative: U256,
        /// Symbols billed.
        symbols: u64,
    },
}

impl DebitOutcome {
    /// Payment value of the debit; `None` means a reservation was used.
    #[must_use]
    pub fn payment(&self) -> Option<U256> {
        match self {
            Self::Reservation { .. } => None,
            Self::OnDemand { charged, .. } => Some(*charged),
        }
    }

    /// Whether a reservation paid for the debit.
    #[must_use]
    pub const fn is_reservation(&self) -> bool {
        matches!(self, Self::Reservation { .. })
    }

    /// Symbols billed by the debit.
    #[must_use]
    pub fn symbols(&self) -> u64 {
        match self {
            Self::Reservation { charges } => charges
                .iter()
                .map(ReservationCharge::total_symbols)
                .fold(0, u64::saturating_add),
            Self::OnDemand { symbols, .. } => *symbols,
        }
    }
}

/// Ledger of a single account.
#[async_trait]
pub trait AccountLedger: Send + Sync {
    /// Charge `slip`, reservation first, on-demand second.
    ///
    /// Either every requested quorum is charged or none is.
    async fn debit(&self, slip: &DebitSlip, params: &PaymentVaultParams) -> Result<DebitOutcome>;

    /// Undo a debit previously returned by [`AccountLedger::debit`].
    async fn revert_debit(&self, slip: &DebitSlip, outcome: &DebitOutcome) -> Result<()>;

    /// Deep copy of the ledger state.
    async fn account_state(&self) -> AccountState;
}

/// Geometry of one quorum's charge, computed before touching any bin.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChargePlan {
    pub quorum: QuorumId,
    pub period: u64,
    pub index: u32,
    pub overflow_period: u64,
    pub overflow_index: u32,
    pub end_period: u64,
    pub symbols: u64,
    pub bin_limit: u64,
}

pub(crate) fn plan_reservation_charge(
    params: &PaymentVaultParams,
    reservation: &ReservedPayment,
    quorum: QuorumId,
    timestamp_ns: i64,
    num_symbols: u64,
) -> Result<ChargePlan> {
    let protocol = params.protocol_config(quorum)?;
    let window = protocol.reservation_rate_limit_window;
    let period = reservation_period_by_ns(timestamp_ns, window);
    let index = period_index(period, window)?;
    let overflow = overflow_period(period, window);
    Ok(ChargePlan {
        quorum,
        period,
        index,
        overflow_period: overflow,
        overflow_index: period_index(overflow, window)?,
        end_period: reservation_period(reservation.end_timestamp, window),
        symbols: symbols_charged(num_symbols, protocol.min_num_symbols),
        bin_limit: bin_limit(reservation.symbols_per_second, window),
    })
}

/// Apply one planned charge to `records`.
///
/// `records` should be a scratch copy: a failure after the bin update leaves
/// the overflow write in place.
pub(crate) fn apply_charge(
    records: &mut QuorumPeriodRecords,
    plan: &ChargePlan,
) -> Result<ReservationCharge> {
    let update = records.update_usage(
        plan.quorum,
        plan.index,
        plan.overflow_index,
        plan.symbols,
        plan.bin_limit,
    )?;
    if update.overflow.is_some() && plan.overflow_period >= plan.end_period {
        return Err(Error::OverflowBeyondReservation {
            quorum: plan.quorum,
        });
    }
    Ok(ReservationCharge {
        quorum: plan.quorum,
        period: plan.period,
        index: plan.index,
        symbols: update.added,
        overflow: update.overflow.map(|symbols| OverflowCharge {
            period: plan.overflow_period,
            index: plan.overflow_index,
            symbols,
        }),
    })
}

/// Charge every requested quorum of `slip` against `records`.
pub(crate) fn charge_reservations(
    records: &mut QuorumPeriodRecords,
    reservations: &BTreeMap<QuorumId, ReservedPayment>,
    params: &PaymentVaultParams,
    slip: &DebitSlip,
) -> Result<Vec<ReservationCharge>> {
    slip.quorum_numbers()
        .iter()
        .map(|quorum| {
            let reservation = reservations.get(quorum).ok_or_else(|| {
                Error::ReservationUnavailable(format!("no reservation for quorum {quorum}"))
            })?;
            let plan = plan_reservation_charge(
                params,
                reservation,
                *quorum,
                slip.timestamp_ns(),
                slip.num_symbols(),
            )?;
            apply_charge(records, &plan)
        })
        .collect()
}

/// Symbols and price of an on-demand debit of `slip`.
pub(crate) fn on_demand_charge(params: &PaymentVaultParams, slip: &DebitSlip) -> Result<(u64, U256)> {
    for quorum in slip.quorum_numbers() {
        params.protocol_config(*quorum)?;
        if !params.is_on_demand_quorum(*quorum) {
            return Err(Error::ReservationUnavailable(format!(
                "quorum {quorum} does not accept on-demand payment"
            )));
        }
    }
    let (payment, protocol) = params.on_demand_configs()?;
    if payment.on_demand_price_per_symbol == 0 {
        return Err(Error::Config("on-demand price per symbol is zero".into()));
    }
    let symbols = symbols_charged(slip.num_symbols(), protocol.min_num_symbols);
    Ok((symbols, payment_charged(symbols, payment.on_demand_price_per_symbol)))
}

/// Check a revert request against the slip it claims to undo.
pub(crate) fn check_revert(slip: &DebitSlip, outcome: &DebitOutcome) -> Result<()> {
    match outcome {
        DebitOutcome::Reservation { charges } => {
            if let Some(c) = charges
                .iter()
                .find(|c| !slip.quorum_numbers().contains(&c.quorum))
            {
                return Err(Error::InvalidRevert(format!(
                    "quorum {} was not part of the debit",
                    c.quorum
                )));
            }
            Ok(())
        }
        DebitOutcome::OnDemand {
            charged,
            cumulative,
            ..
        } => {
            if charged.is_zero() {
                return Err(Error::InvalidRevert("payment must be positive".into()));
            }
            if cumulative < charged {
                return Err(Error::InvalidRevert(format!(
                    "payment {charged} exceeds cumulative {cumulative}"
                )));
            }
            Ok(())
        }
    }
}
