//! Global on-demand throughput limiter.
//!
//! A token bucket refilled at `global_symbols_per_second` and holding at most
//! `burst_window_secs` worth of tokens. Grants are immediate or refused; there
//! is no queueing. A grant that is not used downstream should be handed back
//! with [`OnDemandMeterer::cancel_dispersal`].

use crate::config::OnDemandMeterConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Token amounts are tracked in symbol-nanoseconds so refill never rounds.
const SCALE: u128 = 1_000_000_000;

/// Tokens taken from the bucket for one dispersal.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation holds tokens until cancelled"]
pub struct DispersalReservation {
    symbols: u64,
}

impl DispersalReservation {
    /// Symbols held by this reservation.
    #[must_use]
    pub const fn symbols(&self) -> u64 {
        self.symbols
    }
}

#[derive(Debug)]
struct Bucket {
    scaled_tokens: u128,
    last_refill: Instant,
}

/// Token bucket over aggregate on-demand symbols.
#[derive(Debug)]
pub struct OnDemandMeterer {
    symbols_per_second: u64,
    capacity: u64,
    bucket: Mutex<Bucket>,
}

impl OnDemandMeterer {
    /// Build a full bucket from config.
    ///
    /// # Errors
    ///
    /// Returns a config error if the rate or burst window is zero.
    pub fn new(config: &OnDemandMeterConfig) -> Result<Self> {
        if config.global_symbols_per_second == 0 {
            return Err(Error::Config(
                "global on-demand symbols per second must be non-zero".into(),
            ));
        }
        if config.burst_window_secs == 0 {
            return Err(Error::Config("on-demand burst window must be non-zero".into()));
        }
        let capacity = config
            .global_symbols_per_second
            .saturating_mul(config.burst_window_secs);
        Ok(Self {
            symbols_per_second: config.global_symbols_per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                scaled_tokens: u128::from(capacity) * SCALE,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Bucket size in symbols.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Symbols that could be granted right now.
    #[must_use]
    pub fn available_symbols(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        whole_tokens(bucket.scaled_tokens)
    }

    /// Take `symbols` tokens if they are available now.
    ///
    /// # Errors
    ///
    /// Returns a capacity error if the bucket holds fewer than `symbols`.
    pub fn meter_dispersal(&self, symbols: u64) -> Result<DispersalReservation> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());

        let needed = u128::from(symbols) * SCALE;
        if bucket.scaled_tokens < needed {
            let available = whole_tokens(bucket.scaled_tokens);
            debug!("On-demand meter refused {symbols} symbols, {available} available");
            return Err(Error::ThroughputExhausted {
                requested: symbols,
                available,
            });
        }
        bucket.scaled_tokens -= needed;
        Ok(DispersalReservation { symbols })
    }

    /// Return the tokens of an unused reservation.
    pub fn cancel_dispersal(&self, reservation: DispersalReservation) {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        let cap = u128::from(self.capacity) * SCALE;
        bucket.scaled_tokens =
            (bucket.scaled_tokens + u128::from(reservation.symbols) * SCALE).min(cap);
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_nanos();
        if elapsed == 0 {
            return;
        }
        let cap = u128::from(self.capacity) * SCALE;
        let added = elapsed.saturating_mul(u128::from(self.symbols_per_second));
        bucket.scaled_tokens = bucket.scaled_tokens.saturating_add(added).min(cap);
        bucket.last_refill = now;
    }
}

fn whole_tokens(scaled: u128) -> u64 {
    u64::try_from(scaled / SCALE).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meter(rate: u64, burst: u64) -> OnDemandMeterer {
        OnDemandMeterer::new(&OnDemandMeterConfig {
            global_symbols_per_second: rate,
            burst_window_secs: burst,
        })
        .expect("meter")
    }

    #[test]
    fn test_zero_config_rejected() {
        assert!(OnDemandMeterer::new(&OnDemandMeterConfig::default()).is_err());
        let err = OnDemandMeterer::new(&OnDemandMeterConfig {
            global_symbols_per_second: 10,
            burst_window_secs: 0,
        })
        .expect_err("zero burst");
        assert!(err.is_config());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_up_to_burst() {
        let meter = meter(100, 2);
        assert_eq!(meter.capacity(), 200);

        let a = meter.meter_dispersal(150).expect("first grant");
        assert_eq!(a.symbols(), 150);
        let err = meter.meter_dispersal(51).expect_err("not enough tokens");
        assert!(matches!(
            err,
            Error::ThroughputExhausted {
                requested: 51,
                available: 50
            }
        ));
        let _b = meter.meter_dispersal(50).expect("exact remainder");
        assert_eq!(meter.available_symbols(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let meter = meter(100, 1);
        let _all = meter.meter_dispersal(100).expect("drain");
        assert!(meter.meter_dispersal(1).is_err());

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(meter.available_symbols(), 25);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(meter.available_symbols(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_tokens() {
        let meter = meter(10, 10);
        let grant = meter.meter_dispersal(60).expect("grant");
        assert_eq!(meter.available_symbols(), 40);
        meter.cancel_dispersal(grant);
        assert_eq!(meter.available_symbols(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_larger_than_bucket_never_granted() {
        let meter = meter(10, 1);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(meter.meter_dispersal(11).is_err());
    }
}
