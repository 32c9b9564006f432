//! Metering counters for saorsa-ledger.
//!
//! Tracks admission outcomes per payment method:
//! - reservation and on-demand debits, with symbol totals
//! - rejections and reverts
//! - global throughput refusals

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// Lock-free admission counters.
#[derive(Debug)]
pub struct MeteringMetrics {
    /// Debits served by a reservation.
    reservation_debits: AtomicU64,
    /// Symbols charged to reservations.
    reservation_symbols: AtomicU64,
    /// Debits served by on-demand payment.
    on_demand_debits: AtomicU64,
    /// Symbols charged on demand.
    on_demand_symbols: AtomicU64,
    /// Requests refused by the account ledger.
    rejections: AtomicU64,
    /// Requests refused by the global counter or token bucket.
    global_rejections: AtomicU64,
    /// Debits undone.
    reverts: AtomicU64,
    /// Tracker creation time.
    start_time: Instant,
}

/// Point-in-time copy of [`MeteringMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Debits served by a reservation.
    pub reservation_debits: u64,
    /// Symbols charged to reservations.
    pub reservation_symbols: u64,
    /// Debits served by on-demand payment.
    pub on_demand_debits: u64,
    /// Symbols charged on demand.
    pub on_demand_symbols: u64,
    /// Requests refused by the account ledger.
    pub rejections: u64,
    /// Requests refused by the global limiters.
    pub global_rejections: u64,
    /// Debits undone.
    pub reverts: u64,
    /// Seconds since the tracker was created.
    pub uptime_secs: u64,
}

impl Default for MeteringMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MeteringMetrics {
    /// Create a zeroed tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reservation_debits: AtomicU64::new(0),
            reservation_symbols: AtomicU64::new(0),
            on_demand_debits: AtomicU64::new(0),
            on_demand_symbols: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            global_rejections: AtomicU64::new(0),
            reverts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a reservation debit of `symbols`.
    pub fn record_reservation(&self, symbols: u64) {
        let count = self.reservation_debits.fetch_add(1, Ordering::SeqCst) + 1;
        self.reservation_symbols.fetch_add(symbols, Ordering::SeqCst);
        debug!("Reservation debit recorded, total count: {}", count);
    }

    /// Record an on-demand debit of `symbols`.
    pub fn record_on_demand(&self, symbols: u64) {
        let count = self.on_demand_debits.fetch_add(1, Ordering::SeqCst) + 1;
        self.on_demand_symbols.fetch_add(symbols, Ordering::SeqCst);
        debug!("On-demand debit recorded, total count: {}", count);
    }

    /// Record a request refused by the account ledger.
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a request refused by a global limiter.
    pub fn record_global_rejection(&self) {
        self.global_rejections.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a revert.
    pub fn record_revert(&self) {
        self.reverts.fetch_add(1, Ordering::SeqCst);
    }

    /// Total debits admitted by either method.
    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.reservation_debits.load(Ordering::SeqCst) + self.on_demand_debits.load(Ordering::SeqCst)
    }

    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reservation_debits: self.reservation_debits.load(Ordering::SeqCst),
            reservation_symbols: self.reservation_symbols.load(Ordering::SeqCst),
            on_demand_debits: self.on_demand_debits.load(Ordering::SeqCst),
            on_demand_symbols: self.on_demand_symbols.load(Ordering::SeqCst),
            rejections: self.rejections.load(Ordering::SeqCst),
            global_rejections: self.global_rejections.load(Ordering::SeqCst),
            reverts: self.reverts.load(Ordering::SeqCst),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker() {
        let metrics = MeteringMetrics::new();
        assert_eq!(metrics.admitted(), 0);
        assert_eq!(metrics.snapshot().rejections, 0);
    }

    #[test]
    fn test_record_debits() {
        let metrics = MeteringMetrics::new();
        metrics.record_reservation(64);
        metrics.record_reservation(32);
        metrics.record_on_demand(10);

        let snap = metrics.snapshot();
        assert_eq!(snap.reservation_debits, 2);
        assert_eq!(snap.reservation_symbols, 96);
        assert_eq!(snap.on_demand_debits, 1);
        assert_eq!(snap.on_demand_symbols, 10);
        assert_eq!(metrics.admitted(), 3);
    }

    #[test]
    fn test_record_refusals() {
        let metrics = MeteringMetrics::new();
        metrics.record_rejection();
        metrics.record_global_rejection();
        metrics.record_global_rejection();
        metrics.record_revert();

        let snap = metrics.snapshot();
        assert_eq!(snap.rejections, 1);
        assert_eq!(snap.global_rejections, 2);
        assert_eq!(snap.reverts, 1);
    }
}
