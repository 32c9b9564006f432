//! Durable metering state.
//!
//! [`MeteringStore`] is the only mutation path for server-side ledgers. Its
//! conditional writes provide the cross-process exclusion; no distributed
//! lock is taken.
//!
//! # Key layout
//!
//! ```text
//! reservation:{account:20}{quorum:1}{period:8 BE}  -> u64 BE   bin usage
//! ondemand:{account:20}                              -> U256 BE  cumulative payment
//! globalbin:{period:8 BE}                            -> u64 BE   global usage
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use saorsa_ledger::storage::{BinDelta, MemoryMeteringStore, MeteringStore};
//!
//! let store = MemoryMeteringStore::new(100);
//! let usage = store
//!     .increment_bin_usages(account, &[BinDelta::new(0, 120, 64)])
//!     .await?;
//! ```

mod memory;
mod rocks;

pub use memory::MemoryMeteringStore;
pub use rocks::RocksMeteringStore;

use crate::error::{Error, Result};
use crate::payment::QuorumId;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;

/// Unsigned change to one period bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinDelta {
    /// Quorum of the bin.
    pub quorum: QuorumId,
    /// Floor-aligned period start.
    pub period: u64,
    /// Symbols to add or remove.
    pub symbols: u64,
}

impl BinDelta {
    /// Delta of `symbols` on `(quorum, period)`.
    #[must_use]
    pub const fn new(quorum: QuorumId, period: u64, symbols: u64) -> Self {
        Self {
            quorum,
            period,
            symbols,
        }
    }
}

/// Durable backend for metering state.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Atomically add every delta and return the resulting usages in order.
    async fn increment_bin_usages(&self, account: Address, deltas: &[BinDelta])
        -> Result<Vec<u64>>;

    /// Atomically remove every delta. Nothing is applied if any bin would go
    /// negative.
    async fn decrement_bin_usages(&self, account: Address, deltas: &[BinDelta]) -> Result<()>;

    /// Add `symbols` to the global bin of `period` and return its new usage.
    async fn update_global_bin(&self, period: u64, symbols: u64) -> Result<u64>;

    /// Remove `symbols` from the global bin of `period`, stopping at zero.
    async fn decrement_global_bin(&self, period: u64, symbols: u64) -> Result<()>;

    /// Advance the cumulative payment to `new_cumulative`.
    ///
    /// Writes only if no record exists or the stored value is at most
    /// `new_cumulative - charge`; returns the previously stored value.
    async fn add_on_demand_payment(
        &self,
        account: Address,
        new_cumulative: U256,
        charge: U256,
    ) -> Result<U256>;

    /// Restore `old_payment` if the stored value still equals `new_payment`.
    ///
    /// Returns `false`, not an error, when a competing write moved the value
    /// on or no payment is stored at all.
    async fn rollback_on_demand_payment(
        &self,
        account: Address,
        new_payment: U256,
        old_payment: U256,
    ) -> Result<bool>;

    /// Usage of each `(quorum, period)` key, zero for absent keys.
    async fn get_period_usages(
        &self,
        account: Address,
        keys: &[(QuorumId, u64)],
    ) -> Result<Vec<u64>>;

    /// Stored cumulative payment, zero if none.
    async fn get_largest_cumulative_payment(&self, account: Address) -> Result<U256>;

    /// Usage of the global bin of `period`.
    async fn get_global_bin_usage(&self, period: u64) -> Result<u64>;
}

pub(crate) const RESERVATION_PREFIX: &[u8] = b"reservation:";
pub(crate) const ON_DEMAND_PREFIX: &[u8] = b"ondemand:";
pub(crate) const GLOBAL_BIN_PREFIX: &[u8] = b"globalbin:";

pub(crate) fn check_batch_limit(requested: usize, max: usize) -> Result<()> {
    if requested > max {
        return Err(Error::ExceedsBatchLimit { requested, max });
    }
    Ok(())
}

pub(crate) fn check_add_payment(new_cumulative: U256, charge: U256) -> Result<U256> {
    new_cumulative.checked_sub(charge).ok_or_else(|| {
        Error::InvalidRequest(format!(
            "new cumulative payment {new_cumulative} is less than charge {charge}"
        ))
    })
}

pub(crate) fn bin_key(account: Address, quorum: QuorumId, period: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(RESERVATION_PREFIX.len() + 20 + 1 + 8);
    key.extend_from_slice(RESERVATION_PREFIX);
    key.extend_from_slice(account.as_slice());
    key.push(quorum);
    key.extend_from_slice(&period.to_be_bytes());
    key
}

pub(crate) fn payment_key(account: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(ON_DEMAND_PREFIX.len() + 20);
    key.extend_from_slice(ON_DEMAND_PREFIX);
    key.extend_from_slice(account.as_slice());
    key
}

pub(crate) fn global_bin_key(period: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(GLOBAL_BIN_PREFIX.len() + 8);
    key.extend_from_slice(GLOBAL_BIN_PREFIX);
    key.extend_from_slice(&period.to_be_bytes());
    key
}
