//! In-process [`MeteringStore`] for tests and single-node deployments.

use super::{check_add_payment, check_batch_limit, BinDelta, MeteringStore};
use crate::error::{Error, Result};
use crate::payment::QuorumId;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

type BinKey = (Address, QuorumId, u64);

#[derive(Debug, Default)]
struct Tables {
    bins: HashMap<BinKey, u64>,
    payments: HashMap<Address, U256>,
    global: HashMap<u64, u64>,
}

/// Metering state held in memory behind one mutex.
#[derive(Debug)]
pub struct MemoryMeteringStore {
    max_batch_keys: usize,
    tables: Mutex<Tables>,
}

impl MemoryMeteringStore {
    /// Empty store allowing `max_batch_keys` keys per multi-key call.
    #[must_use]
    pub fn new(max_batch_keys: usize) -> Self {
        Self {
            max_batch_keys,
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl Default for MemoryMeteringStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl MeteringStore for MemoryMeteringStore {
    async fn increment_bin_usages(
        &self,
        account: Address,
        deltas: &[BinDelta],
    ) -> Result<Vec<u64>> {
        check_batch_limit(deltas.len(), self.max_batch_keys)?;
        let mut tables = self.tables.lock();

        let mut staged: HashMap<BinKey, u64> = HashMap::new();
        let mut results = Vec::with_capacity(deltas.len());
        for d in deltas {
            let key = (account, d.quorum, d.period);
            let current = staged
                .get(&key)
                .copied()
                .unwrap_or_else(|| tables.bins.get(&key).copied().unwrap_or(0));
            let next = current.checked_add(d.symbols).ok_or_else(|| {
                Error::Storage(format!(
                    "bin usage overflow for {account} quorum {} period {}",
                    d.quorum, d.period
                ))
            })?;
            staged.insert(key, next);
            results.push(next);
        }
        tables.bins.extend(staged);
        Ok(results)
    }

    async fn decrement_bin_usages(&self, account: Address, deltas: &[BinDelta]) -> Result<()> {
        check_batch_limit(deltas.len(), self.max_batch_keys)?;
        let mut tables = self.tables.lock();

        let mut staged: HashMap<BinKey, u64> = HashMap::new();
        for d in deltas {
            let key = (account, d.quorum, d.period);
            let current = staged
                .get(&key)
                .copied()
                .unwrap_or_else(|| tables.bins.get(&key).copied().unwrap_or(0));
            let next = current.checked_sub(d.symbols).ok_or_else(|| {
                Error::InvalidRevert(format!(
                    "insufficient usage to subtract: quorum {} period {} holds {current}, revert {}",
                    d.quorum, d.period, d.symbols
                ))
            })?;
            staged.insert(key, next);
        }
        tables.bins.extend(staged);
        Ok(())
    }

    async fn update_global_bin(&self, period: u64, symbols: u64) -> Result<u64> {
        let mut tables = self.tables.lock();
        let usage = tables.global.entry(period).or_insert(0);
        *usage = usage.saturating_add(symbols);
        Ok(*usage)
    }

    async fn decrement_global_bin(&self, period: u64, symbols: u64) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(usage) = tables.global.get_mut(&period) {
            *usage = usage.saturating_sub(symbols);
        }
        Ok(())
    }

    async fn add_on_demand_payment(
        &self,
        account: Address,
        new_cumulative: U256,
        charge: U256,
    ) -> Result<U256> {
        let checkpoint = check_add_payment(new_cumulative, charge)?;
        let mut tables = self.tables.lock();
        let old = tables.payments.get(&account).copied();
        if let Some(stored) = old {
            if stored > checkpoint {
                return Err(Error::ConditionFailed(format!(
                    "insufficient cumulative payment increment for {account}: stored {stored}, \
                     new {new_cumulative}, charge {charge}"
                )));
            }
        }
        tables.payments.insert(account, new_cumulative);
        Ok(old.unwrap_or(U256::ZERO))
    }

    async fn rollback_on_demand_payment(
        &self,
        account: Address,
        new_payment: U256,
        old_payment: U256,
    ) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.payments.get(&account).copied() {
            Some(stored) if stored == new_payment => {
                tables.payments.insert(account, old_payment);
                Ok(true)
            }
            stored => {
                debug!(
                    "Skipping rollback for {account}: stored {stored:?} does not match {new_payment}"
                );
                Ok(false)
            }
        }
    }

    async fn get_period_usages(
        &self,
        account: Address,
        keys: &[(QuorumId, u64)],
    ) -> Result<Vec<u64>> {
        check_batch_limit(keys.len(), self.max_batch_keys)?;
        let tables = self.tables.lock();
        Ok(keys
            .iter()
            .map(|(q, p)| tables.bins.get(&(account, *q, *p)).copied().unwrap_or(0))
            .collect())
    }

    async fn get_largest_cumulative_payment(&self, account: Address) -> Result<U256> {
        Ok(self
            .tables
            .lock()
            .payments
            .get(&account)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn get_global_bin_usage(&self, period: u64) -> Result<u64> {
        Ok(self.tables.lock().global.get(&period).copied().unwrap_or(0))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn account() -> Address {
        Address::repeat_byte(0x42)
    }

    #[tokio::test]
    async fn test_increment_and_read_back() {
        let store = MemoryMeteringStore::default();
        let usages = store
            .increment_bin_usages(
                account(),
                &[BinDelta::new(0, 60, 10), BinDelta::new(1, 60, 5), BinDelta::new(0, 60, 1)],
            )
            .await
            .expect("increment");
        assert_eq!(usages, vec![10, 5, 11]);

        let read = store
            .get_period_usages(account(), &[(0, 60), (1, 60), (0, 120)])
            .await
            .expect("read");
        assert_eq!(read, vec![11, 5, 0]);
    }

    #[tokio::test]
    async fn test_decrement_is_all_or_nothing() {
        let store = MemoryMeteringStore::default();
        store
            .increment_bin_usages(account(), &[BinDelta::new(0, 60, 10)])
            .await
            .expect("seed");

        let err = store
            .decrement_bin_usages(account(), &[BinDelta::new(0, 60, 4), BinDelta::new(1, 60, 1)])
            .await
            .expect_err("quorum 1 is empty");
        assert!(err.to_string().contains("insufficient usage"));

        let read = store
            .get_period_usages(account(), &[(0, 60)])
            .await
            .expect("read");
        assert_eq!(read, vec![10]);
    }

    #[tokio::test]
    async fn test_add_payment_is_monotonic() {
        let store = MemoryMeteringStore::default();
        let old = store
            .add_on_demand_payment(account(), U256::from(100), U256::from(100))
            .await
            .expect("first");
        assert_eq!(old, U256::ZERO);

        let old = store
            .add_on_demand_payment(account(), U256::from(150), U256::from(50))
            .await
            .expect("second");
        assert_eq!(old, U256::from(100));

        // A writer that has not seen 150 loses
        let err = store
            .add_on_demand_payment(account(), U256::from(160), U256::from(60))
            .await
            .expect_err("stale writer");
        assert!(err.is_condition_failed());

        let err = store
            .add_on_demand_payment(account(), U256::from(10), U256::from(20))
            .await
            .expect_err("negative checkpoint");
        assert!(!err.is_condition_failed());

        assert_eq!(
            store
                .get_largest_cumulative_payment(account())
                .await
                .expect("read"),
            U256::from(150)
        );
    }

    #[tokio::test]
    async fn test_rollback_is_conditional() {
        let store = MemoryMeteringStore::default();
        store
            .add_on_demand_payment(account(), U256::from(100), U256::from(100))
            .await
            .expect("first");
        store
            .add_on_demand_payment(account(), U256::from(130), U256::from(30))
            .await
            .expect("second");

        // Rolling back the first debit is stale now
        let applied = store
            .rollback_on_demand_payment(account(), U256::from(100), U256::ZERO)
            .await
            .expect("stale rollback is not an error");
        assert!(!applied);

        let applied = store
            .rollback_on_demand_payment(account(), U256::from(130), U256::from(100))
            .await
            .expect("rollback");
        assert!(applied);
        assert_eq!(
            store
                .get_largest_cumulative_payment(account())
                .await
                .expect("read"),
            U256::from(100)
        );
    }

    #[tokio::test]
    async fn test_rollback_without_record_is_stale() {
        let store = MemoryMeteringStore::default();
        let applied = store
            .rollback_on_demand_payment(account(), U256::from(10), U256::from(40))
            .await
            .expect("stale rollback is not an error");
        assert!(!applied);

        // A record of 40 would make this checkpoint of 0 stale
        store
            .add_on_demand_payment(account(), U256::from(5), U256::from(5))
            .await
            .expect("nothing was written");
    }

    #[tokio::test]
    async fn test_batch_ceiling() {
        let store = MemoryMeteringStore::new(2);
        let err = store
            .get_period_usages(account(), &[(0, 1), (0, 2), (0, 3)])
            .await
            .expect_err("too many keys");
        assert!(matches!(err, Error::ExceedsBatchLimit { requested: 3, max: 2 }));
    }

    #[tokio::test]
    async fn test_global_bin() {
        let store = MemoryMeteringStore::default();
        assert_eq!(store.update_global_bin(60, 10).await.expect("add"), 10);
        assert_eq!(store.update_global_bin(60, 15).await.expect("add"), 25);
        store.decrement_global_bin(60, 30).await.expect("sub");
        assert_eq!(store.get_global_bin_usage(60).await.expect("read"), 0);
    }
}
