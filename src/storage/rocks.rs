//! RocksDB-backed [`MeteringStore`].
//!
//! Every call runs on the blocking pool under a configured deadline. Writes
//! are serialised by one mutex and land as a single `WriteBatch`, so each
//! call is atomic. A write whose deadline passes before its commit writes
//! nothing and reports `Timeout`.

use super::{
    bin_key, check_add_payment, check_batch_limit, global_bin_key, payment_key, BinDelta,
    MeteringStore,
};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::payment::QuorumId;
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Options, WriteBatch, DB};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Metering state persisted in a local RocksDB database.
pub struct RocksMeteringStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    read_timeout: Duration,
    write_timeout: Duration,
    max_batch_keys: usize,
}

impl std::fmt::Debug for RocksMeteringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksMeteringStore")
            .field("path", &self.db.path())
            .field("max_batch_keys", &self.max_batch_keys)
            .finish_non_exhaustive()
    }
}

impl RocksMeteringStore {
    /// Open (or create) the database at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be opened.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path).map_err(|e| {
            Error::Storage(format!(
                "Failed to create store directory {}: {e}",
                config.path.display()
            ))
        })?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &config.path)
            .map_err(|e| Error::Storage(format!("Failed to open metering store: {e}")))?;

        info!("Opened metering store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            max_batch_keys: config.max_batch_keys,
        })
    }

    async fn read<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        run_blocking(op, self.read_timeout, move || f(&db)).await
    }

    /// Run `f` under the write lock, awaited to completion.
    ///
    /// `f` commits only through [`commit`], which refuses past the deadline.
    /// A `Timeout` result therefore means nothing was written.
    async fn write<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB, &Deadline) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let lock = Arc::clone(&self.write_lock);
        let deadline = Deadline::after(op, self.write_timeout);
        tokio::task::spawn_blocking(move || {
            let _guard = lock
                .try_lock_until(deadline.at)
                .ok_or_else(|| deadline.exceeded())?;
            f(&db, &deadline)
        })
        .await
        .map_err(|e| Error::Storage(format!("{op} task failed: {e}")))?
    }
}

/// Point after which a write must not commit.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    op: &'static str,
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(op: &'static str, timeout: Duration) -> Self {
        Self {
            op,
            at: Instant::now() + timeout,
            timeout,
        }
    }

    fn check(&self) -> Result<()> {
        if Instant::now() >= self.at {
            return Err(self.exceeded());
        }
        Ok(())
    }

    fn exceeded(&self) -> Error {
        Error::Timeout(format!(
            "{} exceeded {}ms before commit",
            self.op,
            self.timeout.as_millis()
        ))
    }
}

async fn run_blocking<T, F>(op: &'static str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(Error::Storage(format!("{op} task failed: {e}"))),
        Err(_) => Err(Error::Timeout(format!(
            "{op} exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

fn get_raw(db: &DB, key: &[u8]) -> Result<Option<Vec<u8>>> {
    db.get(key)
        .map_err(|e| Error::Storage(format!("Failed to read key: {e}")))
}

fn decode_u64(raw: Option<Vec<u8>>) -> Result<u64> {
    match raw {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::Storage(format!("Corrupt counter value of {} bytes", bytes.len()))
            })?;
            Ok(u64::from_be_bytes(arr))
        }
    }
}

fn decode_u256(raw: Option<Vec<u8>>) -> Result<Option<U256>> {
    raw.map(|bytes| {
        U256::try_from_be_slice(&bytes).ok_or_else(|| {
            Error::Storage(format!("Corrupt payment value of {} bytes", bytes.len()))
        })
    })
    .transpose()
}

fn commit(db: &DB, batch: WriteBatch, deadline: &Deadline) -> Result<()> {
    deadline.check()?;
    db.write(batch)
        .map_err(|e| Error::Storage(format!("Failed to commit write batch: {e}")))
}

/// Fold deltas over the stored values, returning the value after each delta
/// and the final value per key.
fn stage_deltas<F>(
    db: &DB,
    account: Address,
    deltas: &[BinDelta],
    mut apply: F,
) -> Result<(Vec<u64>, HashMap<Vec<u8>, u64>)>
where
    F: FnMut(u64, &BinDelta) -> Result<u64>,
{
    let mut staged: HashMap<Vec<u8>, u64> = HashMap::new();
    let mut results = Vec::with_capacity(deltas.len());
    for d in deltas {
        let key = bin_key(account, d.quorum, d.period);
        let current = match staged.get(&key) {
            Some(v) => *v,
            None => decode_u64(get_raw(db, &key)?)?,
        };
        let next = apply(current, d)?;
        staged.insert(key, next);
        results.push(next);
    }
    Ok((results, staged))
}

#[async_trait]
impl MeteringStore for RocksMeteringStore {
    async fn increment_bin_usages(
        &self,
        account: Address,
        deltas: &[BinDelta],
    ) -> Result<Vec<u64>> {
        check_batch_limit(deltas.len(), self.max_batch_keys)?;
        let deltas = deltas.to_vec();
        self.write("increment_bin_usages", move |db, deadline| {
            let (results, staged) = stage_deltas(db, account, &deltas, |current, d| {
                current.checked_add(d.symbols).ok_or_else(|| {
                    Error::Storage(format!(
                        "bin usage overflow for {account} quorum {} period {}",
                        d.quorum, d.period
                    ))
                })
            })?;
            let mut batch = WriteBatch::default();
            for (key, value) in staged {
                batch.put(key, value.to_be_bytes());
            }
            commit(db, batch, deadline)?;
            Ok(results)
        })
        .await
    }

    async fn decrement_bin_usages(&self, account: Address, deltas: &[BinDelta]) -> Result<()> {
        check_batch_limit(deltas.len(), self.max_batch_keys)?;
        let deltas = deltas.to_vec();
        self.write("decrement_bin_usages", move |db, deadline| {
            let (_, staged) = stage_deltas(db, account, &deltas, |current, d| {
                current.checked_sub(d.symbols).ok_or_else(|| {
                    Error::InvalidRevert(format!(
                        "insufficient usage to subtract: quorum {} period {} holds {current}, revert {}",
                        d.quorum, d.period, d.symbols
                    ))
                })
            })?;
            let mut batch = WriteBatch::default();
            for (key, value) in staged {
                batch.put(key, value.to_be_bytes());
            }
            commit(db, batch, deadline)
        })
        .await
    }

    async fn update_global_bin(&self, period: u64, symbols: u64) -> Result<u64> {
        self.write("update_global_bin", move |db, deadline| {
            let key = global_bin_key(period);
            let usage = decode_u64(get_raw(db, &key)?)?.saturating_add(symbols);
            let mut batch = WriteBatch::default();
            batch.put(key, usage.to_be_bytes());
            commit(db, batch, deadline)?;
            Ok(usage)
        })
        .await
    }

    async fn decrement_global_bin(&self, period: u64, symbols: u64) -> Result<()> {
        self.write("decrement_global_bin", move |db, deadline| {
            let key = global_bin_key(period);
            let usage = decode_u64(get_raw(db, &key)?)?.saturating_sub(symbols);
            let mut batch = WriteBatch::default();
            batch.put(key, usage.to_be_bytes());
            commit(db, batch, deadline)
        })
        .await
    }

    async fn add_on_demand_payment(
        &self,
        account: Address,
        new_cumulative: U256,
        charge: U256,
    ) -> Result<U256> {
        let checkpoint = check_add_payment(new_cumulative, charge)?;
        self.write("add_on_demand_payment", move |db, deadline| {
            let key = payment_key(account);
            let old = decode_u256(get_raw(db, &key)?)?;
            if let Some(stored) = old {
                if stored > checkpoint {
                    return Err(Error::ConditionFailed(format!(
                        "insufficient cumulative payment increment for {account}: stored {stored}, \
                         new {new_cumulative}, charge {charge}"
                    )));
                }
            }
            let mut batch = WriteBatch::default();
            batch.put(key, new_cumulative.to_be_bytes_trimmed_vec());
            commit(db, batch, deadline)?;
            Ok(old.unwrap_or(U256::ZERO))
        })
        .await
    }

    async fn rollback_on_demand_payment(
        &self,
        account: Address,
        new_payment: U256,
        old_payment: U256,
    ) -> Result<bool> {
        self.write("rollback_on_demand_payment", move |db, deadline| {
            let key = payment_key(account);
            match decode_u256(get_raw(db, &key)?)? {
                Some(stored) if stored == new_payment => {}
                stored => {
                    debug!(
                        "Skipping rollback for {account}: stored {stored:?} does not match {new_payment}"
                    );
                    return Ok(false);
                }
            }
            let mut batch = WriteBatch::default();
            batch.put(key, old_payment.to_be_bytes_trimmed_vec());
            commit(db, batch, deadline)?;
            Ok(true)
        })
        .await
    }

    async fn get_period_usages(
        &self,
        account: Address,
        keys: &[(QuorumId, u64)],
    ) -> Result<Vec<u64>> {
        check_batch_limit(keys.len(), self.max_batch_keys)?;
        let keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|(q, p)| bin_key(account, *q, *p))
            .collect();
        self.read("get_period_usages", move |db| {
            db.multi_get(&keys)
                .into_iter()
                .map(|raw| {
                    raw.map_err(|e| Error::Storage(format!("Failed to read key: {e}")))
                        .and_then(decode_u64)
                })
                .collect()
        })
        .await
    }

    async fn get_largest_cumulative_payment(&self, account: Address) -> Result<U256> {
        self.read("get_largest_cumulative_payment", move |db| {
            Ok(decode_u256(get_raw(db, &payment_key(account))?)?.unwrap_or(U256::ZERO))
        })
        .await
    }

    async fn get_global_bin_usage(&self, period: u64) -> Result<u64> {
        self.read("get_global_bin_usage", move |db| {
            decode_u64(get_raw(db, &global_bin_key(period))?)
        })
        .await
    }
}
