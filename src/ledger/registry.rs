//! Process-wide registry of server account ledgers.

use super::{AccountLedger, DebitOutcome, ServerAccountLedger};
use crate::chain::OnchainPaymentState;
use crate::config::MetererConfig;
use crate::error::{Error, Result};
use crate::payment::logic::{bin_limit, reservation_period_by_ns};
use crate::payment::{
    DebitSlip, MeteringMetrics, OnDemandMeterer, PaymentVaultParams, MIN_NUM_BINS,
};
use crate::storage::MeteringStore;
use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry of [`ServerAccountLedger`]s plus the network-wide on-demand
/// limits.
///
/// Build one at service start and share it by `Arc`. Entries live until
/// [`ServerLedger::remove_account`] is called.
pub struct ServerLedger {
    store: Arc<dyn MeteringStore>,
    chain: Arc<OnchainPaymentState>,
    num_bins: usize,
    ledgers: RwLock<HashMap<Address, Arc<ServerAccountLedger>>>,
    meterer: Option<OnDemandMeterer>,
    metrics: MeteringMetrics,
}

impl std::fmt::Debug for ServerLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLedger")
            .field("num_bins", &self.num_bins)
            .field("meterer", &self.meterer)
            .finish_non_exhaustive()
    }
}

impl ServerLedger {
    /// Create the registry.
    ///
    /// # Errors
    ///
    /// Returns a config error if the on-demand meter is enabled with a zero
    /// burst window.
    pub fn new(
        config: &MetererConfig,
        store: Arc<dyn MeteringStore>,
        chain: Arc<OnchainPaymentState>,
    ) -> Result<Self> {
        let meterer = if config.on_demand.is_enabled() {
            Some(OnDemandMeterer::new(&config.on_demand)?)
        } else {
            None
        };
        let num_bins = config.min_num_bins.max(MIN_NUM_BINS);
        info!(
            "Server ledger ready: {num_bins} bins per quorum, on-demand meter {}",
            if meterer.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            store,
            chain,
            num_bins,
            ledgers: RwLock::new(HashMap::new()),
            meterer,
            metrics: MeteringMetrics::new(),
        })
    }

    /// Ledger of `account`, created on first use.
    ///
    /// Concurrent first lookups build exactly one ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the account's chain state cannot be read.
    pub async fn account_ledger(&self, account: Address) -> Result<Arc<ServerAccountLedger>> {
        if let Some(ledger) = self.ledgers.read().await.get(&account) {
            return Ok(Arc::clone(ledger));
        }

        let chain_state = self.chain.account(account).await?;
        let mut ledgers = self.ledgers.write().await;
        if let Some(ledger) = ledgers.get(&account) {
            return Ok(Arc::clone(ledger));
        }
        let ledger = Arc::new(
            ServerAccountLedger::new(account, chain_state, Arc::clone(&self.store), self.num_bins)
                .await,
        );
        ledgers.insert(account, Arc::clone(&ledger));
        info!("Created server ledger for {account} ({} cached)", ledgers.len());
        Ok(ledger)
    }

    /// Admit `slip`: debit its account, then apply the global on-demand
    /// limits to on-demand debits.
    ///
    /// A debit refused by a global limit is reverted before returning.
    ///
    /// # Errors
    ///
    /// Returns the account ledger's error, [`Error::ThroughputExhausted`] or
    /// [`Error::GlobalLimitExceeded`].
    pub async fn debit(&self, slip: &DebitSlip) -> Result<DebitOutcome> {
        let params = self.chain.params().await?;
        let ledger = self.account_ledger(slip.account()).await?;
        ledger.sync_chain(&self.chain.account(slip.account()).await?).await;
        let outcome = match ledger.debit(slip, &params).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_rejection();
                debug!("Debit rejected for {}: {e}", slip.account());
                return Err(e);
            }
        };

        let DebitOutcome::OnDemand { symbols, .. } = outcome else {
            self.metrics.record_reservation(outcome.symbols());
            return Ok(outcome);
        };

        let token = match self.meterer.as_ref().map(|m| m.meter_dispersal(symbols)) {
            Some(Err(e)) => {
                self.refuse(&ledger, slip, &outcome).await;
                return Err(e);
            }
            Some(Ok(token)) => Some(token),
            None => None,
        };

        if let Err(e) = self
            .check_global_throughput(symbols, slip.received_at_ns(), &params)
            .await
        {
            if let (Some(meterer), Some(token)) = (self.meterer.as_ref(), token) {
                meterer.cancel_dispersal(token);
            }
            self.refuse(&ledger, slip, &outcome).await;
            return Err(e);
        }

        self.metrics.record_on_demand(symbols);
        Ok(outcome)
    }

    /// Undo a debit admitted by [`ServerLedger::debit`], including its share
    /// of the global bin.
    ///
    /// # Errors
    ///
    /// Returns an error if the account ledger rejects the revert.
    pub async fn revert_debit(&self, slip: &DebitSlip, outcome: &DebitOutcome) -> Result<()> {
        let ledger = self.account_ledger(slip.account()).await?;
        ledger.revert_debit(slip, outcome).await?;
        if let DebitOutcome::OnDemand { symbols, .. } = outcome {
            let params = self.chain.params().await?;
            let period = self.global_period(slip.received_at_ns(), &params)?;
            self.store.decrement_global_bin(period, *symbols).await?;
        }
        self.metrics.record_revert();
        Ok(())
    }

    /// Add `symbols` to the global bin of the period containing
    /// `received_at_ns`.
    ///
    /// Nothing is kept on rejection: the increment is taken back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalLimitExceeded`] if the bin would pass the
    /// network on-demand rate, or a config error if quorum 0 is unconfigured.
    pub async fn check_global_throughput(
        &self,
        symbols: u64,
        received_at_ns: i64,
        params: &PaymentVaultParams,
    ) -> Result<u64> {
        let (payment, protocol) = params.on_demand_configs()?;
        let period = self.global_period(received_at_ns, params)?;
        let limit = bin_limit(
            payment.on_demand_symbols_per_second,
            protocol.on_demand_rate_limit_window,
        );

        let usage = self.store.update_global_bin(period, symbols).await?;
        if usage > limit {
            if let Err(e) = self.store.decrement_global_bin(period, symbols).await {
                warn!("Failed to take back global bin increment for period {period}: {e}");
            }
            return Err(Error::GlobalLimitExceeded {
                period,
                usage,
                limit,
            });
        }
        Ok(usage)
    }

    /// Number of cached account ledgers.
    pub async fn account_count(&self) -> usize {
        self.ledgers.read().await.len()
    }

    /// Evict the ledger of `account`; returns whether one was cached.
    pub async fn remove_account(&self, account: Address) -> bool {
        self.ledgers.write().await.remove(&account).is_some()
    }

    /// Refresh chain state and push it into every cached ledger.
    ///
    /// # Errors
    ///
    /// Returns the first chain read error.
    pub async fn refresh_accounts(&self) -> Result<()> {
        self.chain.refresh().await?;
        let ledgers: Vec<Arc<ServerAccountLedger>> =
            self.ledgers.read().await.values().cloned().collect();
        for ledger in &ledgers {
            let state = self.chain.account(ledger.account()).await?;
            ledger.refresh_from_chain(state).await;
        }
        debug!("Refreshed {} server ledgers", ledgers.len());
        Ok(())
    }

    /// Run [`ServerLedger::refresh_accounts`] every `interval` until
    /// `shutdown` flips to `true`.
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Server ledger refresh every {}s", interval.as_secs());
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Server ledger refresh stopped");
                            break;
                        }
                    }
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = self.refresh_accounts().await {
                            warn!("Server ledger refresh failed: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Admission counters.
    #[must_use]
    pub const fn metrics(&self) -> &MeteringMetrics {
        &self.metrics
    }

    /// Token bucket, if configured.
    #[must_use]
    pub const fn meterer(&self) -> Option<&OnDemandMeterer> {
        self.meterer.as_ref()
    }

    fn global_period(&self, received_at_ns: i64, params: &PaymentVaultParams) -> Result<u64> {
        let window = params.on_demand_configs()?.1.on_demand_rate_limit_window;
        if window == 0 {
            return Err(Error::Config("on-demand rate limit window is zero".into()));
        }
        Ok(reservation_period_by_ns(received_at_ns, window))
    }

    async fn refuse(&self, ledger: &ServerAccountLedger, slip: &DebitSlip, outcome: &DebitOutcome) {
        self.metrics.record_global_rejection();
        if let Err(e) = ledger.revert_debit(slip, outcome).await {
            warn!("Failed to revert refused debit for {}: {e}", slip.account());
        }
    }
}
