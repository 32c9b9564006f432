//! On-chain payment state.
//!
//! [`PaymentVault`] is the contract-facing reader; [`OnchainPaymentState`]
//! caches what it returns. A refresh replaces each cached entry whole,
//! never patching it.

use crate::config::ChainConfig;
use crate::error::{Error, Result};
use crate::payment::{OnDemandPayment, PaymentVaultParams, QuorumId, ReservedPayment};
use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reader over the payment vault contract.
#[async_trait]
pub trait PaymentVault: Send + Sync {
    /// Global quorum configuration.
    async fn payment_vault_params(&self) -> Result<PaymentVaultParams>;

    /// Reservations held by `account`, by quorum.
    async fn reserved_payments(
        &self,
        account: Address,
    ) -> Result<BTreeMap<QuorumId, ReservedPayment>>;

    /// On-demand deposit of `account`.
    async fn on_demand_payment(&self, account: Address) -> Result<OnDemandPayment>;
}

/// Vault contents held in process, settable at runtime.
#[derive(Debug, Default)]
pub struct InMemoryPaymentVault {
    params: RwLock<PaymentVaultParams>,
    reservations: RwLock<HashMap<Address, BTreeMap<QuorumId, ReservedPayment>>>,
    deposits: RwLock<HashMap<Address, OnDemandPayment>>,
}

impl InMemoryPaymentVault {
    /// Vault with the given params and no accounts.
    #[must_use]
    pub fn new(params: PaymentVaultParams) -> Self {
        Self {
            params: RwLock::new(params),
            ..Self::default()
        }
    }

    /// Replace the global params.
    pub fn set_params(&self, params: PaymentVaultParams) {
        *self.params.write() = params;
    }

    /// Set one reservation.
    pub fn set_reservation(&self, account: Address, quorum: QuorumId, reservation: ReservedPayment) {
        self.reservations
            .write()
            .entry(account)
            .or_default()
            .insert(quorum, reservation);
    }

    /// Set the deposit of `account`.
    pub fn set_deposit(&self, account: Address, deposit: OnDemandPayment) {
        self.deposits.write().insert(account, deposit);
    }
}

#[async_trait]
impl PaymentVault for InMemoryPaymentVault {
    async fn payment_vault_params(&self) -> Result<PaymentVaultParams> {
        Ok(self.params.read().clone())
    }

    async fn reserved_payments(
        &self,
        account: Address,
    ) -> Result<BTreeMap<QuorumId, ReservedPayment>> {
        Ok(self
            .reservations
            .read()
            .get(&account)
            .cloned()
            .unwrap_or_default())
    }

    async fn on_demand_payment(&self, account: Address) -> Result<OnDemandPayment> {
        Ok(self
            .deposits
            .read()
            .get(&account)
            .copied()
            .unwrap_or_default())
    }
}

/// Chain state of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountChainState {
    /// Non-empty reservations by quorum.
    pub reservations: BTreeMap<QuorumId, ReservedPayment>,
    /// On-demand deposit.
    pub on_demand: OnDemandPayment,
}

/// Read-through cache over a [`PaymentVault`].
pub struct OnchainPaymentState {
    vault: Arc<dyn PaymentVault>,
    read_timeout: Duration,
    params: RwLock<Option<Arc<PaymentVaultParams>>>,
    accounts: RwLock<HashMap<Address, AccountChainState>>,
}

impl std::fmt::Debug for OnchainPaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnchainPaymentState")
            .field("read_timeout", &self.read_timeout)
            .field("cached_accounts", &self.accounts.read().len())
            .finish_non_exhaustive()
    }
}

impl OnchainPaymentState {
    /// Empty cache over `vault`.
    #[must_use]
    pub fn new(vault: Arc<dyn PaymentVault>, config: &ChainConfig) -> Self {
        Self {
            vault,
            read_timeout: config.read_timeout(),
            params: RwLock::new(None),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Cached params, read from the vault on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the vault read fails or times out.
    pub async fn params(&self) -> Result<Arc<PaymentVaultParams>> {
        if let Some(params) = self.params.read().clone() {
            return Ok(params);
        }
        let params = Arc::new(
            self.bounded("payment vault params", self.vault.payment_vault_params())
                .await?,
        );
        *self.params.write() = Some(Arc::clone(&params));
        Ok(params)
    }

    /// Cached chain state of `account`, read from the vault on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if a vault read fails or times out.
    pub async fn account(&self, account: Address) -> Result<AccountChainState> {
        if let Some(state) = self.accounts.read().get(&account).cloned() {
            return Ok(state);
        }
        let state = self.load_account(account).await?;
        self.accounts.write().insert(account, state.clone());
        Ok(state)
    }

    /// Reservations of `account` restricted to `quorums`.
    ///
    /// # Errors
    ///
    /// Returns an error if a vault read fails or times out.
    pub async fn reserved_payments_for_quorums(
        &self,
        account: Address,
        quorums: &[QuorumId],
    ) -> Result<BTreeMap<QuorumId, ReservedPayment>> {
        let state = self.account(account).await?;
        Ok(state
            .reservations
            .into_iter()
            .filter(|(q, _)| quorums.contains(q))
            .collect())
    }

    /// Number of accounts in the cache.
    #[must_use]
    pub fn cached_accounts(&self) -> usize {
        self.accounts.read().len()
    }

    /// Reload params and every cached account, then publish them together.
    ///
    /// # Errors
    ///
    /// Returns the first vault error; the cache is unchanged in that case.
    pub async fn refresh(&self) -> Result<()> {
        let params = self
            .bounded("payment vault params", self.vault.payment_vault_params())
            .await?;
        let known: Vec<Address> = self.accounts.read().keys().copied().collect();
        let mut fresh = HashMap::with_capacity(known.len());
        for account in known {
            fresh.insert(account, self.load_account(account).await?);
        }

        *self.params.write() = Some(Arc::new(params));
        // Accounts first read during the reload stay cached
        self.accounts.write().extend(fresh);
        debug!("Refreshed chain state for {} accounts", self.cached_accounts());
        Ok(())
    }

    /// Refresh every `interval` until `shutdown` flips to `true`.
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Chain state refresh every {}s", interval.as_secs());
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Chain state refresh stopped");
                            break;
                        }
                    }
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = self.refresh().await {
                            warn!("Chain state refresh failed: {e}");
                        }
                    }
                }
            }
        })
    }

    async fn load_account(&self, account: Address) -> Result<AccountChainState> {
        let reservations = self
            .bounded("reserved payments", self.vault.reserved_payments(account))
            .await?;
        let on_demand = self
            .bounded("on-demand payment", self.vault.on_demand_payment(account))
            .await?;
        Ok(AccountChainState {
            reservations: reservations
                .into_iter()
                .filter(|(_, r)| !r.is_empty())
                .collect(),
            on_demand,
        })
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.read_timeout, fut)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "chain read of {what} exceeded {}s",
                    self.read_timeout.as_secs()
                ))
            })?
    }
}
