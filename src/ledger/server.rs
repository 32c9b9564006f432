//! Store-backed account ledger used by the disperser.
//!
//! Usage is recorded through [`MeteringStore`] counters and conditional
//! writes; the in-process copy of the state is a cache. Concurrent servers
//! sharing one store never see a bin above its limit for longer than the
//! compensating decrement that follows a rejected increment.

use super::{
    check_revert, on_demand_charge, plan_reservation_charge, AccountLedger, ChargePlan,
    DebitOutcome, OverflowCharge, ReservationCharge,
};
use crate::chain::AccountChainState;
use crate::error::{Error, Result};
use crate::payment::logic::validate_reservations;
use crate::payment::{AccountState, DebitSlip, PaymentVaultParams, QuorumId, QuorumPeriodRecords};
use crate::storage::{BinDelta, MeteringStore};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug)]
struct Cached {
    state: AccountState,
    records_loaded: bool,
}

/// Ledger of one account whose usage lives in a [`MeteringStore`].
pub struct ServerAccountLedger {
    account: Address,
    store: Arc<dyn MeteringStore>,
    cached: RwLock<Cached>,
}

impl std::fmt::Debug for ServerAccountLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAccountLedger")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl ServerAccountLedger {
    /// Ledger for `account`, seeded with its chain state and the cumulative
    /// payment already in the store.
    ///
    /// A failed store read is logged and the ledger starts from zero; the
    /// store's conditional write still rejects any stale debit.
    pub async fn new(
        account: Address,
        chain: AccountChainState,
        store: Arc<dyn MeteringStore>,
        num_bins: usize,
    ) -> Self {
        let mut state = AccountState::new(chain.reservations, chain.on_demand, num_bins);
        match store.get_largest_cumulative_payment(account).await {
            Ok(cumulative) => state.cumulative_payment = cumulative,
            Err(e) => warn!("Failed to load cumulative payment for {account}, starting at zero: {e}"),
        }
        Self {
            account,
            store,
            cached: RwLock::new(Cached {
                state,
                records_loaded: false,
            }),
        }
    }

    /// Account this ledger charges.
    #[must_use]
    pub const fn account(&self) -> Address {
        self.account
    }

    /// Replace reservations and deposit with a fresh chain read.
    pub async fn refresh_from_chain(&self, chain: AccountChainState) {
        let mut cached = self.cached.write().await;
        cached.state.reservations = chain
            .reservations
            .into_iter()
            .filter(|(_, r)| !r.is_empty())
            .collect();
        cached.state.on_demand = chain.on_demand;
    }

    /// Adopt `chain` only if it differs from the cached chain state.
    ///
    /// Returns whether the cache changed.
    pub async fn sync_chain(&self, chain: &AccountChainState) -> bool {
        {
            let cached = self.cached.read().await;
            let same_reservations = cached
                .state
                .reservations
                .iter()
                .eq(chain.reservations.iter().filter(|(_, r)| !r.is_empty()));
            if same_reservations && cached.state.on_demand == chain.on_demand {
                return false;
            }
        }
        self.refresh_from_chain(chain.clone()).await;
        debug!("Chain state of {} changed, cache updated", self.account);
        true
    }

    async fn debit_reservation(
        &self,
        cached: &mut Cached,
        slip: &DebitSlip,
        params: &PaymentVaultParams,
    ) -> Result<Vec<ReservationCharge>> {
        validate_reservations(
            &cached.state.reservations,
            params,
            slip.quorum_numbers(),
            slip.timestamp_ns(),
            slip.received_at_ns(),
        )?;
        let plans = slip
            .quorum_numbers()
            .iter()
            .map(|quorum| {
                let reservation = cached.state.reservations.get(quorum).ok_or_else(|| {
                    Error::ReservationUnavailable(format!("no reservation for quorum {quorum}"))
                })?;
                plan_reservation_charge(
                    params,
                    reservation,
                    *quorum,
                    slip.timestamp_ns(),
                    slip.num_symbols(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(p) = plans.iter().find(|p| p.symbols > p.bin_limit) {
            return Err(Error::UsageExceedsBinLimit {
                quorum: p.quorum,
                usage: p.symbols,
                bin_limit: p.bin_limit,
            });
        }

        if !cached.records_loaded {
            self.load_records(cached, &plans).await;
        }

        let charges = self.charge_store(&plans).await?;
        let records = &mut cached.state.period_records;
        for charge in &charges {
            let added = records.usage(charge.quorum, charge.index).saturating_add(charge.symbols);
            cache_usage(records, charge.quorum, charge.index, added);
            if let Some(o) = charge.overflow {
                cache_usage(records, charge.quorum, o.index, o.symbols);
            }
        }
        Ok(charges)
    }

    /// Increment, inspect, place overflow and cap, compensating on failure.
    async fn charge_store(&self, plans: &[ChargePlan]) -> Result<Vec<ReservationCharge>> {
        let deltas: Vec<BinDelta> = plans
            .iter()
            .map(|p| BinDelta::new(p.quorum, p.period, p.symbols))
            .collect();
        let usages = self.store.increment_bin_usages(self.account, &deltas).await?;

        let mut overflows = Vec::new();
        for (plan, usage) in plans.iter().zip(&usages) {
            if *usage <= plan.bin_limit {
                continue;
            }
            let previous = usage.saturating_sub(plan.symbols);
            let err = if previous >= plan.bin_limit {
                Some(Error::ReservationLimitExceeded { quorum: plan.quorum })
            } else if plan.overflow_period >= plan.end_period {
                Some(Error::OverflowBeyondReservation { quorum: plan.quorum })
            } else {
                None
            };
            if let Some(err) = err {
                self.compensate(&deltas).await;
                return Err(err);
            }
            overflows.push(BinDelta::new(plan.quorum, plan.overflow_period, usage - plan.bin_limit));
        }

        if !overflows.is_empty() {
            let placed = match self.store.increment_bin_usages(self.account, &overflows).await {
                Ok(placed) => placed,
                Err(e) => {
                    self.compensate(&deltas).await;
                    return Err(e);
                }
            };
            if let Some((delta, _)) = overflows
                .iter()
                .zip(&placed)
                .find(|(delta, usage)| **usage != delta.symbols)
            {
                let index = plans
                    .iter()
                    .find(|p| p.quorum == delta.quorum)
                    .map_or(0, |p| p.overflow_index);
                self.compensate(&overflows).await;
                self.compensate(&deltas).await;
                return Err(Error::OverflowBinOccupied {
                    quorum: delta.quorum,
                    index,
                });
            }

            let caps: Vec<BinDelta> = overflows
                .iter()
                .filter_map(|o| {
                    plans
                        .iter()
                        .find(|p| p.quorum == o.quorum)
                        .map(|p| BinDelta::new(p.quorum, p.period, o.symbols))
                })
                .collect();
            if let Err(e) = self.store.decrement_bin_usages(self.account, &caps).await {
                self.compensate(&overflows).await;
                self.compensate(&deltas).await;
                return Err(e);
            }
        }

        Ok(plans
            .iter()
            .map(|plan| {
                let overflow = overflows.iter().find(|o| o.quorum == plan.quorum);
                ReservationCharge {
                    quorum: plan.quorum,
                    period: plan.period,
                    index: plan.index,
                    symbols: plan.symbols - overflow.map_or(0, |o| o.symbols),
                    overflow: overflow.map(|o| OverflowCharge {
                        period: plan.overflow_period,
                        index: plan.overflow_index,
                        symbols: o.symbols,
                    }),
                }
            })
            .collect())
    }

    async fn compensate(&self, deltas: &[BinDelta]) {
        if let Err(e) = self.store.decrement_bin_usages(self.account, deltas).await {
            warn!(
                "Compensating decrement of {} bins failed for {}: {e}",
                deltas.len(),
                self.account
            );
        }
    }

    /// Snapshot the bins a debit will touch, once per ledger.
    async fn load_records(&self, cached: &mut Cached, plans: &[ChargePlan]) {
        let keys: Vec<(QuorumId, u64)> = plans
            .iter()
            .flat_map(|p| [(p.quorum, p.period), (p.quorum, p.overflow_period)])
            .collect();
        match self.store.get_period_usages(self.account, &keys).await {
            Ok(usages) => {
                let indices = plans
                    .iter()
                    .flat_map(|p| [(p.quorum, p.index), (p.quorum, p.overflow_index)]);
                for ((quorum, index), usage) in indices.zip(usages) {
                    if usage > 0 {
                        cache_usage(&mut cached.state.period_records, quorum, index, usage);
                    }
                }
                cached.records_loaded = true;
            }
            Err(e) => warn!("Failed to load period records for {}: {e}", self.account),
        }
    }

    async fn debit_on_demand(
        &self,
        cached: &mut Cached,
        slip: &DebitSlip,
        params: &PaymentVaultParams,
    ) -> Result<DebitOutcome> {
        let (symbols, charged) = on_demand_charge(params, slip)?;
        let available = cached.state.on_demand.cumulative_payment;
        let current = cached.state.cumulative_payment;
        let cumulative = current
            .checked_add(charged)
            .filter(|c| *c <= available)
            .ok_or_else(|| Error::InsufficientBalance {
                required: current.saturating_add(charged),
                available,
            })?;

        match self
            .store
            .add_on_demand_payment(self.account, cumulative, charged)
            .await
        {
            Ok(_) => {
                cached.state.cumulative_payment = cumulative;
                Ok(DebitOutcome::OnDemand {
                    charged,
                    cumulative,
                    symbols,
                })
            }
            Err(e) if e.is_condition_failed() => {
                match self.store.get_largest_cumulative_payment(self.account).await {
                    Ok(stored) => cached.state.cumulative_payment = stored,
                    Err(read) => warn!("Failed to resync cumulative payment for {}: {read}", self.account),
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn check_account(&self, slip: &DebitSlip) -> Result<()> {
        if slip.account() != self.account {
            return Err(Error::InvalidRequest(format!(
                "slip for {} presented to ledger of {}",
                slip.account(),
                self.account
            )));
        }
        Ok(())
    }
}

/// Mirror a store value into the cached bins; the cache is advisory.
fn cache_usage(records: &mut QuorumPeriodRecords, quorum: QuorumId, index: u32, usage: u64) {
    if let Err(e) = records.set_usage(quorum, index, usage) {
        debug!("Cached bin not updated: {e}");
    }
}

#[async_trait]
impl AccountLedger for ServerAccountLedger {
    async fn debit(&self, slip: &DebitSlip, params: &PaymentVaultParams) -> Result<DebitOutcome> {
        self.check_account(slip)?;
        let mut cached = self.cached.write().await;

        let reservation_err = match self.debit_reservation(&mut cached, slip, params).await {
            Ok(charges) => return Ok(DebitOutcome::Reservation { charges }),
            Err(e) if e.is_config() => {
                return Err(Error::NoPaymentMethod {
                    account: self.account,
                    reservation: Box::new(e),
                });
            }
            Err(e) => e,
        };
        debug!("Reservation path rejected for {}: {reservation_err}", self.account);

        self.debit_on_demand(&mut cached, slip, params)
            .await
            .map_err(|on_demand| Error::PaymentUnavailable {
                account: self.account,
                reservation: Box::new(reservation_err),
                on_demand: Box::new(on_demand),
            })
    }

    async fn revert_debit(&self, slip: &DebitSlip, outcome: &DebitOutcome) -> Result<()> {
        self.check_account(slip)?;
        check_revert(slip, outcome)?;
        let mut cached = self.cached.write().await;

        match outcome {
            DebitOutcome::Reservation { charges } => {
                let deltas: Vec<BinDelta> = charges
                    .iter()
                    .flat_map(|c| {
                        std::iter::once(BinDelta::new(c.quorum, c.period, c.symbols)).chain(
                            c.overflow
                                .map(|o| BinDelta::new(c.quorum, o.period, o.symbols)),
                        )
                    })
                    .collect();
                self.store.decrement_bin_usages(self.account, &deltas).await?;
                for c in charges {
                    let records = &mut cached.state.period_records;
                    let mut bins = vec![(c.index, c.symbols)];
                    bins.extend(c.overflow.map(|o| (o.index, o.symbols)));
                    for (index, symbols) in bins {
                        if let Err(e) = records.subtract_usage(c.quorum, index, symbols) {
                            debug!("Cached bin not reverted: {e}");
                        }
                    }
                }
            }
            DebitOutcome::OnDemand {
                charged,
                cumulative,
                ..
            } => {
                let previous = cumulative.checked_sub(*charged).ok_or_else(|| {
                    Error::InvalidRevert(format!("payment {charged} exceeds cumulative {cumulative}"))
                })?;
                let applied = self
                    .store
                    .rollback_on_demand_payment(self.account, *cumulative, previous)
                    .await?;
                if applied {
                    cached.state.cumulative_payment = previous;
                } else {
                    debug!(
                        "Revert of {charged} for {} skipped: cumulative moved past {cumulative}",
                        self.account
                    );
                }
            }
        }
        Ok(())
    }

    async fn account_state(&self) -> AccountState {
        self.cached.read().await.state.clone()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{account, deposit, params, reservations, NOW};
    use crate::storage::MemoryMeteringStore;

    const PERIOD: u64 = 1_000;
    const OVERFLOW_PERIOD: u64 = 1_004;

    fn slip(symbols: u64, quorums: Vec<QuorumId>) -> DebitSlip {
        DebitSlip::with_received_at(account(), NOW, symbols, quorums, NOW).expect("valid slip")
    }

    async fn ledger(
        store: &Arc<MemoryMeteringStore>,
        quorums: &[QuorumId],
        amount: u64,
    ) -> ServerAccountLedger {
        let chain = AccountChainState {
            reservations: reservations(quorums),
            on_demand: deposit(amount),
        };
        ServerAccountLedger::new(account(), chain, Arc::clone(store) as Arc<dyn MeteringStore>, 3)
            .await
    }

    async fn usages(store: &MemoryMeteringStore, keys: &[(QuorumId, u64)]) -> Vec<u64> {
        store.get_period_usages(account(), keys).await.expect("read")
    }

    #[tokio::test]
    async fn test_overflow_scenario_against_store() {
        let store = Arc::new(MemoryMeteringStore::default());
        let ledger = ledger(&store, &[0], 1_000).await;
        let params = params();

        ledger.debit(&slip(80, vec![0]), &params).await.expect("fits");
        let outcome = ledger.debit(&slip(30, vec![0]), &params).await.expect("overflow");
        assert!(outcome.is_reservation());
        assert_eq!(usages(&store, &[(0, PERIOD), (0, OVERFLOW_PERIOD)]).await, vec![100, 10]);

        let outcome = ledger.debit(&slip(30, vec![0]), &params).await.expect("on-demand");
        assert_eq!(outcome.payment(), Some(U256::from(60)));
        assert_eq!(usages(&store, &[(0, PERIOD), (0, OVERFLOW_PERIOD)]).await, vec![100, 10]);
        assert_eq!(
            store.get_largest_cumulative_payment(account()).await.expect("read"),
            U256::from(60)
        );

        let state = ledger.account_state().await;
        assert_eq!(state.period_records.usage(0, 500), 100);
        assert_eq!(state.cumulative_payment, U256::from(60));
    }

    #[tokio::test]
    async fn test_store_rejection_is_compensated() {
        let store = Arc::new(MemoryMeteringStore::default());
        let ledger = ledger(&store, &[0, 1], 0).await;
        let params = params();
        ledger.debit(&slip(100, vec![1]), &params).await.expect("fill quorum 1");

        let err = ledger
            .debit(&slip(30, vec![0, 1]), &params)
            .await
            .expect_err("quorum 1 full");
        assert!(matches!(err, Error::PaymentUnavailable { .. }));
        assert_eq!(usages(&store, &[(0, PERIOD), (1, PERIOD)]).await, vec![0, 100]);
    }

    #[tokio::test]
    async fn test_occupied_overflow_bin_compensated() {
        let store = Arc::new(MemoryMeteringStore::default());
        store
            .increment_bin_usages(account(), &[BinDelta::new(0, OVERFLOW_PERIOD, 1)])
            .await
            .expect("seed overflow bin");
        let ledger = ledger(&store, &[0], 0).await;
        let params = params();

        ledger.debit(&slip(90, vec![0]), &params).await.expect("fits");
        let err = ledger
            .debit(&slip(20, vec![0]), &params)
            .await
            .expect_err("overflow occupied");
        let Error::PaymentUnavailable { reservation, .. } = err else {
            panic!("expected combined error");
        };
        assert!(matches!(*reservation, Error::OverflowBinOccupied { quorum: 0, index: 502 }));
        assert_eq!(usages(&store, &[(0, PERIOD), (0, OVERFLOW_PERIOD)]).await, vec![90, 1]);
    }

    #[tokio::test]
    async fn test_revert_reservation_with_overflow() {
        let store = Arc::new(MemoryMeteringStore::default());
        let ledger = ledger(&store, &[0], 0).await;
        let params = params();
        ledger.debit(&slip(80, vec![0]), &params).await.expect("seed");

        let s = slip(30, vec![0]);
        let outcome = ledger.debit(&s, &params).await.expect("overflow");
        ledger.revert_debit(&s, &outcome).await.expect("revert");
        assert_eq!(usages(&store, &[(0, PERIOD), (0, OVERFLOW_PERIOD)]).await, vec![80, 0]);
        assert_eq!(ledger.account_state().await.period_records.usage(0, 500), 80);
    }

    #[tokio::test]
    async fn test_stale_on_demand_revert_is_noop() {
        let store = Arc::new(MemoryMeteringStore::default());
        let ledger = ledger(&store, &[], 1_000).await;
        let params = params();

        let first = slip(10, vec![0]);
        let first_outcome = ledger.debit(&first, &params).await.expect("first");
        let second = slip(5, vec![0]);
        let second_outcome = ledger.debit(&second, &params).await.expect("second");
        assert_eq!(second_outcome.payment(), Some(U256::from(10)));

        ledger
            .revert_debit(&first, &first_outcome)
            .await
            .expect("stale revert");
        assert_eq!(
            store.get_largest_cumulative_payment(account()).await.expect("read"),
            U256::from(30)
        );

        ledger
            .revert_debit(&second, &second_outcome)
            .await
            .expect("latest revert");
        assert_eq!(
            store.get_largest_cumulative_payment(account()).await.expect("read"),
            U256::from(20)
        );
        assert_eq!(ledger.account_state().await.cumulative_payment, U256::from(20));
    }

    #[tokio::test]
    async fn test_conditional_failure_resyncs_cache() {
        let store = Arc::new(MemoryMeteringStore::default());
        let ledger = ledger(&store, &[], 1_000).await;
        // Another server advanced the payment
        store
            .add_on_demand_payment(account(), U256::from(500), U256::from(500))
            .await
            .expect("foreign write");

        let err = ledger
            .debit(&slip(10, vec![0]), &params())
            .await
            .expect_err("stale cumulative");
        let Error::PaymentUnavailable { on_demand, .. } = err else {
            panic!("expected combined error");
        };
        assert!(on_demand.is_condition_failed());
        assert_eq!(ledger.account_state().await.cumulative_payment, U256::from(500));

        let outcome = ledger.debit(&slip(10, vec![0]), &params()).await.expect("retry");
        assert_eq!(outcome.payment(), Some(U256::from(20)));
    }

    #[tokio::test]
    async fn test_resumes_from_stored_cumulative() {
        let store = Arc::new(MemoryMeteringStore::default());
        store
            .add_on_demand_payment(account(), U256::from(90), U256::from(90))
            .await
            .expect("seed");
        let ledger = ledger(&store, &[], 100).await;
        assert_eq!(ledger.account_state().await.cumulative_payment, U256::from(90));

        let err = ledger
            .debit(&slip(10, vec![0]), &params())
            .await
            .expect_err("110 > 100");
        assert!(err.to_string().contains("insufficient on-demand balance"));
    }

    #[tokio::test]
    async fn test_refresh_from_chain_raises_deposit() {
        let store = Arc::new(MemoryMeteringStore::default());
        let ledger = ledger(&store, &[], 0).await;
        assert!(ledger.debit(&slip(10, vec![0]), &params()).await.is_err());

        ledger
            .refresh_from_chain(AccountChainState {
                reservations: reservations(&[]),
                on_demand: deposit(100),
            })
            .await;
        ledger.debit(&slip(10, vec![0]), &params()).await.expect("funded");
    }
}
