//! Concurrent debits never admit more than the account can pay for.

use crate::harness::{account, deposit, params, reservation, server_ledger, slip, vault, PERIOD};
use alloy_primitives::U256;
use saorsa_ledger::chain::AccountChainState;
use saorsa_ledger::ledger::{LocalAccountLedger, ServerAccountLedger};
use saorsa_ledger::storage::{MemoryMeteringStore, MeteringStore};
use saorsa_ledger::{AccountLedger, DebitOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;

const TASKS: usize = 32;

/// Tally of successful outcomes.
#[derive(Default)]
struct Tally {
    reservation_symbols: u64,
    on_demand_paid: U256,
    admitted: usize,
}

impl Tally {
    fn add(&mut self, outcome: &DebitOutcome) {
        self.admitted += 1;
        match outcome {
            DebitOutcome::Reservation { .. } => self.reservation_symbols += outcome.symbols(),
            DebitOutcome::OnDemand { charged, .. } => self.on_demand_paid += *charged,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_ledger_admits_exactly_capacity() {
    let mut reservations = BTreeMap::new();
    reservations.insert(0, reservation());
    // 100 reservation symbols plus five 20-unit on-demand debits
    let ledger = Arc::new(LocalAccountLedger::new(account(1), reservations, deposit(100), 3));
    let params = Arc::new(params());

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let params = Arc::clone(&params);
            tokio::spawn(async move { ledger.debit(&slip(account(1), 10, vec![0]), &params).await })
        })
        .collect();

    let mut tally = Tally::default();
    for handle in handles {
        if let Ok(outcome) = handle.await.expect("task") {
            tally.add(&outcome);
        }
    }

    assert_eq!(tally.admitted, 15);
    assert_eq!(tally.reservation_symbols, 100);
    assert_eq!(tally.on_demand_paid, U256::from(100));

    let state = ledger.account_state().await;
    assert_eq!(state.cumulative_payment, U256::from(100));
    assert!(state.cumulative_payment <= state.on_demand.cumulative_payment);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_ledger_admits_exactly_capacity() {
    let vault = vault();
    vault.set_reservation(account(2), 0, reservation());
    vault.set_deposit(account(2), deposit(100));
    let store = Arc::new(MemoryMeteringStore::default());
    let ledger = Arc::new(server_ledger(&vault, Arc::clone(&store) as Arc<dyn MeteringStore>));

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.debit(&slip(account(2), 10, vec![0])).await })
        })
        .collect();

    let mut tally = Tally::default();
    for handle in handles {
        if let Ok(outcome) = handle.await.expect("task") {
            tally.add(&outcome);
        }
    }

    assert_eq!(tally.admitted, 15);
    assert_eq!(
        store
            .get_period_usages(account(2), &[(0, PERIOD)])
            .await
            .expect("read"),
        vec![100]
    );
    assert_eq!(
        store
            .get_largest_cumulative_payment(account(2))
            .await
            .expect("read"),
        U256::from(100)
    );
    assert_eq!(ledger.account_count().await, 1);
    assert_eq!(ledger.metrics().admitted(), 15);
}

/// Two servers sharing one store race only through conditional writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_servers_share_one_store() {
    let store: Arc<dyn MeteringStore> = Arc::new(MemoryMeteringStore::default());
    let mut reservations = BTreeMap::new();
    reservations.insert(0, reservation());
    let chain_state = AccountChainState {
        reservations,
        on_demand: deposit(100),
    };

    let servers = [
        Arc::new(ServerAccountLedger::new(account(3), chain_state.clone(), Arc::clone(&store), 3).await),
        Arc::new(ServerAccountLedger::new(account(3), chain_state, Arc::clone(&store), 3).await),
    ];
    let params = Arc::new(params());

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let server = Arc::clone(&servers[i % 2]);
            let params = Arc::clone(&params);
            tokio::spawn(async move { server.debit(&slip(account(3), 10, vec![0]), &params).await })
        })
        .collect();

    let mut tally = Tally::default();
    for handle in handles {
        if let Ok(outcome) = handle.await.expect("task") {
            tally.add(&outcome);
        }
    }

    assert_eq!(tally.reservation_symbols, 100);
    let stored = store
        .get_largest_cumulative_payment(account(3))
        .await
        .expect("read");
    assert_eq!(stored, tally.on_demand_paid);
    assert!(stored <= U256::from(100));
    assert_eq!(
        store
            .get_period_usages(account(3), &[(0, PERIOD)])
            .await
            .expect("read"),
        vec![100]
    );
}
