//! Metering state survives a restart of the RocksDB store.

use crate::harness::{account, deposit, reservation, server_ledger, slip, vault, OVERFLOW_PERIOD, PERIOD};
use alloy_primitives::U256;
use saorsa_ledger::storage::{MeteringStore, RocksMeteringStore};
use saorsa_ledger::{DebitOutcome, StoreConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("metering"),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn test_usage_and_payments_persist_across_restart() {
    let dir = TempDir::new().expect("tempdir");
    let vault = vault();
    let payer = account(0x50);
    vault.set_reservation(payer, 0, reservation());
    vault.set_deposit(payer, deposit(1_000));

    {
        let store: Arc<dyn MeteringStore> =
            Arc::new(RocksMeteringStore::open(&store_config(&dir)).expect("open"));
        let ledger = server_ledger(&vault, store);

        let first = ledger.debit(&slip(payer, 80, vec![0])).await.expect("80 fits");
        assert!(first.is_reservation());
        let second = ledger.debit(&slip(payer, 30, vec![0])).await.expect("overflow");
        assert!(second.is_reservation());
        let third = ledger.debit(&slip(payer, 30, vec![0])).await.expect("on-demand");
        assert_eq!(third.payment(), Some(U256::from(60)));
    }

    let store = Arc::new(RocksMeteringStore::open(&store_config(&dir)).expect("reopen"));
    assert_eq!(
        store
            .get_period_usages(payer, &[(0, PERIOD), (0, OVERFLOW_PERIOD)])
            .await
            .expect("read"),
        vec![100, 10]
    );
    assert_eq!(
        store.get_largest_cumulative_payment(payer).await.expect("read"),
        U256::from(60)
    );
    assert_eq!(store.get_global_bin_usage(PERIOD).await.expect("read"), 30);

    // A fresh registry resumes billing from the stored cumulative payment
    let ledger = server_ledger(&vault, Arc::clone(&store) as Arc<dyn MeteringStore>);
    let outcome = ledger.debit(&slip(payer, 10, vec![0])).await.expect("on-demand");
    match outcome {
        DebitOutcome::OnDemand {
            charged, cumulative, ..
        } => {
            assert_eq!(charged, U256::from(20));
            assert_eq!(cumulative, U256::from(80));
        }
        other => panic!("expected on-demand, got {other:?}"),
    }
    assert_eq!(store.get_global_bin_usage(PERIOD).await.expect("read"), 40);
}

#[tokio::test]
async fn test_revert_is_durable() {
    let dir = TempDir::new().expect("tempdir");
    let vault = vault();
    let payer = account(0x51);
    vault.set_deposit(payer, deposit(1_000));

    {
        let store: Arc<dyn MeteringStore> =
            Arc::new(RocksMeteringStore::open(&store_config(&dir)).expect("open"));
        let ledger = server_ledger(&vault, store);
        let first = slip(payer, 10, vec![0]);
        ledger.debit(&first).await.expect("first");
        let second = slip(payer, 15, vec![0]);
        let outcome = ledger.debit(&second).await.expect("second");
        ledger.revert_debit(&second, &outcome).await.expect("revert");
    }

    let store = RocksMeteringStore::open(&store_config(&dir)).expect("reopen");
    assert_eq!(
        store.get_largest_cumulative_payment(payer).await.expect("read"),
        U256::from(20)
    );
    assert_eq!(store.get_global_bin_usage(PERIOD).await.expect("read"), 10);
}
