//! The reservation overflow walkthrough, end to end.

use crate::harness::{account, deposit, params, reservation, slip, NOW, SEC};
use alloy_primitives::U256;
use saorsa_ledger::ledger::LocalAccountLedger;
use saorsa_ledger::payment::logic::{bin_limit, symbols_charged};
use saorsa_ledger::{AccountLedger, AccountStateBundle, DebitOutcome, DebitSlip, Error};
use std::collections::BTreeMap;

fn ledger(amount: u64) -> LocalAccountLedger {
    let mut reservations = BTreeMap::new();
    reservations.insert(0, reservation());
    LocalAccountLedger::new(account(9), reservations, deposit(amount), 3)
}

#[tokio::test]
async fn test_overflow_walkthrough() {
    assert_eq!(bin_limit(50, 2), 100);
    let ledger = ledger(1_000);
    let params = params();

    let outcome = ledger
        .debit(&slip(account(9), 80, vec![0]), &params)
        .await
        .expect("80 fits");
    assert_eq!(outcome.payment(), None);

    let outcome = ledger
        .debit(&slip(account(9), 30, vec![0]), &params)
        .await
        .expect("30 overflows");
    let DebitOutcome::Reservation { charges } = outcome else {
        panic!("expected reservation");
    };
    assert_eq!(charges[0].symbols, 20);
    assert_eq!(charges[0].overflow.map(|o| (o.index, o.symbols)), Some((502, 10)));

    let outcome = ledger
        .debit(&slip(account(9), 30, vec![0]), &params)
        .await
        .expect("falls back to on-demand");
    assert_eq!(
        outcome.payment(),
        Some(U256::from(symbols_charged(30, 1) * 2))
    );

    let state = ledger.account_state().await;
    assert_eq!(state.period_records.usage(0, 500), 100);
    assert_eq!(state.period_records.usage(0, 502), 10);
    assert_eq!(state.cumulative_payment, U256::from(60));
}

#[tokio::test]
async fn test_spill_counts_against_period_two_ahead() {
    let ledger = ledger(0);
    let params = params();

    // Period 1000 spills 5 symbols into period 1004
    ledger
        .debit(&slip(account(9), 95, vec![0]), &params)
        .await
        .expect("seed");
    ledger
        .debit(&slip(account(9), 10, vec![0]), &params)
        .await
        .expect("overflow 5");

    let at_1004 = |symbols| {
        DebitSlip::with_received_at(account(9), NOW + 4 * SEC, symbols, vec![0], NOW + 4 * SEC)
            .expect("slip")
    };
    let outcome = ledger
        .debit(&at_1004(95), &params)
        .await
        .expect("95 left in period 1004");
    let DebitOutcome::Reservation { charges } = outcome else {
        panic!("expected reservation");
    };
    assert_eq!(charges[0].overflow, None);
    assert_eq!(ledger.account_state().await.period_records.usage(0, 502), 100);

    let err = ledger
        .debit(&at_1004(1), &params)
        .await
        .expect_err("period 1004 full, no deposit");
    assert!(matches!(err, Error::PaymentUnavailable { .. }));
}

#[tokio::test]
async fn test_state_syncs_over_the_wire() {
    let ledger = ledger(1_000);
    let params = params();
    ledger
        .debit(&slip(account(9), 80, vec![0]), &params)
        .await
        .expect("reservation");
    ledger
        .debit(&slip(account(9), 30, vec![0]), &params)
        .await
        .expect("overflow");

    let bundle = AccountStateBundle::from(&ledger.account_state().await);
    let bytes = bundle.encode().expect("encode");
    let decoded = AccountStateBundle::decode(&bytes).expect("decode");
    let mirror = LocalAccountLedger::from_bundle(account(9), &decoded, 3).expect("mirror");
    assert_eq!(mirror.account_state().await, ledger.account_state().await);

    // The mirror makes the same decision the original would
    let next = slip(account(9), 30, vec![0]);
    assert_eq!(
        mirror.preview_debit(&next, &params).expect("preview"),
        ledger.preview_debit(&next, &params).expect("preview")
    );
}

#[test]
fn test_billing_quantum() {
    assert_eq!(symbols_charged(20, 32), 32);
    assert_eq!(symbols_charged(100, 3), 102);
    assert_eq!(symbols_charged(0, 10), 10);
}
