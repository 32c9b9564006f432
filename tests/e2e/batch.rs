//! Batch metering across several accounts.

use crate::harness::{account, chain, reservation, vault, NOW, SEC};
use alloy_primitives::Address;
use saorsa_ledger::ledger::{BatchLedger, BlobCertificate, BlobHeader, DispersalBatch};
use saorsa_ledger::{BatchErrorCode, Error, QuorumId};

const INDEX: u32 = 500;

fn batch_ledger(accounts: &[Address]) -> BatchLedger {
    let vault = vault();
    for account in accounts {
        vault.set_reservation(*account, 0, reservation());
        vault.set_reservation(*account, 1, reservation());
    }
    BatchLedger::new(chain(&vault), 3)
}

fn blob(account: Address, quorums: &[QuorumId], timestamp_ns: i64, symbols: u64) -> BlobCertificate {
    BlobCertificate {
        header: Some(BlobHeader {
            account_id: account,
            quorum_numbers: quorums.to_vec(),
            timestamp_ns,
            num_symbols: symbols,
        }),
    }
}

fn code_of(err: &Error) -> BatchErrorCode {
    match err {
        Error::Batch { code, .. } => *code,
        other => panic!("expected batch error, got {other}"),
    }
}

#[tokio::test]
async fn test_batch_charges_every_account() {
    let (a, b, c) = (account(0x10), account(0x11), account(0x12));
    let ledger = batch_ledger(&[a, b, c]);

    let batch = DispersalBatch {
        certificates: vec![
            blob(a, &[0], NOW, 40),
            blob(b, &[0, 1], NOW, 25),
            blob(a, &[0], NOW, 30),
            blob(c, &[1], NOW, 100),
        ],
    };
    let charges = ledger.meter_batch(&batch, NOW).await.expect("batch fits");

    // a/0, b/0, b/1, c/1
    assert_eq!(charges.len(), 4);
    assert!(charges.iter().all(|c| c.charge.overflow.is_none()));
    assert_eq!(ledger.usage(a, 0, INDEX), 70);
    assert_eq!(ledger.usage(b, 0, INDEX), 25);
    assert_eq!(ledger.usage(b, 1, INDEX), 25);
    assert_eq!(ledger.usage(c, 1, INDEX), 100);
    assert_eq!(ledger.usage(c, 0, INDEX), 0);
}

#[tokio::test]
async fn test_aggregate_can_spill_into_overflow_bin() {
    let a = account(0x20);
    let ledger = batch_ledger(&[a]);

    // Two blobs of 60 aggregate to 120: 100 in the bin, 20 spill
    let batch = DispersalBatch {
        certificates: vec![blob(a, &[0], NOW, 60), blob(a, &[0], NOW, 60)],
    };
    let charges = ledger.meter_batch(&batch, NOW).await.expect("spill");
    let overflow = charges[0].charge.overflow.expect("overflow charge");
    assert_eq!(overflow.index, INDEX + 2);
    assert_eq!(overflow.symbols, 20);

    let records = ledger.period_records(a).expect("charged");
    assert_eq!(records.usage(0, INDEX), 100);
    assert_eq!(records.usage(0, INDEX + 2), 20);
}

#[tokio::test]
async fn test_failed_batch_leaves_every_account_untouched() {
    let (a, b) = (account(0x30), account(0x31));
    let stranger = account(0x3f);
    let ledger = batch_ledger(&[a, b]);
    ledger
        .meter_batch(
            &DispersalBatch {
                certificates: vec![blob(a, &[0], NOW, 10)],
            },
            NOW,
        )
        .await
        .expect("seed");

    let batch = DispersalBatch {
        certificates: vec![
            blob(a, &[0], NOW, 20),
            blob(b, &[0, 1], NOW, 20),
            blob(stranger, &[0], NOW, 1),
        ],
    };
    let err = ledger.meter_batch(&batch, NOW).await.expect_err("stranger");
    assert_eq!(code_of(&err), BatchErrorCode::ReservationNotFound);

    assert_eq!(ledger.usage(a, 0, INDEX), 10);
    assert_eq!(ledger.usage(b, 0, INDEX), 0);
    assert_eq!(ledger.usage(b, 1, INDEX), 0);
    assert!(ledger.period_records(stranger).map_or(true, |r| r.is_empty()));
}

#[tokio::test]
async fn test_previous_period_blobs_are_accepted() {
    let a = account(0x40);
    let ledger = batch_ledger(&[a]);

    // Received in period 1002, stamped in 1000
    let batch = DispersalBatch {
        certificates: vec![blob(a, &[0], NOW, 10), blob(a, &[0], NOW + 2 * SEC, 10)],
    };
    let charges = ledger
        .meter_batch(&batch, NOW + 2 * SEC)
        .await
        .expect("both periods valid");
    assert_eq!(charges.len(), 2);
    assert_eq!(ledger.usage(a, 0, INDEX), 10);
    assert_eq!(ledger.usage(a, 0, INDEX + 1), 10);
}
