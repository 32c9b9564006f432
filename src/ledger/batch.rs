//! Reservation metering for whole dispersal batches.
//!
//! A batch is charged in two phases. Phase one parses every certificate,
//! aggregates usage per `(account, quorum, period)` and reads reservations.
//! Phase two validates every aggregate against copies of the account bins
//! and publishes the copies only if all of them passed. A single bad blob
//! leaves every account untouched.

use super::{apply_charge, plan_reservation_charge, ReservationCharge};
use crate::chain::OnchainPaymentState;
use crate::error::{BatchErrorCode, Error, Result};
use crate::payment::logic::{reservation_period_by_ns, symbols_charged, validate_reservation_period};
use crate::payment::{PaymentVaultParams, QuorumId, QuorumPeriodRecords, ReservedPayment};
use alloy_primitives::Address;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Payment-relevant fields of one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    /// Paying account.
    pub account_id: Address,
    /// Quorums the blob is dispersed to.
    pub quorum_numbers: Vec<QuorumId>,
    /// Client timestamp, unix nanoseconds.
    pub timestamp_ns: i64,
    /// Blob length in symbols.
    pub num_symbols: u64,
}

/// Certificate of one blob in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCertificate {
    /// Header, absent in malformed input.
    pub header: Option<BlobHeader>,
}

/// Certificates dispersed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispersalBatch {
    /// Certificates of the batch.
    pub certificates: Vec<BlobCertificate>,
}

/// Reservation usage recorded for one account by a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCharge {
    /// Account charged.
    pub account: Address,
    /// Usage recorded.
    pub charge: ReservationCharge,
}

/// Aggregated usage of one `(account, quorum, period)`.
#[derive(Debug, Clone)]
struct UsageRequest {
    timestamp_ns: i64,
    symbols: u64,
}

type UsageKey = (Address, QuorumId, u64);
type SharedRecords = Arc<RwLock<QuorumPeriodRecords>>;

/// Ledger metering batches against reservations only.
pub struct BatchLedger {
    chain: Arc<OnchainPaymentState>,
    num_bins: usize,
    accounts: RwLock<HashMap<Address, SharedRecords>>,
    commit: Mutex<()>,
}

impl std::fmt::Debug for BatchLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLedger")
            .field("num_bins", &self.num_bins)
            .field("accounts", &self.accounts.read().len())
            .finish_non_exhaustive()
    }
}

impl BatchLedger {
    /// Empty ledger reading reservations through `chain`.
    #[must_use]
    pub fn new(chain: Arc<OnchainPaymentState>, num_bins: usize) -> Self {
        Self {
            chain,
            num_bins,
            accounts: RwLock::new(HashMap::new()),
            commit: Mutex::new(()),
        }
    }

    /// Charge every blob of `batch` to its account's reservations, or
    /// nothing at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Batch`] with the code of the first failure.
    pub async fn meter_batch(
        &self,
        batch: &DispersalBatch,
        received_at_ns: i64,
    ) -> Result<Vec<BatchCharge>> {
        let params = self
            .chain
            .params()
            .await
            .map_err(|e| Error::batch(BatchErrorCode::PaymentParamsFailed, e.to_string()))?;
        let usage = parse_batch(batch, &params)?;

        let mut quorums_by_account: BTreeMap<Address, Vec<QuorumId>> = BTreeMap::new();
        for (account, quorum, _) in usage.keys() {
            let quorums = quorums_by_account.entry(*account).or_default();
            if !quorums.contains(quorum) {
                quorums.push(*quorum);
            }
        }
        let mut reservations = HashMap::with_capacity(quorums_by_account.len());
        for (account, quorums) in &quorums_by_account {
            let found = self
                .chain
                .reserved_payments_for_quorums(*account, quorums)
                .await
                .map_err(|e| {
                    Error::batch(
                        BatchErrorCode::ReservationLookupFailed,
                        format!("account {account}: {e}"),
                    )
                })?;
            reservations.insert(*account, found);
        }

        self.commit_usage(&usage, &reservations, &params, received_at_ns)
    }

    /// Usage recorded for `account` on `quorum` in period number `index`.
    #[must_use]
    pub fn usage(&self, account: Address, quorum: QuorumId, index: u32) -> u64 {
        self.accounts
            .read()
            .get(&account)
            .map_or(0, |records| records.read().usage(quorum, index))
    }

    /// Copy of the bins of `account`, if the ledger has charged it.
    #[must_use]
    pub fn period_records(&self, account: Address) -> Option<QuorumPeriodRecords> {
        self.accounts
            .read()
            .get(&account)
            .map(|records| records.read().clone())
    }

    fn commit_usage(
        &self,
        usage: &BTreeMap<UsageKey, UsageRequest>,
        reservations: &HashMap<Address, BTreeMap<QuorumId, ReservedPayment>>,
        params: &PaymentVaultParams,
        received_at_ns: i64,
    ) -> Result<Vec<BatchCharge>> {
        let _commit = self.commit.lock();

        let mut candidates: BTreeMap<Address, (SharedRecords, QuorumPeriodRecords)> =
            BTreeMap::new();
        let mut charges = Vec::with_capacity(usage.len());
        for ((account, quorum, period), request) in usage {
            let (_, records) = candidates.entry(*account).or_insert_with(|| {
                let shared = self.records_of(*account);
                let copy = shared.read().clone();
                (shared, copy)
            });
            let reservation = reservations
                .get(account)
                .and_then(|r| r.get(quorum))
                .ok_or_else(|| {
                    Error::batch(
                        BatchErrorCode::ReservationNotFound,
                        format!("account {account} has no reservation for quorum {quorum}"),
                    )
                })?;
            if !reservation.is_active_at_ns(received_at_ns) {
                return Err(Error::batch(
                    BatchErrorCode::ReservationInactive,
                    format!("account {account} quorum {quorum}"),
                ));
            }
            let plan = plan_reservation_charge(
                params,
                reservation,
                *quorum,
                request.timestamp_ns,
                request.symbols,
            )
            .map_err(|e| Error::batch(BatchErrorCode::PaymentParamsFailed, e.to_string()))?;
            let window = params
                .protocol_config(*quorum)
                .map(|c| c.reservation_rate_limit_window)
                .map_err(|e| Error::batch(BatchErrorCode::PaymentParamsFailed, e.to_string()))?;
            if !validate_reservation_period(reservation, *period, window, received_at_ns) {
                return Err(Error::batch(
                    BatchErrorCode::ReservationPeriodInvalid,
                    format!("account {account} quorum {quorum} period {period}"),
                ));
            }

            let charge = apply_charge(records, &plan).map_err(|e| {
                let code = batch_code(&e);
                Error::batch(code, format!("account {account}: {e}"))
            })?;
            charges.push(BatchCharge {
                account: *account,
                charge,
            });
        }

        for (shared, records) in candidates.into_values() {
            *shared.write() = records;
        }
        debug!("Metered batch of {} usage entries", charges.len());
        Ok(charges)
    }

    fn records_of(&self, account: Address) -> SharedRecords {
        if let Some(records) = self.accounts.read().get(&account) {
            return Arc::clone(records);
        }
        Arc::clone(
            self.accounts
                .write()
                .entry(account)
                .or_insert_with(|| Arc::new(RwLock::new(QuorumPeriodRecords::with_num_bins(self.num_bins)))),
        )
    }
}

fn parse_batch(
    batch: &DispersalBatch,
    params: &PaymentVaultParams,
) -> Result<BTreeMap<UsageKey, UsageRequest>> {
    if batch.certificates.is_empty() {
        return Err(Error::batch(BatchErrorCode::BatchEmpty, "batch has no certificates"));
    }
    let mut usage: BTreeMap<UsageKey, UsageRequest> = BTreeMap::new();
    for (i, cert) in batch.certificates.iter().enumerate() {
        let header = cert.header.as_ref().ok_or_else(|| {
            Error::batch(BatchErrorCode::BlobHeaderNil, format!("certificate {i} has no header"))
        })?;
        for quorum in &header.quorum_numbers {
            let protocol = params
                .protocol_config(*quorum)
                .map_err(|e| Error::batch(BatchErrorCode::PaymentParamsFailed, e.to_string()))?;
            let window = protocol.reservation_rate_limit_window;
            if window == 0 {
                return Err(Error::batch(
                    BatchErrorCode::PaymentParamsFailed,
                    format!("invalid zero reservation rate limit window for quorum {quorum}"),
                ));
            }
            let period = reservation_period_by_ns(header.timestamp_ns, window);
            let symbols = symbols_charged(header.num_symbols, protocol.min_num_symbols);
            let entry = usage
                .entry((header.account_id, *quorum, period))
                .or_insert(UsageRequest {
                    timestamp_ns: header.timestamp_ns,
                    symbols: 0,
                });
            entry.symbols = entry.symbols.saturating_add(symbols);
        }
    }
    Ok(usage)
}

fn batch_code(err: &Error) -> BatchErrorCode {
    match err {
        Error::UsageExceedsBinLimit { .. } => BatchErrorCode::UsageExceedsLimit,
        Error::OverflowBinOccupied { .. } => BatchErrorCode::OverflowPeriodLimit,
        Error::OverflowBeyondReservation { .. } => BatchErrorCode::OverflowWindowLimit,
        Error::PeriodSuperseded { .. } => BatchErrorCode::ReservationPeriodInvalid,
        Error::Config(_) => BatchErrorCode::PaymentParamsFailed,
        _ => BatchErrorCode::BinAlreadyFull,
    }
}
