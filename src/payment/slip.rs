//! Validated debit requests.

use crate::error::{Error, Result};
use crate::payment::logic::unix_now_ns;
use crate::payment::types::QuorumId;
use alloy_primitives::Address;
use std::collections::HashSet;

/// One unit of chargeable work: `num_symbols` dispersed to `quorum_numbers`
/// on behalf of `account`.
///
/// Only constructible through [`DebitSlip::new`] or
/// [`DebitSlip::with_received_at`], which reject malformed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitSlip {
    account: Address,
    timestamp_ns: i64,
    num_symbols: u64,
    quorum_numbers: Vec<QuorumId>,
    received_at_ns: i64,
    request_id: u64,
}

impl DebitSlip {
    /// Slip received now.
    ///
    /// # Errors
    ///
    /// See [`DebitSlip::with_received_at`].
    pub fn new(
        account: Address,
        timestamp_ns: i64,
        num_symbols: u64,
        quorum_numbers: Vec<QuorumId>,
    ) -> Result<Self> {
        Self::with_received_at(account, timestamp_ns, num_symbols, quorum_numbers, unix_now_ns())
    }

    /// Slip with an explicit receive time.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero account, a non-positive
    /// timestamp, zero symbols, or an empty or duplicated quorum list.
    pub fn with_received_at(
        account: Address,
        timestamp_ns: i64,
        num_symbols: u64,
        quorum_numbers: Vec<QuorumId>,
        received_at_ns: i64,
    ) -> Result<Self> {
        if account.is_zero() {
            return Err(Error::InvalidRequest("account id is the zero address".into()));
        }
        if timestamp_ns <= 0 {
            return Err(Error::InvalidRequest(format!(
                "timestamp must be positive, got {timestamp_ns}"
            )));
        }
        if received_at_ns <= 0 {
            return Err(Error::InvalidRequest(format!(
                "receive time must be positive, got {received_at_ns}"
            )));
        }
        if num_symbols == 0 {
            return Err(Error::InvalidRequest("number of symbols is zero".into()));
        }
        if quorum_numbers.is_empty() {
            return Err(Error::InvalidRequest(
                "no quorum numbers provided in the request".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(quorum_numbers.len());
        if let Some(dup) = quorum_numbers.iter().find(|q| !seen.insert(**q)) {
            return Err(Error::InvalidRequest(format!("duplicate quorum number {dup}")));
        }

        Ok(Self {
            account,
            timestamp_ns,
            num_symbols,
            quorum_numbers,
            received_at_ns,
            request_id: rand::random(),
        })
    }

    /// Account being charged.
    #[must_use]
    pub const fn account(&self) -> Address {
        self.account
    }

    /// Client-stated request time, unix nanoseconds.
    #[must_use]
    pub const fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    /// Symbols to disperse, before billing quantization.
    #[must_use]
    pub const fn num_symbols(&self) -> u64 {
        self.num_symbols
    }

    /// Quorums the blob is dispersed to.
    #[must_use]
    pub fn quorum_numbers(&self) -> &[QuorumId] {
        &self.quorum_numbers
    }

    /// When the request reached this process, unix nanoseconds.
    #[must_use]
    pub const fn received_at_ns(&self) -> i64 {
        self.received_at_ns
    }

    /// Random identifier for log correlation.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }
}
