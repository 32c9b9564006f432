//! Transport form of an [`AccountState`].
//!
//! Big integers travel as unsigned big-endian byte strings with no sign byte
//! and leading zeros trimmed; an empty string is zero. Empty ring slots are
//! not sent.

use crate::error::{Error, Result};
use crate::payment::{
    AccountState, OnDemandPayment, PeriodRecord, QuorumId, QuorumPeriodRecords, ReservedPayment,
};
use alloy_primitives::U256;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest bundle accepted by [`AccountStateBundle::decode`].
pub const MAX_BUNDLE_SIZE: u64 = 1024 * 1024;

/// Account state as exchanged with a remote peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStateBundle {
    /// Reservations by quorum.
    #[serde(default)]
    pub reservations: BTreeMap<QuorumId, ReservedPayment>,
    /// Populated period records by quorum.
    #[serde(default)]
    pub period_records: BTreeMap<QuorumId, Vec<PeriodRecord>>,
    /// On-chain deposit, big-endian.
    #[serde(default)]
    pub onchain_cumulative_payment: Vec<u8>,
    /// Off-chain cumulative payment, big-endian.
    #[serde(default)]
    pub cumulative_payment: Vec<u8>,
}

fn bincode_options() -> impl Options {
    bincode::options()
        .with_limit(MAX_BUNDLE_SIZE)
        .allow_trailing_bytes()
}

/// Minimal big-endian bytes of `value`; zero encodes as an empty string.
#[must_use]
pub fn u256_to_be_bytes(value: U256) -> Vec<u8> {
    value.to_be_bytes_trimmed_vec()
}

/// Parse unsigned big-endian bytes; an empty string is zero.
///
/// # Errors
///
/// Returns a serialization error if the value does not fit 256 bits.
pub fn u256_from_be_bytes(bytes: &[u8]) -> Result<U256> {
    if bytes.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::try_from_be_slice(bytes).ok_or_else(|| {
        Error::Serialization(format!("{}-byte integer does not fit 256 bits", bytes.len()))
    })
}

impl From<&AccountState> for AccountStateBundle {
    fn from(state: &AccountState) -> Self {
        let period_records = state
            .period_records
            .quorums()
            .filter_map(|quorum| {
                let records: Vec<PeriodRecord> =
                    state.period_records.records(quorum).copied().collect();
                (!records.is_empty()).then_some((quorum, records))
            })
            .collect();
        Self {
            reservations: state.reservations.clone(),
            period_records,
            onchain_cumulative_payment: u256_to_be_bytes(state.on_demand.cumulative_payment),
            cumulative_payment: u256_to_be_bytes(state.cumulative_payment),
        }
    }
}

impl AccountStateBundle {
    /// Rebuild the account state with `num_bins` slots per quorum.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a payment field exceeds 256 bits.
    pub fn to_account_state(&self, num_bins: usize) -> Result<AccountState> {
        let mut period_records = QuorumPeriodRecords::with_num_bins(num_bins);
        for (quorum, records) in &self.period_records {
            for record in records {
                period_records.insert_record(*quorum, *record);
            }
        }
        Ok(AccountState {
            reservations: self.reservations.clone(),
            on_demand: OnDemandPayment::new(u256_from_be_bytes(&self.onchain_cumulative_payment)?),
            period_records,
            cumulative_payment: u256_from_be_bytes(&self.cumulative_payment)?,
        })
    }

    /// Encode with bincode.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    #[must_use = "encoded bytes must be sent or stored"]
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode_options()
            .serialize(self)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from bincode, capped at [`MAX_BUNDLE_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the input is malformed or too large.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode_options()
            .deserialize(data)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}
