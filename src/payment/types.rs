//! Payment data model shared by every ledger.
//!
//! Reservation and on-demand parameters are sourced from the payment vault
//! contract and are read-only here; they are replaced wholesale on refresh.

use crate::error::{Error, Result};
use crate::payment::period_record::QuorumPeriodRecords;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Identifier of a quorum.
pub type QuorumId = u8;

/// Quorum whose configuration prices all on-demand traffic.
pub const ON_DEMAND_QUORUM_ID: QuorumId = 0;

/// Pre-paid symbols-per-second entitlement on one quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservedPayment {
    /// Reserved throughput.
    pub symbols_per_second: u64,
    /// First second (unix) the reservation is usable.
    pub start_timestamp: u64,
    /// Last second (unix) the reservation is usable.
    pub end_timestamp: u64,
}

impl ReservedPayment {
    /// Whether the reservation covers `now_sec`, inclusive on both ends.
    #[must_use]
    pub const fn is_active(&self, now_sec: u64) -> bool {
        self.start_timestamp <= now_sec && now_sec <= self.end_timestamp
    }

    /// Whether the reservation covers the given unix nanosecond instant.
    #[must_use]
    pub fn is_active_at_ns(&self, now_ns: i64) -> bool {
        let secs = u64::try_from(now_ns / 1_000_000_000).unwrap_or(0);
        self.is_active(secs)
    }

    /// A zero-rate entry is treated as no reservation at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.symbols_per_second == 0
    }
}

/// On-chain deposit for pay-per-use dispersal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OnDemandPayment {
    /// Total ever deposited; the ceiling for off-chain consumption.
    pub cumulative_payment: U256,
}

impl OnDemandPayment {
    /// Deposit of `amount`.
    #[must_use]
    pub const fn new(amount: U256) -> Self {
        Self {
            cumulative_payment: amount,
        }
    }
}

/// Per-quorum rates and prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentQuorumConfig {
    /// Rate granted to reservations on this quorum.
    pub reservation_symbols_per_second: u64,
    /// Network-wide on-demand rate.
    pub on_demand_symbols_per_second: u64,
    /// Price of one on-demand symbol, in the vault's smallest unit.
    pub on_demand_price_per_symbol: u64,
}

/// Per-quorum protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentQuorumProtocolConfig {
    /// Billing quantum; every charge is rounded up to a multiple of this.
    pub min_num_symbols: u64,
    /// How far ahead of `start_timestamp` a reservation may be bought.
    pub reservation_advance_window: u64,
    /// Width of a reservation bin in seconds.
    pub reservation_rate_limit_window: u64,
    /// Width of the global on-demand bin in seconds.
    pub on_demand_rate_limit_window: u64,
    /// Whether on-demand dispersal is accepted on this quorum.
    pub on_demand_enabled: bool,
}

/// All vault parameters the ledger needs, as one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVaultParams {
    /// Rates and prices by quorum.
    pub quorum_payment_configs: HashMap<QuorumId, PaymentQuorumConfig>,
    /// Protocol parameters by quorum.
    pub quorum_protocol_configs: HashMap<QuorumId, PaymentQuorumProtocolConfig>,
    /// Quorums that accept on-demand payment.
    pub on_demand_quorum_numbers: Vec<QuorumId>,
}

impl PaymentVaultParams {
    /// Protocol parameters for `quorum`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the quorum has no protocol config.
    pub fn protocol_config(&self, quorum: QuorumId) -> Result<&PaymentQuorumProtocolConfig> {
        self.quorum_protocol_configs
            .get(&quorum)
            .ok_or_else(|| Error::Config(format!("protocol config not found for quorum {quorum}")))
    }

    /// Payment and protocol configuration for `quorum`.
    ///
    /// # Errors
    ///
    /// Returns a config error if either half is missing.
    pub fn quorum_configs(
        &self,
        quorum: QuorumId,
    ) -> Result<(&PaymentQuorumConfig, &PaymentQuorumProtocolConfig)> {
        let payment = self
            .quorum_payment_configs
            .get(&quorum)
            .ok_or_else(|| Error::Config(format!("payment config not found for quorum {quorum}")))?;
        Ok((payment, self.protocol_config(quorum)?))
    }

    /// Configuration of the quorum that prices on-demand traffic.
    ///
    /// # Errors
    ///
    /// Returns a config error if [`ON_DEMAND_QUORUM_ID`] is not configured.
    pub fn on_demand_configs(&self) -> Result<(&PaymentQuorumConfig, &PaymentQuorumProtocolConfig)> {
        self.quorum_configs(ON_DEMAND_QUORUM_ID)
    }

    /// Whether `quorum` accepts on-demand payment.
    #[must_use]
    pub fn is_on_demand_quorum(&self, quorum: QuorumId) -> bool {
        self.on_demand_quorum_numbers.contains(&quorum)
            && self
                .quorum_protocol_configs
                .get(&quorum)
                .is_some_and(|c| c.on_demand_enabled)
    }
}

/// Full snapshot of one account's ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    /// Reservations by quorum.
    pub reservations: BTreeMap<QuorumId, ReservedPayment>,
    /// On-chain deposit.
    pub on_demand: OnDemandPayment,
    /// Usage bins by quorum.
    pub period_records: QuorumPeriodRecords,
    /// Off-chain consumed total; never above `on_demand.cumulative_payment`.
    pub cumulative_payment: U256,
}

impl AccountState {
    /// Fresh state with no recorded usage.
    #[must_use]
    pub fn new(
        reservations: BTreeMap<QuorumId, ReservedPayment>,
        on_demand: OnDemandPayment,
        num_bins: usize,
    ) -> Self {
        Self {
            reservations: reservations
                .into_iter()
                .filter(|(_, r)| !r.is_empty())
                .collect(),
            on_demand,
            period_records: QuorumPeriodRecords::with_num_bins(num_bins),
            cumulative_payment: U256::ZERO,
        }
    }

    /// Deposit left for on-demand debits.
    #[must_use]
    pub fn remaining_deposit(&self) -> U256 {
        self.on_demand
            .cumulative_payment
            .saturating_sub(self.cumulative_payment)
    }
}
