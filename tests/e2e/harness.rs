//! Shared fixtures.

use alloy_primitives::{Address, U256};
use saorsa_ledger::chain::{InMemoryPaymentVault, OnchainPaymentState, PaymentVault};
use saorsa_ledger::ledger::ServerLedger;
use saorsa_ledger::storage::MeteringStore;
use saorsa_ledger::{
    ChainConfig, DebitSlip, MetererConfig, OnDemandPayment, PaymentQuorumConfig,
    PaymentQuorumProtocolConfig, PaymentVaultParams, QuorumId, ReservedPayment,
};
use std::sync::Arc;

pub const SEC: i64 = 1_000_000_000;

/// Unix second 1000 falls in 2s period 1000, period number 500.
pub const NOW: i64 = 1_000 * SEC;

/// Period start of [`NOW`] and of its overflow bin.
pub const PERIOD: u64 = 1_000;
pub const OVERFLOW_PERIOD: u64 = 1_004;

/// Quorums 0 and 1: reservations at 50 symbols/s over 2s windows, on-demand
/// at 2 per symbol with a 200-symbol global bin.
pub fn params() -> PaymentVaultParams {
    let mut params = PaymentVaultParams::default();
    for quorum in [0u8, 1] {
        params.quorum_payment_configs.insert(
            quorum,
            PaymentQuorumConfig {
                reservation_symbols_per_second: 50,
                on_demand_symbols_per_second: 100,
                on_demand_price_per_symbol: 2,
            },
        );
        params.quorum_protocol_configs.insert(
            quorum,
            PaymentQuorumProtocolConfig {
                min_num_symbols: 1,
                reservation_advance_window: 0,
                reservation_rate_limit_window: 2,
                on_demand_rate_limit_window: 2,
                on_demand_enabled: true,
            },
        );
    }
    params.on_demand_quorum_numbers = vec![0, 1];
    params
}

pub fn account(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub fn reservation() -> ReservedPayment {
    ReservedPayment {
        symbols_per_second: 50,
        start_timestamp: 0,
        end_timestamp: 1_000_000,
    }
}

pub fn deposit(amount: u64) -> OnDemandPayment {
    OnDemandPayment::new(U256::from(amount))
}

pub fn slip(account: Address, symbols: u64, quorums: Vec<QuorumId>) -> DebitSlip {
    DebitSlip::with_received_at(account, NOW, symbols, quorums, NOW).expect("valid slip")
}

pub fn vault() -> Arc<InMemoryPaymentVault> {
    Arc::new(InMemoryPaymentVault::new(params()))
}

pub fn chain(vault: &Arc<InMemoryPaymentVault>) -> Arc<OnchainPaymentState> {
    Arc::new(OnchainPaymentState::new(
        Arc::clone(vault) as Arc<dyn PaymentVault>,
        &ChainConfig::default(),
    ))
}

pub fn server_ledger(
    vault: &Arc<InMemoryPaymentVault>,
    store: Arc<dyn MeteringStore>,
) -> ServerLedger {
    ServerLedger::new(&MetererConfig::default(), store, chain(vault)).expect("server ledger")
}
