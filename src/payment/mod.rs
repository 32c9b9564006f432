//! Payment model and the arithmetic every ledger shares.
//!
//! A debit is paid for by exactly one of two methods:
//! 1. A reservation: pre-paid symbols per second on each quorum, enforced
//!    with period bins and a one-shot overflow bin
//! 2. On-demand: a cumulative payment that may never pass the on-chain deposit
//!
//! # Period bins
//!
//! ```text
//!  period k-1      period k        period k+1      period k+2
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ previous │   │ current  │   │  buffer  │   │ overflow │
//! └──────────┘   └────┬─────┘   └──────────┘   └────▲─────┘
//!                     │  usage past bin limit         │
//!                     └───────────────────────────────┘
//! ```
//!
//! Requests may address the current or previous period only. Usage that does
//! not fit the current bin spills two periods ahead, once.

pub mod logic;
pub mod meter;
pub mod metrics;
pub mod period_record;
mod slip;
pub mod types;

pub use meter::{DispersalReservation, OnDemandMeterer};
pub use metrics::{MeteringMetrics, MetricsSnapshot};
pub use period_record::{PeriodRecord, QuorumPeriodRecords, UsageUpdate, MIN_NUM_BINS};
pub use slip::DebitSlip;
pub use types::{
    AccountState, OnDemandPayment, PaymentQuorumConfig, PaymentQuorumProtocolConfig,
    PaymentVaultParams, QuorumId, ReservedPayment, ON_DEMAND_QUORUM_ID,
};
