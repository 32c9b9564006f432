//! # saorsa-ledger
//!
//! Admission control and billing for blob dispersal.
//!
//! Every dispersal is paid for by one of two methods:
//! - **Reservation**: pre-paid symbols per second on each quorum, enforced
//!   per period bin with a one-shot overflow two periods ahead
//! - **On-demand**: a cumulative payment bounded by the on-chain deposit
//!
//! ## Architecture
//!
//! - [`ledger::LocalAccountLedger`] keeps one account's state in memory
//! - [`ledger::ServerAccountLedger`] records usage through a
//!   [`storage::MeteringStore`] with conditional writes
//! - [`ledger::ServerLedger`] caches server ledgers and applies the global
//!   on-demand limits
//! - [`ledger::BatchLedger`] charges whole batches against reservations, all
//!   or nothing
//!
//! ## Example
//!
//! ```rust,no_run
//! use saorsa_ledger::chain::{InMemoryPaymentVault, OnchainPaymentState};
//! use saorsa_ledger::ledger::ServerLedger;
//! use saorsa_ledger::storage::MemoryMeteringStore;
//! use saorsa_ledger::{DebitSlip, MetererConfig, PaymentVaultParams};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MetererConfig::default();
//!     let vault = Arc::new(InMemoryPaymentVault::new(PaymentVaultParams::default()));
//!     let chain = Arc::new(OnchainPaymentState::new(vault, &config.chain));
//!     let ledger = ServerLedger::new(&config, Arc::new(MemoryMeteringStore::default()), chain)?;
//!
//!     let slip = DebitSlip::new(alloy_primitives::Address::repeat_byte(1), 1, 64, vec![0])?;
//!     let outcome = ledger.debit(&slip).await?;
//!     println!("paid with {:?}", outcome.payment());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payment;
pub mod storage;
pub mod wire;

pub use config::{ChainConfig, MetererConfig, OnDemandMeterConfig, StoreConfig};
pub use error::{BatchErrorCode, Error, ErrorClass, Result, RetryHint};
pub use ledger::{AccountLedger, DebitOutcome, OverflowCharge, ReservationCharge};
pub use payment::{
    AccountState, DebitSlip, OnDemandPayment, PaymentQuorumConfig, PaymentQuorumProtocolConfig,
    PaymentVaultParams, QuorumId, ReservedPayment,
};
pub use wire::AccountStateBundle;
