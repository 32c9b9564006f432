//! End-to-end tests for saorsa-ledger.
//!
//! ```text
//! harness
//!     ├── chain: InMemoryPaymentVault + OnchainPaymentState
//!     ├── stores: MemoryMeteringStore | RocksMeteringStore (tempdir)
//!     └── fixtures: params, slips, accounts
//! ```
//!
//! Every test builds its own ledgers; nothing is shared between tests.

#![allow(clippy::expect_used)]

mod batch;
mod concurrency;
mod harness;
mod rocks_flow;
mod scenario;
