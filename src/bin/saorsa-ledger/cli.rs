//! CLI definition for saorsa-ledger.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and configure a metering store.
#[derive(Parser, Debug)]
#[command(name = "saorsa-ledger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, env = "SAORSA_LEDGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Metering store directory (overrides the config file).
    #[arg(long, env = "SAORSA_LEDGER_STORE")]
    pub store_path: Option<PathBuf>,

    /// Log level.
    #[arg(long, default_value = "info", env = "SAORSA_LEDGER_LOG_LEVEL")]
    pub log_level: String,

    /// Command to run.
    #[command(subcommand)]
    pub command: LedgerCommand,
}

/// Ledger commands.
#[derive(Subcommand, Debug)]
pub enum LedgerCommand {
    /// Write a default configuration file.
    InitConfig {
        /// Output path.
        #[arg(long, default_value = "saorsa-ledger.toml")]
        out: PathBuf,
        /// Use the development preset.
        #[arg(long)]
        development: bool,
    },
    /// Print stored usage of one reservation bin.
    BinUsage {
        /// Account address (0x-prefixed hex).
        account: String,
        /// Quorum number.
        #[arg(long)]
        quorum: u8,
        /// Floor-aligned period start, unix seconds.
        #[arg(long)]
        period: u64,
    },
    /// Print the stored cumulative on-demand payment of an account.
    Payment {
        /// Account address (0x-prefixed hex).
        account: String,
    },
    /// Print usage of the global on-demand bin.
    GlobalUsage {
        /// Floor-aligned period start, unix seconds.
        #[arg(long)]
        period: u64,
    },
    /// Decode a hex-encoded account state bundle to JSON.
    DecodeState {
        /// Hex-encoded bincode bundle.
        bundle: String,
    },
}
