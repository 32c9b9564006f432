//! saorsa-ledger CLI entry point.

mod cli;

use alloy_primitives::Address;
use clap::Parser;
use cli::{Cli, LedgerCommand};
use saorsa_ledger::storage::{MeteringStore, RocksMeteringStore};
use saorsa_ledger::{AccountStateBundle, MetererConfig};
use std::str::FromStr;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    debug!("saorsa-ledger v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        LedgerCommand::InitConfig { ref out, development } => {
            let config = if development {
                MetererConfig::development()
            } else {
                MetererConfig::default()
            };
            config.to_file(out)?;
            info!("Wrote configuration to {}", out.display());
        }
        LedgerCommand::BinUsage {
            ref account,
            quorum,
            period,
        } => {
            let account = parse_account(account)?;
            let store = open_store(&cli)?;
            let usage = store.get_period_usages(account, &[(quorum, period)]).await?;
            println!("{}", usage.first().copied().unwrap_or(0));
        }
        LedgerCommand::Payment { ref account } => {
            let account = parse_account(account)?;
            let store = open_store(&cli)?;
            println!("{}", store.get_largest_cumulative_payment(account).await?);
        }
        LedgerCommand::GlobalUsage { period } => {
            let store = open_store(&cli)?;
            println!("{}", store.get_global_bin_usage(period).await?);
        }
        LedgerCommand::DecodeState { ref bundle } => {
            let bytes = hex::decode(bundle.trim_start_matches("0x"))?;
            let bundle = AccountStateBundle::decode(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> color_eyre::Result<MetererConfig> {
    let mut config = match cli.config {
        Some(ref path) => {
            info!("Loading config from {}", path.display());
            MetererConfig::from_file(path)?
        }
        None => MetererConfig::default(),
    };
    if let Some(ref path) = cli.store_path {
        config.store.path.clone_from(path);
    }
    Ok(config)
}

fn open_store(cli: &Cli) -> color_eyre::Result<RocksMeteringStore> {
    let config = load_config(cli)?;
    Ok(RocksMeteringStore::open(&config.store)?)
}

fn parse_account(account: &str) -> color_eyre::Result<Address> {
    Address::from_str(account)
        .map_err(|e| color_eyre::eyre::eyre!("Invalid account address {account}: {e}"))
}
