//! Configuration for saorsa-ledger.

use crate::payment::MIN_NUM_BINS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Durable metering store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory of the RocksDB database.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Deadline for a single read, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Deadline for a single write, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Most keys a single multi-key call may touch.
    #[serde(default = "default_max_batch_keys")]
    pub max_batch_keys: usize,
}

impl StoreConfig {
    /// Read deadline as a [`Duration`].
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write deadline as a [`Duration`].
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_batch_keys: default_max_batch_keys(),
        }
    }
}

/// Global on-demand token bucket.
///
/// A zero rate disables the bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDemandMeterConfig {
    /// Sustained network-wide on-demand rate.
    #[serde(default)]
    pub global_symbols_per_second: u64,

    /// Burst capacity, expressed in seconds of the sustained rate.
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
}

impl Default for OnDemandMeterConfig {
    fn default() -> Self {
        Self {
            global_symbols_per_second: 0,
            burst_window_secs: default_burst_window_secs(),
        }
    }
}

impl OnDemandMeterConfig {
    /// Whether the bucket should be built at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.global_symbols_per_second > 0
    }
}

/// Chain reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Deadline for a single chain read, in seconds.
    #[serde(default = "default_chain_read_timeout")]
    pub read_timeout_secs: u64,

    /// How often cached chain state is refreshed, in seconds.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
}

impl ChainConfig {
    /// Read deadline as a [`Duration`].
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Refresh period as a [`Duration`].
    #[must_use]
    pub const fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_chain_read_timeout(),
            update_interval_secs: default_update_interval(),
        }
    }
}

/// Meterer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetererConfig {
    /// Ring depth of period records per quorum.
    #[serde(default = "default_min_num_bins")]
    pub min_num_bins: usize,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Durable store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Global on-demand throughput limiter.
    #[serde(default)]
    pub on_demand: OnDemandMeterConfig,

    /// Chain state cache.
    #[serde(default)]
    pub chain: ChainConfig,
}

impl Default for MetererConfig {
    fn default() -> Self {
        Self {
            min_num_bins: default_min_num_bins(),
            log_level: default_log_level(),
            store: StoreConfig::default(),
            on_demand: OnDemandMeterConfig::default(),
            chain: ChainConfig::default(),
        }
    }
}

impl MetererConfig {
    /// Create a development configuration preset.
    ///
    /// Keeps the store in a local directory and refreshes chain state often.
    #[must_use]
    pub fn development() -> Self {
        Self {
            store: StoreConfig {
                path: PathBuf::from(".saorsa-ledger/metering"),
                ..StoreConfig::default()
            },
            chain: ChainConfig {
                read_timeout_secs: 2,
                update_interval_secs: 5,
            },
            log_level: "debug".to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "saorsa-ledger").map_or_else(
        || PathBuf::from(".saorsa-ledger/metering"),
        |dirs| dirs.data_dir().join("metering"),
    )
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_min_num_bins() -> usize {
    MIN_NUM_BINS
}

const fn default_read_timeout_ms() -> u64 {
    2_000
}

const fn default_write_timeout_ms() -> u64 {
    5_000
}

const fn default_max_batch_keys() -> usize {
    100
}

const fn default_burst_window_secs() -> u64 {
    5
}

const fn default_chain_read_timeout() -> u64 {
    5
}

const fn default_update_interval() -> u64 {
    60
}
