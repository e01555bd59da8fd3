use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;

use super::data_directory::DataDirectory;
use super::pow_config::PowConfig;
use super::pow_mode::PowMode;

/// Declarative specification of command-line arguments
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// JSON file holding a full engine configuration. Flags given on the
    /// command line override its values.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory for cache and dataset files. Defaults to the
    /// platform's data directory.
    #[clap(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Proof-of-work mode: `normal`, `test`, `fake` or `full-fake`.
    #[clap(long, global = true)]
    pub pow_mode: Option<PowMode>,

    /// Local sealing threads; 0 or less disables local sealing.
    #[clap(long, global = true, allow_negative_numbers = true)]
    pub threads: Option<i32>,

    /// Verification caches kept in memory.
    #[clap(long, global = true)]
    pub caches_in_mem: Option<usize>,

    /// Verification cache files kept on disk.
    #[clap(long, global = true)]
    pub caches_on_disk: Option<usize>,

    /// Mining datasets kept in memory.
    #[clap(long, global = true)]
    pub datasets_in_mem: Option<usize>,

    /// Mining dataset files kept on disk.
    #[clap(long, global = true)]
    pub datasets_on_disk: Option<usize>,

    /// Forget remote hashrate reports after this long, e.g. `10s` or `1m`.
    #[clap(long, global = true, value_parser = humantime::parse_duration)]
    pub hashrate_expiry: Option<Duration>,

    /// Accept remote solutions without verifying them.
    #[clap(long, global = true)]
    pub remote_no_verify: bool,

    /// Enable tokio tracing for consumption by the tokio-console application
    /// note: this will attempt to connect to localhost:6669
    #[clap(long, name = "tokio-console", default_value = "false")]
    pub tokio_console: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Generate the verification cache for a block's epoch.
    MakeCache {
        /// Any block number inside the wanted epoch.
        block: u64,
        /// Output directory.
        dir: PathBuf,
    },

    /// Generate the mining dataset for a block's epoch.
    MakeDag {
        /// Any block number inside the wanted epoch.
        block: u64,
        /// Output directory.
        dir: PathBuf,
    },

    /// Seal a synthetic header locally and verify the result.
    Mine {
        #[clap(long, default_value = "1")]
        number: u64,

        #[clap(long, default_value = "1000")]
        difficulty: u64,
    },
}

impl Args {
    /// Build the engine configuration: config file first, then flags.
    pub fn pow_config(&self) -> Result<PowConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => PowConfig::default(),
        };

        if let Some(mode) = self.pow_mode {
            config.pow_mode = mode;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(n) = self.caches_in_mem {
            config.caches_in_mem = n;
        }
        if let Some(n) = self.caches_on_disk {
            config.caches_on_disk = n;
        }
        if let Some(n) = self.datasets_in_mem {
            config.datasets_in_mem = n;
        }
        if let Some(n) = self.datasets_on_disk {
            config.datasets_on_disk = n;
        }
        if let Some(expiry) = self.hashrate_expiry {
            config.hashrate_expiry = expiry;
        }
        config.remote_no_verify |= self.remote_no_verify;

        if config.cache_dir.is_none() || self.data_dir.is_some() {
            let data_dir = DataDirectory::get(self.data_dir.clone(), config.pow_mode)?;
            config.cache_dir = Some(data_dir.cache_dir_path());
            config.dataset_dir = Some(data_dir.dataset_dir_path());
        }

        Ok(config)
    }
}
