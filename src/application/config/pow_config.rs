use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::pow_mode::PowMode;

/// Number of worker threads used when nothing else is configured.
pub fn default_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| i32::try_from(n.get()).unwrap_or(i32::MAX))
        .unwrap_or(1)
}

/// Knobs for the proof-of-work engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowConfig {
    /// Local sealing threads. Zero or negative disables local sealing; work
    /// is still handed to remote miners.
    pub threads: i32,

    pub caches_in_mem: usize,
    pub caches_on_disk: usize,
    pub cache_dir: Option<PathBuf>,

    pub datasets_in_mem: usize,
    pub datasets_on_disk: usize,
    /// Where dataset files go. Falls back to `cache_dir`.
    pub dataset_dir: Option<PathBuf>,

    pub pow_mode: PowMode,

    /// Accept remote solutions for a known seal hash without checking them.
    pub remote_no_verify: bool,

    /// Remote hashrate reports older than this are ignored.
    pub hashrate_expiry: Duration,

    /// `Fake` mode only: reject the header with this block number.
    pub fake_fail: Option<u64>,
    /// `Fake` mode only: sleep this long in every verification.
    pub fake_delay: Option<Duration>,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            caches_in_mem: 2,
            caches_on_disk: 3,
            cache_dir: None,
            datasets_in_mem: 1,
            datasets_on_disk: 2,
            dataset_dir: None,
            pow_mode: PowMode::Normal,
            remote_no_verify: false,
            hashrate_expiry: Duration::from_secs(10),
            fake_fail: None,
            fake_delay: None,
        }
    }
}

impl PowConfig {
    /// Small in-memory configuration running real hashes over tiny buffers.
    pub fn test() -> Self {
        Self {
            caches_in_mem: 1,
            caches_on_disk: 0,
            datasets_in_mem: 1,
            datasets_on_disk: 0,
            pow_mode: PowMode::Test,
            ..Self::default()
        }
    }

    pub fn fake() -> Self {
        Self {
            caches_on_disk: 0,
            datasets_on_disk: 0,
            pow_mode: PowMode::Fake,
            ..Self::default()
        }
    }

    pub fn full_fake() -> Self {
        Self {
            pow_mode: PowMode::FullFake,
            ..Self::fake()
        }
    }

    /// Fake engine that rejects block `number` and accepts everything else.
    pub fn fake_failer(number: u64) -> Self {
        Self {
            fake_fail: Some(number),
            ..Self::fake()
        }
    }

    /// Fake engine that stalls every verification for `delay`.
    pub fn fake_delayer(delay: Duration) -> Self {
        Self {
            fake_delay: Some(delay),
            ..Self::fake()
        }
    }

    pub fn dataset_dir(&self) -> Option<PathBuf> {
        self.dataset_dir.clone().or_else(|| self.cache_dir.clone())
    }

    /// Local sealing thread count, or `None` when local sealing is off.
    pub fn local_threads(&self) -> Option<usize> {
        usize::try_from(self.threads).ok().filter(|n| *n > 0)
    }
}
