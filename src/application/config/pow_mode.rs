use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumIter;
use strum::EnumString;

use crate::protocol::hashimoto;

/// Which flavour of proof-of-work the engine runs.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    strum::EnumIs,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PowMode {
    /// Full-size caches and datasets.
    #[default]
    Normal,

    /// Same code paths as `Normal` but with tiny caches and datasets, so that
    /// sealing and verification finish in milliseconds.
    Test,

    /// Skips hashing. Verification accepts every header unless configured to
    /// fail or stall, and sealing returns an all-zero solution.
    Fake,

    /// Like `Fake`, with no failure or delay options honoured and no
    /// caches or datasets ever generated.
    FullFake,
}

impl PowMode {
    /// True when this mode never touches caches or datasets.
    pub fn skips_hashing(&self) -> bool {
        matches!(self, Self::Fake | Self::FullFake)
    }

    pub fn cache_size(&self, epoch: u64) -> usize {
        match self {
            Self::Test => hashimoto::TEST_CACHE_SIZE,
            _ => hashimoto::cache_size(epoch),
        }
    }

    pub fn dataset_size(&self, epoch: u64) -> usize {
        match self {
            Self::Test => hashimoto::TEST_DATASET_SIZE,
            _ => hashimoto::dataset_size(epoch),
        }
    }
}
