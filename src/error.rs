use std::io;

/// Errors surfaced by the PoW engine.
///
/// Remote-mining rejections are not errors: `submit_work` and
/// `submit_hashrate` report them through their boolean return value.
#[derive(Debug, thiserror::Error, strum::EnumIs)]
#[non_exhaustive]
pub enum PowError {
    #[error("no mining work available yet")]
    NoMiningWork,

    #[error("pow engine is stopped")]
    EngineStopped,

    #[error("invalid mix digest")]
    InvalidMixDigest,

    #[error("invalid proof-of-work: hash is not below target")]
    DifficultyTooHigh,

    #[error("non-positive difficulty")]
    InvalidDifficulty,

    #[error("epoch {0} is beyond the last supported epoch")]
    EpochOutOfRange(u64),

    #[error("fake failure at block {0}")]
    FakeFailure(u64),

    #[error("failed to generate {what} for epoch {epoch}: {source}")]
    GenerationFailed {
        what: &'static str,
        epoch: u64,
        #[source]
        source: io::Error,
    },
}
