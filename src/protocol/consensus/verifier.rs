use std::time::Duration;

use tracing::trace;

use super::difficulty::meets_target;
use super::difficulty::target_for;
use super::header::Header;
use crate::application::config::pow_config::PowConfig;
use crate::application::config::pow_mode::PowMode;
use crate::error::PowError;
use crate::state::epoch_store::EpochStore;

/// Checks header seals. Which variant is in use is fixed when the engine is
/// built from its [`PowConfig`].
#[derive(Debug, Clone)]
pub enum Verifier {
    /// Recompute the hash over the epoch's cache or dataset.
    Hashing { store: EpochStore },

    /// Accept everything, except the block numbered `fail_at`, optionally
    /// after sleeping for `delay`.
    Fake {
        fail_at: Option<u64>,
        delay: Option<Duration>,
    },

    /// Accept everything immediately.
    FullFake,
}

impl Verifier {
    pub fn new(config: &PowConfig, store: EpochStore) -> Self {
        match config.pow_mode {
            PowMode::Normal | PowMode::Test => Self::Hashing { store },
            PowMode::Fake => Self::Fake {
                fail_at: config.fake_fail,
                delay: config.fake_delay,
            },
            PowMode::FullFake => Self::FullFake,
        }
    }

    pub fn is_hashing(&self) -> bool {
        matches!(self, Self::Hashing { .. })
    }

    /// Verify that `header` carries a valid proof-of-work.
    ///
    /// With `full` the epoch's dataset is used once it has been generated,
    /// and its generation is started otherwise; until then, and always
    /// without `full`, the hash is recomputed from the cache.
    pub fn verify(&self, header: &Header, full: bool) -> Result<(), PowError> {
        let store = match self {
            Self::FullFake => return Ok(()),
            Self::Fake { fail_at, delay } => {
                if let Some(delay) = delay {
                    std::thread::sleep(*delay);
                }
                if *fail_at == Some(header.number) {
                    return Err(PowError::FakeFailure(header.number));
                }
                return Ok(());
            }
            Self::Hashing { store } => store,
        };

        let target = target_for(header)?;
        let epoch = header.epoch();
        let seal_hash = header.seal_hash();

        let from_dataset = if full {
            store.dataset(epoch, false)?.compute(&seal_hash, header.nonce)
        } else {
            None
        };
        let (mix_digest, result) = match from_dataset {
            Some(hashes) => hashes,
            None => store.cache(epoch)?.compute(&seal_hash, header.nonce),
        };

        if mix_digest != header.mix_digest {
            trace!(
                "Mix digest mismatch for block {}: have {}, want {}",
                header.number,
                header.mix_digest,
                mix_digest
            );
            return Err(PowError::InvalidMixDigest);
        }
        if !meets_target(&result, &target) {
            return Err(PowError::DifficultyTooHigh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::protocol::consensus::hash::BlockNonce;
    use crate::protocol::consensus::hash::Hash256;
    use crate::protocol::consensus::header::Solution;

    fn test_verifier() -> (Verifier, EpochStore) {
        let config = PowConfig::test();
        let store = EpochStore::new(&config);
        (Verifier::new(&config, store.clone()), store)
    }

    /// Brute-force a seal for an easy header.
    fn seal(store: &EpochStore, header: &Header) -> Header {
        let cache = store.cache(header.epoch()).unwrap();
        let target = target_for(header).unwrap();
        let seal_hash = header.seal_hash();
        (0u64..)
            .find_map(|nonce| {
                let (mix_digest, result) = cache.compute(&seal_hash, BlockNonce(nonce));
                meets_target(&result, &target).then(|| {
                    header.with_seal(Solution {
                        nonce: BlockNonce(nonce),
                        mix_digest,
                    })
                })
            })
            .unwrap()
    }

    #[test]
    fn sealed_header_passes_light_and_full() {
        let (verifier, store) = test_verifier();
        let sealed = seal(&store, &Header::new(1, 100u32));

        verifier.verify(&sealed, false).unwrap();
        verifier.verify(&sealed, true).unwrap();
        store.dataset(0, true).unwrap();
        verifier.verify(&sealed, true).unwrap();
    }

    #[test]
    fn wrong_mix_digest_is_reported_first() {
        let (verifier, store) = test_verifier();
        let mut sealed = seal(&store, &Header::new(1, 100u32));
        sealed.mix_digest = Hash256::keccak(b"bogus");
        assert!(verifier.verify(&sealed, false).unwrap_err().is_invalid_mix_digest());
    }

    #[test]
    fn correct_mix_but_hash_above_target() {
        let (verifier, store) = test_verifier();
        // target of 2: practically no hash passes
        let header = Header::new(1, num_bigint::BigUint::from(1u8) << 255u32);
        let (mix_digest, _) = store
            .cache(0)
            .unwrap()
            .compute(&header.seal_hash(), BlockNonce(0));
        let sealed = header.with_seal(Solution {
            nonce: BlockNonce(0),
            mix_digest,
        });

        assert!(verifier.verify(&sealed, false).unwrap_err().is_difficulty_too_high());
    }

    #[test]
    fn zero_difficulty_is_rejected() {
        let (verifier, _) = test_verifier();
        let header = Header::new(1, 0u32);
        assert!(verifier.verify(&header, false).unwrap_err().is_invalid_difficulty());
    }

    #[test]
    fn fake_modes() {
        let header = Header::new(12, 0u32);
        let store = EpochStore::new(&PowConfig::fake());

        Verifier::new(&PowConfig::full_fake(), store.clone())
            .verify(&header, true)
            .unwrap();
        Verifier::new(&PowConfig::fake(), store.clone())
            .verify(&header, true)
            .unwrap();

        let failer = Verifier::new(&PowConfig::fake_failer(12), store.clone());
        assert!(matches!(failer.verify(&header, false), Err(PowError::FakeFailure(12))));
        failer.verify(&Header::new(13, 0u32), false).unwrap();

        let delayer = Verifier::new(&PowConfig::fake_delayer(Duration::from_millis(30)), store);
        let start = Instant::now();
        delayer.verify(&header, false).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!delayer.is_hashing());
    }
}
