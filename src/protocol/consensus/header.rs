use num_bigint::BigUint;
use serde::Deserialize;
use serde::Serialize;

use super::hash::BlockNonce;
use super::hash::Hash256;
use crate::protocol::hashimoto::EPOCH_LENGTH;

/// The part of a block header the PoW engine cares about.
///
/// Everything except `mix_digest` and `nonce` is committed to by the
/// [seal hash](Header::seal_hash); those two fields are the seal itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: Hash256,
    pub number: u64,
    pub timestamp: u64,
    pub difficulty: BigUint,
    pub extra: Vec<u8>,
    pub mix_digest: Hash256,
    pub nonce: BlockNonce,
}

/// Borrowed view of the sealed-over fields, in encoding order.
#[derive(Serialize)]
struct SealFields<'a> {
    parent_hash: &'a Hash256,
    number: u64,
    timestamp: u64,
    difficulty: &'a BigUint,
    extra: &'a [u8],
}

/// A nonce and mix digest pair that seals a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Solution {
    pub nonce: BlockNonce,
    pub mix_digest: Hash256,
}

impl Header {
    pub fn new(number: u64, difficulty: impl Into<BigUint>) -> Self {
        Self {
            parent_hash: Hash256::zero(),
            number,
            timestamp: 0,
            difficulty: difficulty.into(),
            extra: vec![],
            mix_digest: Hash256::zero(),
            nonce: BlockNonce::default(),
        }
    }

    /// Hash of the header without its seal. This is what miners search over.
    pub fn seal_hash(&self) -> Hash256 {
        let fields = SealFields {
            parent_hash: &self.parent_hash,
            number: self.number,
            timestamp: self.timestamp,
            difficulty: &self.difficulty,
            extra: &self.extra,
        };
        // serializing plain structs into a Vec cannot fail
        let encoded = bincode::serialize(&fields).unwrap_or_default();
        Hash256::keccak(&encoded)
    }

    pub fn epoch(&self) -> u64 {
        self.number / EPOCH_LENGTH
    }

    pub fn solution(&self) -> Solution {
        Solution {
            nonce: self.nonce,
            mix_digest: self.mix_digest,
        }
    }

    /// Copy of the header carrying the given seal.
    pub fn with_seal(&self, solution: Solution) -> Self {
        Self {
            nonce: solution.nonce,
            mix_digest: solution.mix_digest,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_hash_ignores_the_seal() {
        let header = Header::new(1, 100u32);
        let sealed = header.with_seal(Solution {
            nonce: BlockNonce(42),
            mix_digest: Hash256::keccak(b"mix"),
        });
        assert_eq!(header.seal_hash(), sealed.seal_hash());
        assert_eq!(BlockNonce(42), sealed.nonce);
    }

    #[test]
    fn seal_hash_commits_to_difficulty_and_number() {
        let header = Header::new(1, 100u32);
        assert_ne!(header.seal_hash(), Header::new(1, 1000u32).seal_hash());
        assert_ne!(header.seal_hash(), Header::new(2, 100u32).seal_hash());
    }

    #[test]
    fn epoch_boundaries() {
        assert_eq!(0, Header::new(EPOCH_LENGTH - 1, 1u32).epoch());
        assert_eq!(1, Header::new(EPOCH_LENGTH, 1u32).epoch());
    }
}
