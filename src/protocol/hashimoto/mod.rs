//! The memory-hard hash behind the proof-of-work.
//!
//! A per-epoch cache is expanded from a seed hash chain. Each 64-byte
//! dataset row is a pure function of the cache, so a verifier holding only
//! the cache computes exactly what a miner holding the whole dataset does,
//! just much slower.

mod sizes;

use rayon::prelude::*;

pub use sizes::cache_size;
pub use sizes::dataset_size;
pub use sizes::TEST_CACHE_SIZE;
pub use sizes::TEST_DATASET_SIZE;

use crate::error::PowError;
use crate::protocol::consensus::hash::keccak256;
use crate::protocol::consensus::hash::keccak512;
use crate::protocol::consensus::hash::BlockNonce;
use crate::protocol::consensus::hash::Hash256;

/// Blocks per epoch.
pub const EPOCH_LENGTH: u64 = 30_000;

/// Last epoch with a defined cache and dataset.
pub const MAX_EPOCH: u64 = 2048;

/// Bytes in a cache row and in a dataset row.
pub(crate) const HASH_BYTES: usize = 64;
/// Bytes in a mix page (two dataset rows).
pub(crate) const MIX_BYTES: usize = 128;

const HASH_WORDS: usize = HASH_BYTES / 4;
const MIX_WORDS: usize = MIX_BYTES / 4;
const DATASET_PARENTS: u32 = 256;
const CACHE_ROUNDS: usize = 3;
const LOOP_ACCESSES: usize = 64;

#[inline(always)]
fn fnv(a: u32, b: u32) -> u32 {
    a.wrapping_mul(0x0100_0193) ^ b
}

#[inline(always)]
fn word(bytes: &[u8], index: usize) -> u32 {
    u32::from_le_bytes([
        bytes[4 * index],
        bytes[4 * index + 1],
        bytes[4 * index + 2],
        bytes[4 * index + 3],
    ])
}

pub fn check_epoch(epoch: u64) -> Result<(), PowError> {
    if epoch > MAX_EPOCH {
        return Err(PowError::EpochOutOfRange(epoch));
    }
    Ok(())
}

/// Seed for `epoch`: Keccak-256 applied `epoch` times to 32 zero bytes.
/// Callers bound `epoch` with [`check_epoch`] first.
pub fn seed_hash(epoch: u64) -> Hash256 {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = keccak256(&seed);
    }
    Hash256(seed)
}

/// Build the verification cache of `size` bytes from `seed`.
pub fn make_cache(size: usize, seed: &Hash256) -> Vec<u8> {
    let rows = size / HASH_BYTES;
    let mut cache = vec![0u8; rows * HASH_BYTES];

    cache[..HASH_BYTES].copy_from_slice(&keccak512(seed.as_bytes()));
    for i in 1..rows {
        let (done, rest) = cache.split_at_mut(i * HASH_BYTES);
        rest[..HASH_BYTES].copy_from_slice(&keccak512(&done[(i - 1) * HASH_BYTES..]));
    }

    // RandMemoHash rounds
    let mut mixed = [0u8; HASH_BYTES];
    for _ in 0..CACHE_ROUNDS {
        for i in 0..rows {
            let src = (i + rows - 1) % rows;
            let xor = word(&cache[i * HASH_BYTES..], 0) as usize % rows;
            for (k, byte) in mixed.iter_mut().enumerate() {
                *byte = cache[src * HASH_BYTES + k] ^ cache[xor * HASH_BYTES + k];
            }
            cache[i * HASH_BYTES..(i + 1) * HASH_BYTES].copy_from_slice(&keccak512(&mixed));
        }
    }
    cache
}

/// Compute dataset row `index` from the cache.
pub fn dataset_item(cache: &[u8], index: u32) -> [u8; HASH_BYTES] {
    let rows = cache.len() / HASH_BYTES;
    let start = (index as usize % rows) * HASH_BYTES;

    let mut row = [0u8; HASH_BYTES];
    row.copy_from_slice(&cache[start..start + HASH_BYTES]);
    let head = word(&row, 0) ^ index;
    row[..4].copy_from_slice(&head.to_le_bytes());
    let row = keccak512(&row);

    let mut mix = [0u32; HASH_WORDS];
    for (i, w) in mix.iter_mut().enumerate() {
        *w = word(&row, i);
    }
    for j in 0..DATASET_PARENTS {
        let parent = fnv(index ^ j, mix[j as usize % HASH_WORDS]) as usize % rows;
        let parent = &cache[parent * HASH_BYTES..(parent + 1) * HASH_BYTES];
        for (k, w) in mix.iter_mut().enumerate() {
            *w = fnv(*w, word(parent, k));
        }
    }

    let mut out = [0u8; HASH_BYTES];
    for (k, w) in mix.iter().enumerate() {
        out[4 * k..4 * k + 4].copy_from_slice(&w.to_le_bytes());
    }
    keccak512(&out)
}

/// Expand the cache into a full dataset of `size` bytes, in parallel.
pub fn generate_dataset(size: usize, cache: &[u8]) -> Vec<u8> {
    let mut dataset = vec![0u8; size - size % HASH_BYTES];
    dataset
        .par_chunks_mut(HASH_BYTES)
        .enumerate()
        .for_each(|(i, row)| row.copy_from_slice(&dataset_item(cache, i as u32)));
    dataset
}

/// Core mixing loop. `lookup` yields dataset row `i`, either computed from
/// the cache or read from a generated dataset.
fn hashimoto<F>(seal_hash: &Hash256, nonce: BlockNonce, size: usize, lookup: F) -> (Hash256, Hash256)
where
    F: Fn(u32) -> [u8; HASH_BYTES],
{
    let pages = (size / MIX_BYTES) as u32;

    let mut seed_input = [0u8; 40];
    seed_input[..32].copy_from_slice(seal_hash.as_bytes());
    seed_input[32..].copy_from_slice(&nonce.0.to_le_bytes());
    let seed = keccak512(&seed_input);
    let seed_head = word(&seed, 0);

    let mut mix = [0u32; MIX_WORDS];
    for (i, w) in mix.iter_mut().enumerate() {
        *w = word(&seed, i % HASH_WORDS);
    }

    for i in 0..LOOP_ACCESSES {
        let page = fnv(i as u32 ^ seed_head, mix[i % MIX_WORDS]) % pages;
        for half in 0..2 {
            let row = lookup(2 * page + half as u32);
            for k in 0..HASH_WORDS {
                let w = &mut mix[half * HASH_WORDS + k];
                *w = fnv(*w, word(&row, k));
            }
        }
    }

    let mut digest = [0u8; 32];
    for (i, chunk) in mix.chunks_exact(4).enumerate() {
        let folded = fnv(fnv(fnv(chunk[0], chunk[1]), chunk[2]), chunk[3]);
        digest[4 * i..4 * i + 4].copy_from_slice(&folded.to_le_bytes());
    }

    let mut result_input = [0u8; HASH_BYTES + 32];
    result_input[..HASH_BYTES].copy_from_slice(&seed);
    result_input[HASH_BYTES..].copy_from_slice(&digest);

    (Hash256(digest), Hash256(keccak256(&result_input)))
}

/// Hash using only the cache. `dataset_size` is the size of the dataset the
/// cache stands in for. Returns `(mix_digest, result)`.
pub fn hashimoto_light(
    dataset_size: usize,
    cache: &[u8],
    seal_hash: &Hash256,
    nonce: BlockNonce,
) -> (Hash256, Hash256) {
    hashimoto(seal_hash, nonce, dataset_size, |i| dataset_item(cache, i))
}

/// Hash using a generated dataset. Returns `(mix_digest, result)`.
pub fn hashimoto_full(dataset: &[u8], seal_hash: &Hash256, nonce: BlockNonce) -> (Hash256, Hash256) {
    hashimoto(seal_hash, nonce, dataset.len(), |i| {
        let start = i as usize * HASH_BYTES;
        let mut row = [0u8; HASH_BYTES];
        row.copy_from_slice(&dataset[start..start + HASH_BYTES]);
        row
    })
}
