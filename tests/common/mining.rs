use std::time::Duration;

use epochash::protocol::consensus::difficulty::meets_target;
use epochash::protocol::consensus::difficulty::target_for;
use epochash::BlockNonce;
use epochash::Header;
use epochash::PowEngine;
use epochash::Solution;

/// Upper bound on how long any seal in these tests may take.
pub const SEAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Find a valid seal for `header` by brute force, the way an external miner
/// would. Only sensible for test-mode engines and small difficulties.
pub fn solve(engine: &PowEngine, header: &Header) -> Solution {
    let dataset = engine
        .epoch_store()
        .dataset(header.epoch(), true)
        .expect("dataset generation");
    let target = target_for(header).expect("positive difficulty");
    let seal_hash = header.seal_hash();

    (0u64..)
        .find_map(|nonce| {
            let nonce = BlockNonce(nonce);
            let (mix_digest, result) = dataset.compute(&seal_hash, nonce)?;
            meets_target(&result, &target).then_some(Solution { nonce, mix_digest })
        })
        .expect("a nonce below target")
}

/// Same as [`solve`], but returns a seal that fails the target.
pub fn solve_wrongly(engine: &PowEngine, header: &Header) -> Solution {
    let dataset = engine
        .epoch_store()
        .dataset(header.epoch(), true)
        .expect("dataset generation");
    let target = target_for(header).expect("positive difficulty");
    let seal_hash = header.seal_hash();

    (0u64..)
        .find_map(|nonce| {
            let nonce = BlockNonce(nonce);
            let (mix_digest, result) = dataset.compute(&seal_hash, nonce)?;
            (!meets_target(&result, &target)).then_some(Solution { nonce, mix_digest })
        })
        .expect("a nonce above target")
}
