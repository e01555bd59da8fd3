//! The remote-mining calls in the hex-string shape external miners speak.

use tracing::debug;

use super::engine::PowEngine;
use crate::error::PowError;
use crate::protocol::consensus::hash::BlockNonce;
use crate::protocol::consensus::hash::Hash256;

#[derive(Debug, Clone)]
pub struct RemoteMiningApi {
    engine: PowEngine,
}

impl RemoteMiningApi {
    pub fn new(engine: PowEngine) -> Self {
        Self { engine }
    }

    /// `[seal hash, seed hash, target, block number]`, all `0x`-prefixed.
    pub async fn get_work(&self) -> Result<[String; 4], PowError> {
        Ok(self.engine.get_work().await?.to_hex_array())
    }

    /// Returns `false` for malformed input as for any other rejection.
    pub async fn submit_work(&self, nonce: &str, seal_hash: &str, mix_digest: &str) -> bool {
        let parsed = (
            nonce.parse::<BlockNonce>(),
            seal_hash.parse::<Hash256>(),
            mix_digest.parse::<Hash256>(),
        );
        let (Ok(nonce), Ok(seal_hash), Ok(mix_digest)) = parsed else {
            debug!("Malformed work submission: {nonce} {seal_hash} {mix_digest}");
            return false;
        };
        self.engine.submit_work(nonce, seal_hash, mix_digest).await
    }

    /// `rate` is a hex quantity; `id` is any hex string up to 32 bytes.
    pub async fn submit_hashrate(&self, rate: &str, id: &str) -> bool {
        let Ok(rate) = u64::from_str_radix(rate.trim_start_matches("0x"), 16) else {
            return false;
        };
        let Ok(id) = Hash256::from_hex_padded(id) else {
            return false;
        };
        self.engine.submit_hashrate(rate, id).await
    }

    pub async fn get_hashrate(&self) -> u64 {
        self.engine.hashrate().await as u64
    }
}
