use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::PowError;
use crate::protocol::consensus::hash::Hash256;
use crate::protocol::consensus::header::Header;
use crate::protocol::consensus::header::Solution;

/// Identifies one call to `seal`. Restarting the workers of a job (after a
/// thread-count change) keeps its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl JobId {
    /// generates a random JobId
    pub(crate) fn random() -> Self {
        Self(rand::random())
    }
}

/// A header handed to the remote loop when a new seal starts.
#[derive(Debug)]
pub(crate) struct SealJob {
    pub id: JobId,
    pub header: Header,

    /// Receives the sealed header, at most once.
    pub sink: oneshot::Sender<Header>,

    /// Set once `sink` has been used, so local workers can stop early.
    pub delivered: Arc<AtomicBool>,
}

/// Everything the remote sealer loop reacts to.
#[derive(Debug, strum::Display)]
pub(crate) enum RemoteRequest {
    /// A new seal started; it supersedes the current job.
    NewWork(Box<SealJob>),

    /// A local worker found a solution for `job_id`.
    LocalSolution { job_id: JobId, solution: Solution },

    GetWork(oneshot::Sender<Result<RemoteWorkItem, PowError>>),

    SubmitWork {
        seal_hash: Hash256,
        solution: Solution,
        reply: oneshot::Sender<bool>,
    },

    SubmitHashrate {
        id: Hash256,
        rate: u64,
        reply: oneshot::Sender<bool>,
    },

    FetchHashrate(oneshot::Sender<u64>),

    Shutdown,
}

impl RemoteRequest {
    pub(crate) fn get_type(&self) -> &str {
        match self {
            RemoteRequest::NewWork(_) => "new work",
            RemoteRequest::LocalSolution { .. } => "local solution",
            RemoteRequest::GetWork(_) => "get work",
            RemoteRequest::SubmitWork { .. } => "submit work",
            RemoteRequest::SubmitHashrate { .. } => "submit hashrate",
            RemoteRequest::FetchHashrate(_) => "fetch hashrate",
            RemoteRequest::Shutdown => "shutdown",
        }
    }
}

/// A unit of work for an external miner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWorkItem {
    /// What to search nonces over.
    pub seal_hash: Hash256,
    /// Seed of the epoch's cache and dataset.
    pub seed_hash: Hash256,
    /// Boundary the result must stay below, big-endian.
    pub target: Hash256,
    pub number: u64,
}

impl RemoteWorkItem {
    /// The hex form handed out over RPC.
    pub fn to_hex_array(&self) -> [String; 4] {
        [
            self.seal_hash.to_hex(),
            self.seed_hash.to_hex(),
            self.target.to_hex(),
            format!("{:#x}", self.number),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_hex_layout() {
        let item = RemoteWorkItem {
            seal_hash: Hash256([0x11; 32]),
            seed_hash: Hash256::zero(),
            target: Hash256([0xff; 32]),
            number: 30_000,
        };
        let [hash, seed, target, number] = item.to_hex_array();
        assert_eq!(format!("0x{}", "11".repeat(32)), hash);
        assert_eq!(format!("0x{}", "00".repeat(32)), seed);
        assert_eq!(format!("0x{}", "ff".repeat(32)), target);
        assert_eq!("0x7530", number);
    }

    #[test]
    fn job_ids_print_fixed_width() {
        assert_eq!("00000000000000ff", JobId(255).to_string());
    }
}
