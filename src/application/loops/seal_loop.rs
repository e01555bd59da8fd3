use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;
use rayon::ThreadPoolBuilder;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::channel::JobId;
use super::channel::RemoteRequest;
use super::channel::SealJob;
use crate::error::PowError;
use crate::protocol::consensus::difficulty::meets_target;
use crate::protocol::consensus::difficulty::target_for;
use crate::protocol::consensus::hash::BlockNonce;
use crate::protocol::consensus::header::Header;
use crate::protocol::consensus::header::Solution;
use crate::protocol::consensus::verifier::Verifier;
use crate::protocol::hashimoto;
use crate::state::epoch_store::EpochStore;
use crate::state::hashrate::HashrateMeter;

/// Nonces tried between two looks at the abort signal.
pub(crate) const CHECK_INTERVAL: u64 = 2048;

/// Lifecycle of the engine's single seal job.
///
/// A superseded job is dropped on the spot, so `Aborted` is only observable
/// once the engine is closed mid-search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIs)]
pub enum SealState {
    Idle,
    Sealing,
    Delivered,
    Aborted,
}

#[derive(Debug)]
struct ActiveSeal {
    job_id: JobId,
    header: Header,
    delivered: Arc<AtomicBool>,
    aborted: bool,
    /// Dropping the sender aborts the workers.
    cancel: Option<watch::Sender<()>>,
    workers: Option<JoinHandle<()>>,
}

impl ActiveSeal {
    fn stop_workers(&mut self) {
        self.cancel = None;
        self.workers = None;
    }
}

#[derive(Debug, Default)]
struct Jobs {
    active: Option<ActiveSeal>,
    /// Set by [`SealCoordinator::abort`]; no job starts afterwards.
    closed: bool,
}

/// Owns the one in-flight seal job and the local worker pool searching it.
#[derive(Debug)]
pub(crate) struct SealCoordinator {
    store: EpochStore,
    verifier: Verifier,
    meter: HashrateMeter,
    to_remote: mpsc::Sender<RemoteRequest>,
    jobs: Mutex<Jobs>,
}

/// Everything a worker batch needs, moved onto a blocking thread.
struct WorkerContext {
    job_id: JobId,
    header: Header,
    threads: usize,
    store: EpochStore,
    verifier: Verifier,
    meter: HashrateMeter,
    to_remote: mpsc::Sender<RemoteRequest>,
    cancel: watch::Receiver<()>,
    delivered: Arc<AtomicBool>,
}

impl SealCoordinator {
    pub(crate) fn new(
        store: EpochStore,
        verifier: Verifier,
        meter: HashrateMeter,
        to_remote: mpsc::Sender<RemoteRequest>,
    ) -> Self {
        Self {
            store,
            verifier,
            meter,
            to_remote,
            jobs: Mutex::new(Jobs::default()),
        }
    }

    /// Make `header` the job being sealed, aborting whatever ran before.
    ///
    /// The sealed header arrives on `sink` if a local worker or a remote
    /// miner solves it before the next call.
    pub(crate) async fn start(
        &self,
        header: Header,
        sink: tokio::sync::oneshot::Sender<Header>,
        threads: Option<usize>,
    ) -> Result<JobId, PowError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.closed {
            return Err(PowError::EngineStopped);
        }
        if let Some(mut previous) = jobs.active.take() {
            debug!("Aborting seal job {}", previous.job_id);
            previous.stop_workers();
        }

        let job_id = JobId::random();
        let delivered = Arc::new(AtomicBool::new(false));
        let job = SealJob {
            id: job_id,
            header: header.clone(),
            sink,
            delivered: delivered.clone(),
        };
        self.to_remote
            .send(RemoteRequest::NewWork(Box::new(job)))
            .await
            .map_err(|_| PowError::EngineStopped)?;

        let mut seal = ActiveSeal {
            job_id,
            header,
            delivered,
            aborted: false,
            cancel: None,
            workers: None,
        };
        if let Some(threads) = threads {
            self.spawn_workers(&mut seal, threads);
        }
        jobs.active = Some(seal);
        Ok(job_id)
    }

    /// Restart the current job's workers with a new thread count, keeping
    /// its id and result channel.
    pub(crate) async fn restart(&self, threads: Option<usize>) {
        let mut jobs = self.jobs.lock().await;
        if jobs.closed {
            return;
        }
        let Some(seal) = jobs.active.as_mut() else {
            return;
        };
        seal.stop_workers();
        if seal.delivered.load(Ordering::Acquire) {
            return;
        }
        match threads {
            Some(threads) => {
                info!("Restarting seal job {} with {threads} thread(s)", seal.job_id);
                self.spawn_workers(seal, threads);
            }
            None => info!("Local sealing disabled for job {}", seal.job_id),
        }
    }

    /// Stop the current job's workers and refuse any later job.
    pub(crate) async fn abort(&self) {
        let mut jobs = self.jobs.lock().await;
        jobs.closed = true;
        if let Some(seal) = jobs.active.as_mut() {
            debug!("Aborting seal job {}", seal.job_id);
            seal.stop_workers();
            seal.aborted = true;
        }
    }

    pub(crate) async fn state(&self) -> SealState {
        match self.jobs.lock().await.active.as_ref() {
            None => SealState::Idle,
            Some(seal) if seal.delivered.load(Ordering::Acquire) => SealState::Delivered,
            Some(seal) if seal.aborted => SealState::Aborted,
            Some(_) => SealState::Sealing,
        }
    }

    fn spawn_workers(&self, seal: &mut ActiveSeal, threads: usize) {
        let (cancel_tx, cancel_rx) = watch::channel(());
        let context = WorkerContext {
            job_id: seal.job_id,
            header: seal.header.clone(),
            threads,
            store: self.store.clone(),
            verifier: self.verifier.clone(),
            meter: self.meter.clone(),
            to_remote: self.to_remote.clone(),
            cancel: cancel_rx,
            delivered: seal.delivered.clone(),
        };
        seal.cancel = Some(cancel_tx);
        seal.workers = Some(tokio::task::spawn_blocking(move || search(context)));
    }
}

/// Search the nonce space with `threads` workers, each on its own slice
/// starting from a random offset. Runs on a blocking thread.
fn search(context: WorkerContext) {
    let WorkerContext {
        job_id,
        header,
        threads,
        store,
        verifier,
        meter,
        to_remote,
        cancel,
        delivered,
    } = context;

    let target = match target_for(&header) {
        Ok(target) => target,
        Err(e) => {
            error!("Cannot seal job {job_id}: {e}");
            return;
        }
    };
    let dataset = match store.dataset(header.epoch(), true) {
        Ok(handle) => handle.buffer(),
        Err(e) => {
            error!("Cannot seal job {job_id}: {e}");
            return;
        }
    };
    let Some(dataset) = dataset else {
        return;
    };

    let pool = match ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("sealer-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("Could not build sealing pool: {e}");
            return;
        }
    };

    info!(
        "Sealing block {} with {threads} thread(s), difficulty {}",
        header.number, header.difficulty
    );

    let seal_hash = header.seal_hash();
    let seed: u64 = rand::random();
    let stride = u64::MAX / threads as u64;
    let found = AtomicBool::new(false);

    let should_stop = || {
        found.load(Ordering::Relaxed)
            || delivered.load(Ordering::Relaxed)
            || !matches!(cancel.has_changed(), Ok(false))
    };

    let solution = pool.install(|| {
        (0..threads as u64).into_par_iter().find_map_any(|slice| {
            let start = seed.wrapping_add(slice.wrapping_mul(stride));
            let mut tried = 0u64;
            for offset in 0..stride {
                if offset % CHECK_INTERVAL == 0 && offset > 0 {
                    meter.mark(CHECK_INTERVAL);
                    tried += CHECK_INTERVAL;
                    if should_stop() {
                        return None;
                    }
                }
                let nonce = BlockNonce(start.wrapping_add(offset));
                let (mix_digest, result) =
                    hashimoto::hashimoto_full(&dataset, &seal_hash, nonce);
                if meets_target(&result, &target) {
                    found.store(true, Ordering::Relaxed);
                    debug!("Slice {slice} found nonce {nonce} after {tried} tries");
                    return Some(Solution { nonce, mix_digest });
                }
            }
            None
        })
    });

    let Some(solution) = solution else {
        if matches!(cancel.has_changed(), Ok(false)) && !delivered.load(Ordering::Relaxed) {
            warn!("Nonce space exhausted for job {job_id}");
        }
        return;
    };

    if let Err(e) = verifier.verify(&header.with_seal(solution), true) {
        error!("Locally found seal for job {job_id} does not verify: {e}");
        return;
    }
    info!("Found nonce {} for block {}", solution.nonce, header.number);
    if to_remote
        .blocking_send(RemoteRequest::LocalSolution { job_id, solution })
        .is_err()
    {
        debug!("Remote sealer gone; dropping solution for job {job_id}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;
    use crate::application::config::pow_config::PowConfig;

    fn coordinator() -> (SealCoordinator, mpsc::Receiver<RemoteRequest>) {
        let config = PowConfig::test();
        let store = EpochStore::new(&config);
        let verifier = Verifier::new(&config, store.clone());
        let (to_remote, from_coordinator) = mpsc::channel(8);
        let coordinator =
            SealCoordinator::new(store, verifier, HashrateMeter::default(), to_remote);
        (coordinator, from_coordinator)
    }

    #[tokio::test]
    async fn abort_marks_the_running_job() {
        let (coordinator, _requests) = coordinator();
        let (sink, _result) = oneshot::channel();
        coordinator
            .start(Header::new(1, 100u32), sink, None)
            .await
            .unwrap();
        assert!(coordinator.state().await.is_sealing());

        coordinator.abort().await;
        assert!(coordinator.state().await.is_aborted());
    }

    #[tokio::test]
    async fn no_job_starts_after_abort() {
        let (coordinator, mut requests) = coordinator();
        coordinator.abort().await;

        // the remote loop may still be draining its queue at this point
        let (sink, mut result) = oneshot::channel();
        let err = coordinator
            .start(Header::new(1, 100u32), sink, Some(2))
            .await
            .unwrap_err();
        assert!(err.is_engine_stopped());
        assert!(coordinator.state().await.is_idle());
        assert!(requests.try_recv().is_err());
        assert!(matches!(
            result.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        coordinator.restart(Some(2)).await;
        assert!(coordinator.state().await.is_idle());
    }
}
