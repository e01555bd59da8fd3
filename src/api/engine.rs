use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::application::config::pow_config::PowConfig;
use crate::application::loops::channel::RemoteRequest;
use crate::application::loops::channel::RemoteWorkItem;
use crate::application::loops::remote_loop::RemoteSealer;
use crate::application::loops::seal_loop::SealCoordinator;
use crate::application::loops::seal_loop::SealState;
use crate::error::PowError;
use crate::protocol::consensus::difficulty::target_for;
use crate::protocol::consensus::hash::BlockNonce;
use crate::protocol::consensus::hash::Hash256;
use crate::protocol::consensus::header::Header;
use crate::protocol::consensus::header::Solution;
use crate::protocol::consensus::verifier::Verifier;
use crate::protocol::hashimoto::check_epoch;
use crate::protocol::hashimoto::EPOCH_LENGTH;
use crate::state::epoch_store::EpochStore;
use crate::state::hashrate::HashrateMeter;

/// Blocks this close to the end of an epoch start generating the next one.
const PRE_GENERATE_WINDOW: u64 = 2_000;

const REMOTE_CHANNEL_CAPACITY: usize = 64;

/// The proof-of-work engine: seals headers locally, checks seals, and
/// serves work to remote miners.
///
/// Cheap to clone; all clones drive the same engine. Must be created from
/// within a tokio runtime, which hosts the remote sealer loop.
#[derive(Debug, Clone)]
pub struct PowEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: PowConfig,
    store: EpochStore,
    verifier: Verifier,
    meter: HashrateMeter,
    threads: AtomicI32,
    closed: AtomicBool,
    coordinator: SealCoordinator,
    to_remote: mpsc::Sender<RemoteRequest>,
    remote_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PowEngine {
    pub fn new(config: PowConfig) -> Self {
        info!(
            "Starting {} pow engine with {} thread(s)",
            config.pow_mode, config.threads
        );
        if let Some(dir) = &config.cache_dir {
            debug!("Epoch files go to {}", dir.display());
        }

        let store = EpochStore::new(&config);
        let verifier = Verifier::new(&config, store.clone());
        let meter = HashrateMeter::default();

        let (to_remote, from_engine) = mpsc::channel(REMOTE_CHANNEL_CAPACITY);
        let sealer = RemoteSealer::new(
            verifier.clone(),
            config.remote_no_verify,
            config.hashrate_expiry,
        );
        let remote_loop = tokio::spawn(sealer.run(from_engine));

        let coordinator = SealCoordinator::new(
            store.clone(),
            verifier.clone(),
            meter.clone(),
            to_remote.clone(),
        );

        Self {
            inner: Arc::new(EngineInner {
                threads: AtomicI32::new(config.threads),
                config,
                store,
                verifier,
                meter,
                closed: AtomicBool::new(false),
                coordinator,
                to_remote,
                remote_loop: Mutex::new(Some(remote_loop)),
            }),
        }
    }

    /// Real hashing over tiny in-memory caches and datasets.
    pub fn tester() -> Self {
        Self::new(PowConfig::test())
    }

    /// Accepts every seal.
    pub fn fake() -> Self {
        Self::new(PowConfig::fake())
    }

    /// Accepts every seal except the one of block `number`.
    pub fn fake_failer(number: u64) -> Self {
        Self::new(PowConfig::fake_failer(number))
    }

    /// Accepts every seal after sleeping for `delay`.
    pub fn fake_delayer(delay: Duration) -> Self {
        Self::new(PowConfig::fake_delayer(delay))
    }

    /// Accepts every seal and never touches a cache or dataset.
    pub fn full_fake() -> Self {
        Self::new(PowConfig::full_fake())
    }

    pub fn config(&self) -> &PowConfig {
        &self.inner.config
    }

    pub fn epoch_store(&self) -> &EpochStore {
        &self.inner.store
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Start sealing `header`, superseding any earlier job.
    ///
    /// Returns right away. The sealed header arrives on the returned channel
    /// if the job is solved before it is superseded; otherwise the channel
    /// closes without a value.
    pub async fn seal(&self, header: Header) -> Result<oneshot::Receiver<Header>, PowError> {
        if self.is_closed() {
            return Err(PowError::EngineStopped);
        }
        let (sink, result) = oneshot::channel();

        if self.inner.config.pow_mode.skips_hashing() {
            let _ = sink.send(header.with_seal(Solution::default()));
            return Ok(result);
        }

        target_for(&header)?;
        check_epoch(header.epoch())?;
        if header.number % EPOCH_LENGTH >= EPOCH_LENGTH - PRE_GENERATE_WINDOW {
            self.inner.store.pre_generate(header.epoch() + 1);
        }

        let job_id = self
            .inner
            .coordinator
            .start(header, sink, self.local_threads())
            .await?;
        debug!("Started seal job {job_id}");
        Ok(result)
    }

    /// Check the seal on `header`. See [`Verifier::verify`].
    pub fn verify_seal(&self, header: &Header, full: bool) -> Result<(), PowError> {
        self.inner.verifier.verify(header, full)
    }

    /// Local hashes per second plus every fresh remote report.
    pub async fn hashrate(&self) -> f64 {
        let local = self.inner.meter.rate();
        if self.is_closed() {
            return local;
        }
        let (reply, remote) = oneshot::channel();
        if self
            .inner
            .to_remote
            .send(RemoteRequest::FetchHashrate(reply))
            .await
            .is_err()
        {
            return local;
        }
        local + remote.await.unwrap_or_default() as f64
    }

    /// The work item for the job currently being sealed.
    pub async fn get_work(&self) -> Result<RemoteWorkItem, PowError> {
        if self.is_closed() {
            return Err(PowError::EngineStopped);
        }
        let (reply, work) = oneshot::channel();
        self.inner
            .to_remote
            .send(RemoteRequest::GetWork(reply))
            .await
            .map_err(|_| PowError::EngineStopped)?;
        work.await.map_err(|_| PowError::EngineStopped)?
    }

    /// Offer a solution for a handed-out work item. `false` means rejected.
    pub async fn submit_work(
        &self,
        nonce: BlockNonce,
        seal_hash: Hash256,
        mix_digest: Hash256,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        let (reply, accepted) = oneshot::channel();
        let request = RemoteRequest::SubmitWork {
            seal_hash,
            solution: Solution { nonce, mix_digest },
            reply,
        };
        if self.inner.to_remote.send(request).await.is_err() {
            return false;
        }
        accepted.await.unwrap_or(false)
    }

    /// Record the hashrate a remote miner reports for itself.
    pub async fn submit_hashrate(&self, rate: u64, id: Hash256) -> bool {
        if self.is_closed() {
            return false;
        }
        let (reply, accepted) = oneshot::channel();
        let request = RemoteRequest::SubmitHashrate { id, rate, reply };
        if self.inner.to_remote.send(request).await.is_err() {
            return false;
        }
        accepted.await.unwrap_or(false)
    }

    pub fn threads(&self) -> i32 {
        self.inner.threads.load(Ordering::Acquire)
    }

    /// Change the local thread count. A running job restarts its workers
    /// under the same id; its result channel stays valid.
    pub async fn set_threads(&self, threads: i32) {
        self.inner.threads.store(threads, Ordering::Release);
        if !self.is_closed() {
            self.inner.coordinator.restart(self.local_threads()).await;
        }
    }

    fn local_threads(&self) -> Option<usize> {
        usize::try_from(self.threads()).ok().filter(|n| *n > 0)
    }

    pub async fn seal_state(&self) -> SealState {
        self.inner.coordinator.state().await
    }

    /// Stop local workers and the remote sealer. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), PowError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.coordinator.abort().await;
        let _ = self.inner.to_remote.send(RemoteRequest::Shutdown).await;
        if let Some(remote_loop) = self.inner.remote_loop.lock().await.take() {
            if let Err(e) = remote_loop.await {
                warn!("Remote sealer ended abnormally: {e}");
            }
        }
        info!("Pow engine closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[traced_test]
    #[tokio::test]
    async fn fake_seal_is_immediate_and_zero() {
        let engine = PowEngine::fake();
        let header = Header::new(1, 1u32);
        let sealed = engine.seal(header.clone()).await.unwrap().await.unwrap();

        assert_eq!(Solution::default(), sealed.solution());
        assert_eq!(header.seal_hash(), sealed.seal_hash());
        assert!(engine.get_work().await.unwrap_err().is_no_mining_work());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn zero_difficulty_is_refused_before_sealing() {
        let engine = PowEngine::tester();
        let err = engine.seal(Header::new(1, 0u32)).await.unwrap_err();
        assert!(err.is_invalid_difficulty());
        assert!(engine.seal_state().await.is_idle());
    }

    #[tokio::test]
    async fn blocks_past_the_last_epoch_are_refused() {
        let engine = PowEngine::tester();
        let header = Header::new(u64::MAX, 1u32);

        assert!(engine.seal(header.clone()).await.unwrap_err().is_epoch_out_of_range());
        assert!(engine.verify_seal(&header, true).unwrap_err().is_epoch_out_of_range());
        assert!(engine.get_work().await.unwrap_err().is_no_mining_work());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_everything() {
        let engine = PowEngine::tester();
        engine.close().await.unwrap();
        engine.close().await.unwrap();

        assert!(engine.seal(Header::new(1, 1u32)).await.unwrap_err().is_engine_stopped());
        assert!(engine.get_work().await.unwrap_err().is_engine_stopped());
        assert!(!engine.submit_hashrate(10, Hash256::zero()).await);
        assert!(
            !engine
                .submit_work(BlockNonce(0), Hash256::zero(), Hash256::zero())
                .await
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_local_sealing_still_serves_work() {
        let engine = PowEngine::new(PowConfig {
            threads: 0,
            ..PowConfig::test()
        });
        let header = Header::new(1, 100u32);
        let mut result = engine.seal(header.clone()).await.unwrap();

        let work = engine.get_work().await.unwrap();
        assert_eq!(header.seal_hash(), work.seal_hash);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            result.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(0.0, engine.inner.meter.rate());
        engine.close().await.unwrap();
    }
}
