use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::channel::JobId;
use super::channel::RemoteRequest;
use super::channel::RemoteWorkItem;
use super::channel::SealJob;
use crate::error::PowError;
use crate::protocol::consensus::difficulty::target_for;
use crate::protocol::consensus::difficulty::target_to_hash;
use crate::protocol::consensus::hash::Hash256;
use crate::protocol::consensus::header::Header;
use crate::protocol::consensus::header::Solution;
use crate::protocol::consensus::verifier::Verifier;
use crate::protocol::hashimoto::check_epoch;
use crate::protocol::hashimoto::seed_hash;

/// Work items this many blocks behind the newest one are forgotten.
pub(crate) const STALE_THRESHOLD: u64 = 7;

/// Hard cap on remembered work items.
pub(crate) const MAX_HISTORY: usize = 32;

/// A work item handed out at some point, with what is needed to check and
/// forward solutions for it.
#[derive(Debug)]
struct WorkEntry {
    item: RemoteWorkItem,
    header: Header,
    job_id: JobId,
    solved: bool,
}

#[derive(Debug)]
struct CurrentJob {
    job_id: JobId,
    seal_hash: Hash256,
    sink: Option<oneshot::Sender<Header>>,
    delivered: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
struct HashrateEntry {
    rate: u64,
    last_update: Instant,
}

/// Serializes all remote-mining state: handed-out work, the job whose
/// result channel is live, and the hashrates miners report.
#[derive(Debug)]
pub(crate) struct RemoteSealer {
    verifier: Verifier,
    no_verify: bool,
    hashrate_expiry: Duration,

    current: Option<CurrentJob>,
    works: VecDeque<WorkEntry>,
    rates: HashMap<Hash256, HashrateEntry>,
}

impl RemoteSealer {
    pub(crate) fn new(verifier: Verifier, no_verify: bool, hashrate_expiry: Duration) -> Self {
        Self {
            verifier,
            no_verify,
            hashrate_expiry,
            current: None,
            works: VecDeque::with_capacity(MAX_HISTORY),
            rates: HashMap::new(),
        }
    }

    /// Process requests until told to shut down or every sender is gone.
    pub(crate) async fn run(mut self, mut from_engine: mpsc::Receiver<RemoteRequest>) {
        let purge_every = (self.hashrate_expiry / 2).max(Duration::from_millis(1));
        let mut purge_timer = tokio::time::interval(purge_every);
        purge_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                request = from_engine.recv() => {
                    let Some(request) = request else {
                        debug!("Engine handle dropped; remote sealer exiting");
                        break;
                    };
                    trace!("RemoteSealer received {} request", request.get_type());
                    if matches!(request, RemoteRequest::Shutdown) {
                        break;
                    }
                    self.handle(request).await;
                }
                _ = purge_timer.tick() => {
                    self.purge_rates(Instant::now());
                }
            }
        }

        // dropping `current` closes the live job's result channel
        self.current = None;
        info!("Remote sealer stopped");
    }

    async fn handle(&mut self, request: RemoteRequest) {
        match request {
            RemoteRequest::NewWork(job) => self.new_work(*job),
            RemoteRequest::LocalSolution { job_id, solution } => {
                self.local_solution(job_id, solution)
            }
            RemoteRequest::GetWork(reply) => {
                let work = self
                    .current
                    .as_ref()
                    .and_then(|current| self.find(&current.seal_hash))
                    .map(|entry| entry.item)
                    .ok_or(PowError::NoMiningWork);
                let _ = reply.send(work);
            }
            RemoteRequest::SubmitWork {
                seal_hash,
                solution,
                reply,
            } => {
                let accepted = self.submit_work(seal_hash, solution).await;
                let _ = reply.send(accepted);
            }
            RemoteRequest::SubmitHashrate { id, rate, reply } => {
                self.rates.insert(
                    id,
                    HashrateEntry {
                        rate,
                        last_update: Instant::now(),
                    },
                );
                let _ = reply.send(true);
            }
            RemoteRequest::FetchHashrate(reply) => {
                let _ = reply.send(self.total_rate(Instant::now()));
            }
            RemoteRequest::Shutdown => {}
        }
    }

    fn new_work(&mut self, job: SealJob) {
        let SealJob {
            id,
            header,
            sink,
            delivered,
        } = job;

        // validated by the engine before the job was created
        let target = match check_epoch(header.epoch()).and_then(|()| target_for(&header)) {
            Ok(target) => target,
            Err(e) => {
                warn!("Dropping job {id}: {e}");
                return;
            }
        };
        let item = RemoteWorkItem {
            seal_hash: header.seal_hash(),
            seed_hash: seed_hash(header.epoch()),
            target: target_to_hash(&target),
            number: header.number,
        };

        if let Some(previous) = &self.current {
            debug!("Job {} superseded by job {id}", previous.job_id);
        }
        self.current = Some(CurrentJob {
            job_id: id,
            seal_hash: item.seal_hash,
            sink: Some(sink),
            delivered,
        });

        self.works.retain(|entry| entry.item.seal_hash != item.seal_hash);
        self.works.push_back(WorkEntry {
            item,
            header,
            job_id: id,
            solved: false,
        });
        self.evict_stale_work(item.number);
        debug!(
            "New work {} for block {}, {} item(s) retained",
            item.seal_hash,
            item.number,
            self.works.len()
        );
    }

    fn evict_stale_work(&mut self, newest: u64) {
        self.works
            .retain(|entry| entry.item.number.saturating_add(STALE_THRESHOLD) > newest);
        while self.works.len() > MAX_HISTORY {
            self.works.pop_front();
        }
    }

    fn find(&self, seal_hash: &Hash256) -> Option<&WorkEntry> {
        self.works
            .iter()
            .find(|entry| entry.item.seal_hash == *seal_hash)
    }

    fn local_solution(&mut self, job_id: JobId, solution: Solution) {
        let Some(seal_hash) = self
            .current
            .as_ref()
            .filter(|current| current.job_id == job_id)
            .map(|current| current.seal_hash)
        else {
            debug!("Discarding local solution for superseded job {job_id}");
            return;
        };
        let Some(entry) = self
            .works
            .iter_mut()
            .find(|entry| entry.item.seal_hash == seal_hash)
        else {
            return;
        };
        if entry.solved {
            debug!("Job {job_id} already solved; discarding local solution");
            return;
        }
        entry.solved = true;
        let sealed = entry.header.with_seal(solution);
        self.deliver(sealed);
    }

    async fn submit_work(&mut self, seal_hash: Hash256, solution: Solution) -> bool {
        let Some(entry) = self.find(&seal_hash) else {
            warn!("Work submitted but none pending: {seal_hash}");
            return false;
        };
        if entry.solved {
            debug!("Duplicate submission for {seal_hash}");
            return false;
        }
        let sealed = entry.header.with_seal(solution);
        let job_id = entry.job_id;

        if !self.no_verify {
            let verifier = self.verifier.clone();
            let header = sealed.clone();
            let verdict =
                tokio::task::spawn_blocking(move || verifier.verify(&header, true)).await;
            match verdict {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Invalid proof-of-work submitted for {seal_hash}: {e}");
                    return false;
                }
                Err(e) => {
                    warn!("Verification task for {seal_hash} failed: {e}");
                    return false;
                }
            }
        }

        if let Some(entry) = self
            .works
            .iter_mut()
            .find(|entry| entry.item.seal_hash == seal_hash)
        {
            entry.solved = true;
        }

        let is_current = self
            .current
            .as_ref()
            .is_some_and(|current| current.job_id == job_id);
        if is_current {
            info!(
                "Work submitted is acceptable: block {}, nonce {}",
                sealed.number, solution.nonce
            );
            self.deliver(sealed);
        } else {
            info!(
                "Work submitted is stale but valid: block {}, nonce {}",
                sealed.number, solution.nonce
            );
        }
        true
    }

    fn deliver(&mut self, sealed: Header) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let Some(sink) = current.sink.take() else {
            return;
        };
        current.delivered.store(true, Ordering::Release);
        if sink.send(sealed).is_err() {
            debug!("Sealing result for job {} was not read", current.job_id);
        }
    }

    fn total_rate(&self, now: Instant) -> u64 {
        self.rates
            .values()
            .filter(|entry| now.duration_since(entry.last_update) <= self.hashrate_expiry)
            .map(|entry| entry.rate)
            .sum()
    }

    fn purge_rates(&mut self, now: Instant) {
        let expiry = self.hashrate_expiry;
        let before = self.rates.len();
        self.rates
            .retain(|_, entry| now.duration_since(entry.last_update) <= expiry);
        if self.rates.len() < before {
            trace!("Purged {} stale hashrate report(s)", before - self.rates.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::config::pow_config::PowConfig;
    use crate::state::epoch_store::EpochStore;

    fn sealer() -> RemoteSealer {
        let config = PowConfig::test();
        let verifier = Verifier::new(&config, EpochStore::new(&config));
        RemoteSealer::new(verifier, false, Duration::from_secs(10))
    }

    fn job(number: u64) -> (SealJob, oneshot::Receiver<Header>) {
        let (sink, rx) = oneshot::channel();
        let job = SealJob {
            id: JobId::random(),
            header: Header::new(number, 100u32),
            sink,
            delivered: Arc::new(AtomicBool::new(false)),
        };
        (job, rx)
    }

    #[test]
    fn history_drops_items_far_behind() {
        let mut sealer = sealer();
        for number in 1..=20 {
            sealer.new_work(job(number).0);
        }
        let numbers: Vec<u64> = sealer.works.iter().map(|e| e.item.number).collect();
        assert_eq!((14..=20).collect::<Vec<_>>(), numbers);
    }

    #[test]
    fn history_is_capped_for_same_height_work() {
        let mut sealer = sealer();
        for difficulty in 1..=40u32 {
            let (mut job, _rx) = job(5);
            job.header.difficulty = difficulty.into();
            sealer.new_work(job);
        }
        assert_eq!(MAX_HISTORY, sealer.works.len());
    }

    #[test]
    fn work_past_the_last_epoch_is_dropped() {
        let mut sealer = sealer();
        let (kept, _kept_rx) = job(1);
        sealer.new_work(kept);

        let (far, mut far_rx) = job(u64::MAX);
        sealer.new_work(far);
        assert_eq!(vec![1], sealer.works.iter().map(|e| e.item.number).collect::<Vec<_>>());
        assert!(matches!(
            far_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        sealer.evict_stale_work(u64::MAX);
        assert!(sealer.works.is_empty());
    }

    #[test]
    fn superseded_job_channel_closes() {
        let mut sealer = sealer();
        let (first, mut first_rx) = job(1);
        let first_id = first.id;
        sealer.new_work(first);
        let (second, _second_rx) = job(2);
        sealer.new_work(second);

        sealer.local_solution(first_id, Solution::default());
        assert!(matches!(
            first_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn local_solution_is_delivered_once() {
        let mut sealer = sealer();
        let (job, mut rx) = job(1);
        let (id, delivered) = (job.id, job.delivered.clone());
        sealer.new_work(job);

        let solution = Solution {
            nonce: 9.into(),
            ..Solution::default()
        };
        sealer.local_solution(id, solution);
        sealer.local_solution(id, Solution::default());

        assert_eq!(solution, rx.try_recv().unwrap().solution());
        assert!(delivered.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn unknown_and_invalid_submissions_are_rejected() {
        let mut sealer = sealer();
        let (job, _rx) = job(1);
        let seal_hash = job.header.seal_hash();
        sealer.new_work(job);

        assert!(!sealer.submit_work(Hash256::keccak(b"nope"), Solution::default()).await);
        assert!(!sealer.submit_work(seal_hash, Solution::default()).await);
    }

    #[test]
    fn rates_expire() {
        let mut sealer = sealer();
        let now = Instant::now();
        sealer.rates.insert(
            Hash256([1; 32]),
            HashrateEntry {
                rate: 100,
                last_update: now,
            },
        );
        sealer.rates.insert(
            Hash256([2; 32]),
            HashrateEntry {
                rate: 50,
                last_update: now,
            },
        );
        assert_eq!(150, sealer.total_rate(now));

        let later = now + Duration::from_secs(11);
        assert_eq!(0, sealer.total_rate(later));
        sealer.purge_rates(later);
        assert!(sealer.rates.is_empty());
    }
}
