use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::SystemTime;

use itertools::Itertools;
use lru::LruCache;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::buffer::EpochBuffer;
use crate::error::PowError;
use crate::protocol::consensus::hash::Hash256;

/// Bumped whenever the on-disk layout or the algorithm changes, so that
/// files from older revisions are never mistaken for current ones.
pub(crate) const FILE_REVISION: u32 = 1;

/// Lock a std mutex, recovering the guard if a holder panicked. Everything
/// behind these locks is bookkeeping that stays consistent between calls.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One epoch's cache or dataset, shared by everyone asking for that epoch.
///
/// The buffer is produced at most once per slot: concurrent requesters queue
/// on `generating` and then find the buffer already set. At most one
/// background generator is attached to a slot at a time.
#[derive(Debug)]
pub(crate) struct Slot {
    epoch: u64,
    ready: OnceLock<Arc<EpochBuffer>>,
    generating: Mutex<()>,
    background: AtomicBool,
}

impl Slot {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            ready: OnceLock::new(),
            generating: Mutex::new(()),
            background: AtomicBool::new(false),
        }
    }

    /// Claim the right to generate in the background. `false` if the buffer
    /// is ready or another generator already holds the claim.
    pub(crate) fn claim_background(&self) -> bool {
        self.get().is_none() && !self.background.swap(true, Ordering::AcqRel)
    }

    /// Give the claim back after a failed background run.
    pub(crate) fn release_background(&self) {
        self.background.store(false, Ordering::Release);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The buffer if generation already finished. Never blocks.
    pub(crate) fn get(&self) -> Option<Arc<EpochBuffer>> {
        self.ready.get().cloned()
    }

    /// Return the buffer, running `generate` first if nobody has yet.
    ///
    /// A failed generation leaves the slot empty so the next caller retries.
    pub(crate) fn get_or_generate<F>(&self, generate: F) -> Result<Arc<EpochBuffer>, PowError>
    where
        F: FnOnce() -> Result<EpochBuffer, PowError>,
    {
        if let Some(buffer) = self.get() {
            return Ok(buffer);
        }
        let _guard = lock(&self.generating);
        if let Some(buffer) = self.get() {
            return Ok(buffer);
        }
        let buffer = Arc::new(generate()?);
        Ok(self.ready.get_or_init(|| buffer).clone())
    }
}

#[derive(Debug)]
struct LruState {
    /// Slots held in memory.
    mem: LruCache<u64, Arc<Slot>>,

    /// Every slot somebody still holds, so that an evicted epoch in use by
    /// another thread is joined rather than generated a second time.
    live: HashMap<u64, Weak<Slot>>,

    /// Epochs with a file in the disk directory.
    disk: LruCache<u64, PathBuf>,

    /// Highest epoch handed out for background pre-generation.
    future: u64,
    future_slot: Option<Arc<Slot>>,
}

/// Two-tier recency registry for one kind of epoch item.
#[derive(Debug)]
pub(crate) struct EpochLru {
    what: &'static str,
    in_mem: usize,
    on_disk: usize,
    dir: Option<PathBuf>,
    state: Mutex<LruState>,
    /// Serializes disk-window updates with the file writes they admit.
    disk_io: Mutex<()>,
    generated: AtomicU64,
    loaded: AtomicU64,
    background_runs: AtomicU64,
}

impl EpochLru {
    pub(crate) fn new(what: &'static str, in_mem: usize, on_disk: usize, dir: Option<PathBuf>) -> Self {
        let lru = Self {
            what,
            in_mem,
            on_disk,
            dir: dir.filter(|_| on_disk > 0),
            state: Mutex::new(LruState {
                mem: LruCache::unbounded(),
                live: HashMap::new(),
                disk: LruCache::unbounded(),
                future: 0,
                future_slot: None,
            }),
            disk_io: Mutex::new(()),
            generated: AtomicU64::new(0),
            loaded: AtomicU64::new(0),
            background_runs: AtomicU64::new(0),
        };
        lru.adopt_existing_files();
        lru
    }

    pub(crate) fn what(&self) -> &'static str {
        self.what
    }

    /// Fetch the slot for `epoch`, marking it most recently used.
    ///
    /// The second value is a freshly reserved slot for `epoch + 1` the first
    /// time any epoch past the previous high-water mark is requested; the
    /// caller is expected to generate it in the background.
    pub(crate) fn get(&self, epoch: u64) -> (Arc<Slot>, Option<Arc<Slot>>) {
        let mut state = lock(&self.state);

        let cached = state.mem.get(&epoch).cloned();
        let slot = match cached {
            Some(slot) => slot,
            None => {
                let slot = Self::take_or_create(&mut state, epoch);
                trace!("Requiring new {} for epoch {}", self.what, epoch);
                state.mem.put(epoch, slot.clone());
                while state.mem.len() > self.in_mem {
                    if let Some((evicted, _)) = state.mem.pop_lru() {
                        trace!("Evicted {} for epoch {} from memory", self.what, evicted);
                    }
                }
                slot
            }
        };

        let mut future = None;
        if epoch + 1 > state.future {
            state.future = epoch + 1;
            let slot = Self::take_or_create(&mut state, epoch + 1);
            trace!("Requiring future {} for epoch {}", self.what, epoch + 1);
            state.future_slot = Some(slot.clone());
            future = Some(slot);
        }

        state.live.retain(|_, weak| weak.strong_count() > 0);
        (slot, future)
    }

    /// Reserve the slot for `epoch` without touching the memory window.
    ///
    /// Returns `None` when the epoch is already tracked, in memory or as the
    /// current future slot; either way someone already owns its generation.
    pub(crate) fn reserve_future(&self, epoch: u64) -> Option<Arc<Slot>> {
        let mut state = lock(&self.state);
        if state.mem.contains(&epoch) {
            return None;
        }
        if let Some(slot) = &state.future_slot {
            if slot.epoch == epoch {
                return None;
            }
        }
        let slot = Self::take_or_create(&mut state, epoch);
        state.future = state.future.max(epoch);
        state.future_slot = Some(slot.clone());
        Some(slot)
    }

    /// The slot for `epoch` if anyone still tracks it, without touching
    /// recency.
    #[cfg(test)]
    pub(crate) fn tracked(&self, epoch: u64) -> Option<Arc<Slot>> {
        let state = lock(&self.state);
        state
            .future_slot
            .clone()
            .filter(|slot| slot.epoch == epoch)
            .or_else(|| state.live.get(&epoch).and_then(Weak::upgrade))
    }

    fn take_or_create(state: &mut LruState, epoch: u64) -> Arc<Slot> {
        if state
            .future_slot
            .as_ref()
            .is_some_and(|slot| slot.epoch == epoch)
        {
            if let Some(slot) = state.future_slot.take() {
                return slot;
            }
        }
        if let Some(slot) = state.live.get(&epoch).and_then(Weak::upgrade) {
            return slot;
        }
        let slot = Arc::new(Slot::new(epoch));
        state.live.insert(epoch, Arc::downgrade(&slot));
        slot
    }

    /// Path of the disk file for `epoch`, if this registry keeps files.
    pub(crate) fn file_path(&self, epoch: u64, seed: &Hash256) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        Some(dir.join(file_name(self.what, epoch, seed)))
    }

    /// Mark a file that was just mapped from disk as most recently used.
    pub(crate) fn touch_file(&self, epoch: u64, path: PathBuf) {
        self.loaded.fetch_add(1, Ordering::Relaxed);
        let _io = lock(&self.disk_io);
        let evicted = {
            let mut state = lock(&self.state);
            state.disk.put(epoch, path);
            self.trim_disk(&mut state)
        };
        self.delete_files(evicted);
    }

    /// Admit `epoch` into the disk window and write its file.
    ///
    /// The window is trimmed before the write, under `disk_io`, so the
    /// number of files never exceeds `on_disk`. A failed write is logged and
    /// otherwise ignored; the caller keeps the buffer in memory.
    pub(crate) fn write_file(&self, epoch: u64, path: PathBuf, bytes: &[u8]) {
        let _io = lock(&self.disk_io);
        let evicted = {
            let mut state = lock(&self.state);
            state.disk.put(epoch, path.clone());
            self.trim_disk(&mut state)
        };
        self.delete_files(evicted);

        match super::buffer::store(&path, bytes) {
            Ok(()) => debug!("Stored {} for epoch {} in {}", self.what, epoch, path.display()),
            Err(e) => {
                warn!(
                    "Failed to store {} for epoch {} in {}: {}",
                    self.what,
                    epoch,
                    path.display(),
                    e
                );
                lock(&self.state).disk.pop(&epoch);
            }
        }
    }

    fn trim_disk(&self, state: &mut LruState) -> Vec<(u64, PathBuf)> {
        let mut evicted = vec![];
        while state.disk.len() > self.on_disk {
            match state.disk.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    fn delete_files(&self, evicted: Vec<(u64, PathBuf)>) {
        for (epoch, path) in evicted {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Evicted {} for epoch {} from disk", self.what, epoch),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
            }
        }
    }

    pub(crate) fn record_generated(&self) {
        self.generated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub(crate) fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_background_run(&self) {
        self.background_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn background_runs(&self) -> u64 {
        self.background_runs.load(Ordering::Relaxed)
    }

    pub(crate) fn in_memory(&self) -> usize {
        lock(&self.state).mem.len()
    }

    pub(crate) fn on_disk(&self) -> usize {
        lock(&self.state).disk.len()
    }

    /// Take over files left by a previous run: current-revision files enter
    /// the disk window oldest first, anything else of ours is deleted.
    fn adopt_existing_files(&self) {
        let Some(dir) = &self.dir else {
            return;
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };

        let mut found = vec![];
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_file_name(name, self.what) {
                Some((FILE_REVISION, epoch)) => {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((modified, epoch, path));
                }
                Some((revision, _)) => {
                    debug!("Removing {} from old revision {}", path.display(), revision);
                    let _ = fs::remove_file(&path);
                }
                None => {}
            }
        }

        let evicted = {
            let mut state = lock(&self.state);
            for (_, epoch, path) in found.into_iter().sorted_by_key(|(modified, ..)| *modified) {
                state.disk.put(epoch, path);
            }
            self.trim_disk(&mut state)
        };
        self.delete_files(evicted);
        debug!("Adopted {} {} files from {}", self.on_disk(), self.what, dir.display());
    }
}

/// `{what}-R{revision}-e{epoch}-{first 8 seed bytes in hex}`
pub(crate) fn file_name(what: &str, epoch: u64, seed: &Hash256) -> String {
    let prefix = hex::encode(&seed.as_bytes()[..8]);
    format!("{what}-R{FILE_REVISION}-e{epoch}-{prefix}")
}

/// Parse `{what}-R{revision}-e{epoch}-{seed}` into `(revision, epoch)`.
fn parse_file_name(name: &str, what: &str) -> Option<(u32, u64)> {
    if Path::new(name).extension().is_some() {
        return None;
    }
    let rest = name.strip_prefix(what)?.strip_prefix("-R")?;
    let (revision, rest) = rest.split_once("-e")?;
    let (epoch, _seed) = rest.split_once('-')?;
    Some((revision.parse().ok()?, epoch.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn owned(byte: u8) -> Result<EpochBuffer, PowError> {
        Ok(EpochBuffer::Owned(vec![byte; 8]))
    }

    #[test]
    fn concurrent_requesters_share_one_generation() {
        let slot = Slot::new(7);
        let runs = AtomicUsize::new(0);

        let buffers: Vec<_> = std::thread::scope(|s| {
            let handles = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        slot.get_or_generate(|| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            owned(7)
                        })
                        .unwrap()
                    })
                })
                .collect_vec();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(1, runs.load(Ordering::SeqCst));
        assert!(buffers.iter().all(|b| Arc::ptr_eq(b, &buffers[0])));
    }

    #[test]
    fn failed_generation_is_retried() {
        let slot = Slot::new(1);
        let err = slot
            .get_or_generate(|| {
                Err(PowError::GenerationFailed {
                    what: "cache",
                    epoch: 1,
                    source: std::io::Error::other("disk on fire"),
                })
            })
            .unwrap_err();
        assert!(err.is_generation_failed());
        assert!(slot.get().is_none());
        assert_eq!(&[1u8; 8][..], &slot.get_or_generate(|| owned(1)).unwrap()[..]);
    }

    #[test]
    fn background_claim_is_exclusive() {
        let slot = Slot::new(3);
        assert!(slot.claim_background());
        assert!(!slot.claim_background());

        slot.release_background();
        assert!(slot.claim_background());

        slot.release_background();
        slot.get_or_generate(|| owned(3)).unwrap();
        assert!(!slot.claim_background());
    }

    #[test]
    fn memory_window_is_bounded_and_recency_ordered() {
        let lru = EpochLru::new("cache", 2, 0, None);
        lru.get(0);
        lru.get(1);
        lru.get(0); // 1 is now least recently used
        lru.get(2);
        assert_eq!(2, lru.in_memory());

        let state = lock(&lru.state);
        assert!(state.mem.contains(&0));
        assert!(state.mem.contains(&2));
        assert!(!state.mem.contains(&1));
    }

    #[test]
    fn zero_memory_window_still_dedups_live_slots() {
        let lru = EpochLru::new("cache", 0, 0, None);
        let (a, _) = lru.get(3);
        let (b, _) = lru.get(3);
        assert_eq!(0, lru.in_memory());
        assert!(Arc::ptr_eq(&a, &b));

        drop((a, b));
        let (c, _) = lru.get(3);
        assert!(c.get().is_none());
    }

    #[test]
    fn future_slot_is_handed_out_once_and_then_joined() {
        let lru = EpochLru::new("dataset", 2, 0, None);
        let (_, future) = lru.get(4);
        let future = future.unwrap();
        assert_eq!(5, future.epoch());

        // lower epochs do not move the high-water mark
        assert!(lru.get(2).1.is_none());

        let (five, next) = lru.get(5);
        assert!(Arc::ptr_eq(&five, &future));
        assert_eq!(Some(6), next.map(|s| s.epoch()));
    }

    #[test]
    fn reserve_future_skips_tracked_epochs() {
        let lru = EpochLru::new("cache", 2, 0, None);
        lru.get(0);
        assert!(lru.reserve_future(0).is_none());
        assert!(lru.reserve_future(1).is_none()); // already the future slot
        let reserved = lru.reserve_future(9).unwrap();
        let (nine, _) = lru.get(9);
        assert!(Arc::ptr_eq(&reserved, &nine));
    }

    #[test]
    fn disk_window_deletes_least_recent_file() {
        let dir = tempfile::tempdir().unwrap();
        let lru = EpochLru::new("cache", 1, 2, Some(dir.path().to_path_buf()));
        let seed = Hash256::zero();

        for epoch in 0..3 {
            let path = lru.file_path(epoch, &seed).unwrap();
            lru.write_file(epoch, path, &[epoch as u8; 16]);
        }

        assert_eq!(2, lru.on_disk());
        assert!(!lru.file_path(0, &seed).unwrap().exists());
        assert!(lru.file_path(1, &seed).unwrap().exists());
        assert!(lru.file_path(2, &seed).unwrap().exists());
    }

    #[test]
    fn existing_files_are_adopted_and_old_revisions_removed() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("cache-R0-e1-0000000000000000");
        fs::write(&stale, b"old").unwrap();
        for epoch in 0..3 {
            let name = format!("cache-R{}-e{}-0000000000000000", FILE_REVISION, epoch);
            fs::write(dir.path().join(name), b"new").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        let lru = EpochLru::new("cache", 1, 2, Some(dir.path().to_path_buf()));

        assert_eq!(2, lru.on_disk());
        assert!(!stale.exists());
        assert!(dir.path().join("unrelated.txt").exists());
        let remaining = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("cache-"))
            .count();
        assert_eq!(2, remaining);
    }

    #[test]
    fn file_names_parse() {
        assert_eq!(Some((1, 42)), parse_file_name("cache-R1-e42-abcdef", "cache"));
        assert_eq!(None, parse_file_name("cache-R1-e42-abcdef", "dataset"));
        assert_eq!(None, parse_file_name("cache-R1-e42-abcdef.tmp", "cache"));
        assert_eq!(None, parse_file_name("cache-Rx-e42-abcdef", "cache"));
    }
}
