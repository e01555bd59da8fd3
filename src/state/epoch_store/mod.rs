//! Per-epoch verification caches and mining datasets.
//!
//! Each kind lives in its own [`EpochLru`]: a bounded in-memory window, a
//! bounded window of files on disk, and a registry of slots still held by
//! someone so an epoch is never generated twice at the same time. Touching
//! epoch `E` for the first time also kicks off generation of `E + 1` in the
//! background so block producers do not stall at the epoch boundary.

mod buffer;
mod lru;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytesize::ByteSize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use self::buffer::EpochBuffer;
use self::lru::EpochLru;
use self::lru::Slot;
use crate::application::config::pow_config::PowConfig;
use crate::application::config::pow_mode::PowMode;
use crate::error::PowError;
use crate::protocol::consensus::hash::BlockNonce;
use crate::protocol::consensus::hash::Hash256;
use crate::protocol::hashimoto;

const CACHE: &str = "cache";
const DATASET: &str = "dataset";

/// Shared handle to the caches and datasets of one engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EpochStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    mode: PowMode,
    caches: EpochLru,
    datasets: EpochLru,
}

/// A ready verification cache.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    epoch: u64,
    dataset_size: usize,
    buffer: Arc<EpochBuffer>,
}

impl CacheHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn buffer(&self) -> &Arc<EpochBuffer> {
        &self.buffer
    }

    /// Light hashimoto: derives the needed dataset rows on the fly.
    pub fn compute(&self, seal_hash: &Hash256, nonce: BlockNonce) -> (Hash256, Hash256) {
        hashimoto::hashimoto_light(self.dataset_size, &self.buffer, seal_hash, nonce)
    }
}

/// A mining dataset that may still be generating in the background.
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    slot: Arc<Slot>,
}

impl DatasetHandle {
    pub fn epoch(&self) -> u64 {
        self.slot.epoch()
    }

    pub fn is_generated(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn buffer(&self) -> Option<Arc<EpochBuffer>> {
        self.slot.get()
    }

    /// Full hashimoto, or `None` while the dataset is still generating.
    pub fn compute(&self, seal_hash: &Hash256, nonce: BlockNonce) -> Option<(Hash256, Hash256)> {
        self.buffer()
            .map(|dataset| hashimoto::hashimoto_full(&dataset, seal_hash, nonce))
    }
}

/// Point-in-time counters, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub caches_in_mem: usize,
    pub caches_on_disk: usize,
    pub caches_generated: u64,
    pub caches_loaded: u64,
    pub caches_background_runs: u64,
    pub datasets_in_mem: usize,
    pub datasets_on_disk: usize,
    pub datasets_generated: u64,
    pub datasets_loaded: u64,
    pub datasets_background_runs: u64,
}

impl EpochStore {
    pub fn new(config: &PowConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                mode: config.pow_mode,
                caches: EpochLru::new(
                    CACHE,
                    config.caches_in_mem,
                    config.caches_on_disk,
                    config.cache_dir.clone(),
                ),
                datasets: EpochLru::new(
                    DATASET,
                    config.datasets_in_mem,
                    config.datasets_on_disk,
                    config.dataset_dir(),
                ),
            }),
        }
    }

    pub fn mode(&self) -> PowMode {
        self.inner.mode
    }

    /// The verification cache for `epoch`, generating or loading it first if
    /// needed. Blocks only on this epoch's generation.
    pub fn cache(&self, epoch: u64) -> Result<CacheHandle, PowError> {
        hashimoto::check_epoch(epoch)?;
        let (slot, future) = self.inner.caches.get(epoch);
        if let Some(future) = future {
            self.spawn_cache(future);
        }
        let buffer = slot.get_or_generate(|| self.generate_cache(epoch))?;
        Ok(CacheHandle {
            epoch,
            dataset_size: self.inner.mode.dataset_size(epoch),
            buffer,
        })
    }

    /// The mining dataset for `epoch`.
    ///
    /// With `full_generation` the call blocks until the dataset is ready.
    /// Without it, generation is started in the background and the handle is
    /// returned right away; callers check [`DatasetHandle::is_generated`] and
    /// fall back to the cache meanwhile.
    pub fn dataset(&self, epoch: u64, full_generation: bool) -> Result<DatasetHandle, PowError> {
        hashimoto::check_epoch(epoch)?;
        let (slot, future) = self.inner.datasets.get(epoch);
        if let Some(future) = future {
            self.spawn_dataset(future);
        }
        if full_generation {
            slot.get_or_generate(|| self.generate_dataset(epoch))?;
        } else {
            self.spawn_dataset(slot.clone());
        }
        Ok(DatasetHandle { slot })
    }

    /// Start generating the cache and dataset for `epoch` without waiting.
    pub fn pre_generate(&self, epoch: u64) {
        if self.inner.mode.skips_hashing() || hashimoto::check_epoch(epoch).is_err() {
            return;
        }
        if let Some(slot) = self.inner.caches.reserve_future(epoch) {
            self.spawn_cache(slot);
        }
        if let Some(slot) = self.inner.datasets.reserve_future(epoch) {
            self.spawn_dataset(slot);
        }
    }

    pub fn stats(&self) -> StoreStats {
        let StoreInner {
            caches, datasets, ..
        } = &*self.inner;
        StoreStats {
            caches_in_mem: caches.in_memory(),
            caches_on_disk: caches.on_disk(),
            caches_generated: caches.generated(),
            caches_loaded: caches.loaded(),
            caches_background_runs: caches.background_runs(),
            datasets_in_mem: datasets.in_memory(),
            datasets_on_disk: datasets.on_disk(),
            datasets_generated: datasets.generated(),
            datasets_loaded: datasets.loaded(),
            datasets_background_runs: datasets.background_runs(),
        }
    }

    fn spawn_cache(&self, slot: Arc<Slot>) {
        let store = self.clone();
        Self::spawn(&self.inner.caches, slot, move |epoch| {
            store.generate_cache(epoch)
        });
    }

    fn spawn_dataset(&self, slot: Arc<Slot>) {
        let store = self.clone();
        Self::spawn(&self.inner.datasets, slot, move |epoch| {
            store.generate_dataset(epoch)
        });
    }

    /// Generate `slot` on a named thread unless it is ready or another
    /// generator already owns it.
    fn spawn<F>(lru: &EpochLru, slot: Arc<Slot>, generate: F)
    where
        F: FnOnce(u64) -> Result<EpochBuffer, PowError> + Send + 'static,
    {
        if hashimoto::check_epoch(slot.epoch()).is_err() || !slot.claim_background() {
            return;
        }
        let what = lru.what();
        let epoch = slot.epoch();
        let background = slot.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{what}-gen-{epoch}"))
            .spawn(move || {
                if let Err(e) = background.get_or_generate(|| generate(epoch)) {
                    warn!("Background generation failed: {e}");
                    background.release_background();
                }
            });
        match spawned {
            Ok(_) => lru.record_background_run(),
            Err(e) => {
                warn!("Could not spawn {what} generator for epoch {epoch}: {e}");
                slot.release_background();
            }
        }
    }

    fn generate_cache(&self, epoch: u64) -> Result<EpochBuffer, PowError> {
        let lru = &self.inner.caches;
        let size = self.inner.mode.cache_size(epoch);
        let seed = hashimoto::seed_hash(epoch);
        self.load_or_generate(lru, epoch, size, &seed, || {
            Ok(hashimoto::make_cache(size, &seed))
        })
    }

    fn generate_dataset(&self, epoch: u64) -> Result<EpochBuffer, PowError> {
        let lru = &self.inner.datasets;
        let size = self.inner.mode.dataset_size(epoch);
        let seed = hashimoto::seed_hash(epoch);
        self.load_or_generate(lru, epoch, size, &seed, || {
            let cache = self.cache(epoch)?;
            Ok(hashimoto::generate_dataset(size, cache.buffer()))
        })
    }

    fn load_or_generate<F>(
        &self,
        lru: &EpochLru,
        epoch: u64,
        size: usize,
        seed: &Hash256,
        generate: F,
    ) -> Result<EpochBuffer, PowError>
    where
        F: FnOnce() -> Result<Vec<u8>, PowError>,
    {
        let what = lru.what();
        let path = lru.file_path(epoch, seed);

        if let Some(path) = &path {
            let loaded = buffer::load(path, size).map_err(|source| PowError::GenerationFailed {
                what,
                epoch,
                source,
            })?;
            if let Some(buffer) = loaded {
                debug!("Loaded {what} for epoch {epoch} from {}", path.display());
                lru.touch_file(epoch, path.clone());
                return Ok(buffer);
            }
        }

        info!("Generating {what} for epoch {epoch} ({})", ByteSize(size as u64));
        let start = Instant::now();
        let bytes = generate()?;
        lru.record_generated();
        info!(
            "Generated {what} for epoch {epoch} in {:.2?}",
            start.elapsed()
        );

        if let Some(path) = path {
            lru.write_file(epoch, path, &bytes);
        }
        Ok(EpochBuffer::Owned(bytes))
    }
}

/// Generate the verification cache for `epoch` straight into `dir`, outside
/// of any store. Returns the written file.
pub fn make_cache(mode: PowMode, epoch: u64, dir: &Path) -> Result<PathBuf, PowError> {
    hashimoto::check_epoch(epoch)?;
    let seed = hashimoto::seed_hash(epoch);
    let bytes = hashimoto::make_cache(mode.cache_size(epoch), &seed);
    export(CACHE, epoch, &seed, dir, &bytes)
}

/// Generate the mining dataset for `epoch` straight into `dir`.
pub fn make_dataset(mode: PowMode, epoch: u64, dir: &Path) -> Result<PathBuf, PowError> {
    hashimoto::check_epoch(epoch)?;
    let seed = hashimoto::seed_hash(epoch);
    let cache = hashimoto::make_cache(mode.cache_size(epoch), &seed);
    let bytes = hashimoto::generate_dataset(mode.dataset_size(epoch), &cache);
    export(DATASET, epoch, &seed, dir, &bytes)
}

fn export(
    what: &'static str,
    epoch: u64,
    seed: &Hash256,
    dir: &Path,
    bytes: &[u8],
) -> Result<PathBuf, PowError> {
    let path = dir.join(lru::file_name(what, epoch, seed));
    buffer::store(&path, bytes).map_err(|source| PowError::GenerationFailed {
        what,
        epoch,
        source,
    })?;
    info!("Wrote {what} for epoch {epoch} to {}", path.display());
    Ok(path)
}
