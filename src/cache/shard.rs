//! LRU cache of validated weight shards.
//!
//! Entry lifecycle: absent → loading → resident → (evicted) absent.
//!
//! - Concurrent `get`s for the same shard share one in-flight load
//!   (`futures::future::Shared`); every waiter gets the same `Arc<Shard>`
//! - The map keeps only a weak handle to a loading future, so when every
//!   waiter goes away the load is dropped and the entry returns to absent
//! - A resident shard is pinned while anyone outside the cache holds its `Arc`
//! - Bytes are validated against the manifest and the codec layout before a
//!   pool buffer is written; a failed load never becomes resident

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::evictor::LruTracker;
use crate::config::{ModelConfig, ShardCacheConfig};
use crate::fetch::{FetchError, ShardFetcher, ShardMeta, ShardSource};
use crate::gpu::{BufferHandle, BufferUsage, DeviceError, MemoryReclaimer, PoolError, SharedPool};
use crate::quant::{validate_tensor_bytes, QuantError};

/// Why a shard's bytes were rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    #[error("tensor '{tensor}': {source}")]
    Tensor {
        tensor: String,
        #[source]
        source: QuantError,
    },

    #[error("tensor spans leave a gap or overlap between '{after}' and '{next}'")]
    Layout { after: String, next: String },

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: u64, actual: u64 },

    #[error("declared size {declared} does not match tensor layout ({layout} bytes)")]
    DeclaredSize { declared: u64, layout: u64 },

    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    Hash { expected: String, actual: String },
}

#[derive(Error, Debug, Clone)]
pub enum ShardError {
    #[error("Shard {shard_index} is corrupt: {reason}")]
    Corrupt {
        shard_index: u32,
        reason: CorruptReason,
    },

    #[error("Failed to load shard {shard_index}: {cause}")]
    Load {
        shard_index: u32,
        cause: Arc<FetchError>,
    },

    #[error("No buffer for shard {shard_index}: {source}")]
    Pool {
        shard_index: u32,
        #[source]
        source: PoolError,
    },

    #[error("Device error on shard {shard_index}: {source}")]
    Device {
        shard_index: u32,
        #[source]
        source: DeviceError,
    },

    #[error("Load of shard {0} was cancelled")]
    Cancelled(u32),

    #[error("Shard {0} is not in the manifest")]
    UnknownShard(u32),
}

impl ShardError {
    pub fn shard_index(&self) -> u32 {
        match self {
            ShardError::Corrupt { shard_index, .. }
            | ShardError::Load { shard_index, .. }
            | ShardError::Pool { shard_index, .. }
            | ShardError::Device { shard_index, .. } => *shard_index,
            ShardError::Cancelled(index) | ShardError::UnknownShard(index) => *index,
        }
    }
}

/// A resident, validated shard in a device buffer.
#[derive(Debug)]
pub struct Shard {
    meta: ShardMeta,
    source: ShardSource,
    len: u64,
    buffer: BufferHandle,
}

impl Shard {
    pub fn index(&self) -> u32 {
        self.meta.index
    }

    pub fn meta(&self) -> &ShardMeta {
        &self.meta
    }

    pub fn source(&self) -> ShardSource {
        self.source
    }

    /// Validated byte length (the buffer may be larger).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.buffer.read_vec(offset, len)
    }

    /// Raw bytes of one tensor, by name.
    pub fn tensor_bytes(&self, name: &str) -> Option<Result<Vec<u8>, DeviceError>> {
        let span = self.meta.tensor(name)?;
        Some(self.read(span.offset, span.byte_len() as usize))
    }
}

/// Check shard bytes against the manifest.
pub fn validate_shard(meta: &ShardMeta, bytes: &[u8], verify_hash: bool) -> Result<(), CorruptReason> {
    if let Some((after, next)) = meta.layout_gaps() {
        return Err(CorruptReason::Layout { after, next });
    }

    let actual = bytes.len() as u64;
    let Some(expected) = meta.checked_len() else {
        return Err(CorruptReason::Length {
            expected: u64::MAX,
            actual,
        });
    };
    for span in &meta.tensors {
        let available = actual.min(span.byte_range().end).saturating_sub(span.offset);
        validate_tensor_bytes(span.num_elements, span.kind, available).map_err(|source| {
            CorruptReason::Tensor {
                tensor: span.name.clone(),
                source,
            }
        })?;
    }

    if actual != expected {
        return Err(CorruptReason::Length { expected, actual });
    }
    if let Some(declared) = meta.size_bytes {
        if declared != expected {
            return Err(CorruptReason::DeclaredSize {
                declared,
                layout: expected,
            });
        }
    }

    if verify_hash {
        if let Some(expected) = &meta.hash {
            let actual = format!("{:x}", Sha256::digest(bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(CorruptReason::Hash {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
    }
    Ok(())
}

type LoadResult = Result<Arc<Shard>, ShardError>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

enum Slot {
    Loading {
        generation: u64,
        future: WeakShared<BoxFuture<'static, LoadResult>>,
        abort: AbortHandle,
    },
    Resident(Arc<Shard>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardCacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub loading: usize,
    pub pinned: usize,
    pub resident_bytes: u64,

    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub corrupt: u64,
    pub evictions: u64,
    pub cancellations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    coalesced: u64,
    loads: u64,
    load_failures: u64,
    corrupt: u64,
    evictions: u64,
    cancellations: u64,
}

#[derive(Default)]
struct ShardState {
    slots: HashMap<u32, Slot>,
    lru: LruTracker<u32>,
    next_generation: u64,
    counters: Counters,
}

impl ShardState {
    /// Resident and referenced only by the cache.
    fn is_evictable(&self, index: u32) -> bool {
        matches!(self.slots.get(&index), Some(Slot::Resident(shard)) if Arc::strong_count(shard) == 1)
    }

    fn remove_lru(&mut self) -> Option<Arc<Shard>> {
        let index = self.lru.lru(|&index| !self.is_evictable(index))?;
        self.lru.remove(&index);
        self.counters.evictions += 1;
        match self.slots.remove(&index) {
            Some(Slot::Resident(shard)) => Some(shard),
            _ => None,
        }
    }
}

/// Removes an abandoned loading entry when its future is dropped unfinished.
struct LoadGuard {
    cache: Weak<ShardCache>,
    index: u32,
    generation: u64,
    armed: bool,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            let removed = cache.remove_loading(self.index, self.generation);
            if removed.is_some() {
                debug!(shard = self.index, "Shard load abandoned");
            }
        }
    }
}

/// LRU shard cache in front of a [`ShardFetcher`].
pub struct ShardCache {
    pool: SharedPool,
    fetcher: Arc<dyn ShardFetcher>,
    manifest: HashMap<u32, ShardMeta>,
    config: ShardCacheConfig,
    capacity: usize,
    loads: Option<Semaphore>,
    state: Mutex<ShardState>,
}

impl ShardCache {
    pub fn new(
        pool: SharedPool,
        fetcher: Arc<dyn ShardFetcher>,
        manifest: impl IntoIterator<Item = ShardMeta>,
        config: ShardCacheConfig,
        model: &ModelConfig,
    ) -> Arc<Self> {
        let manifest: HashMap<u32, ShardMeta> =
            manifest.into_iter().map(|meta| (meta.index, meta)).collect();
        let capacity = config.capacity_for(fetcher.source(), model);

        info!(
            source = %fetcher.source(),
            capacity,
            shards = manifest.len(),
            verify_hashes = config.verify_hashes,
            "Shard cache initialized"
        );

        Arc::new(Self {
            pool,
            loads: (config.max_concurrent_loads > 0)
                .then(|| Semaphore::new(config.max_concurrent_loads)),
            fetcher,
            manifest,
            config,
            capacity,
            state: Mutex::new(ShardState::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn source(&self) -> ShardSource {
        self.fetcher.source()
    }

    pub fn meta(&self, index: u32) -> Option<&ShardMeta> {
        self.manifest.get(&index)
    }

    /// Get a shard, loading it on a miss. Concurrent callers share one load.
    pub async fn get(self: &Arc<Self>, index: u32) -> Result<Arc<Shard>, ShardError> {
        let future = {
            let mut state = self.state.lock();
            match self.lookup(&mut state, index)? {
                Lookup::Resident(shard) => return Ok(shard),
                Lookup::Loading(future) => future,
            }
        };
        future.await
    }

    fn lookup(self: &Arc<Self>, state: &mut ShardState, index: u32) -> Result<Lookup, ShardError> {
        match state.slots.get(&index) {
            Some(Slot::Resident(shard)) => {
                let shard = Arc::clone(shard);
                state.lru.touch(&index);
                state.counters.hits += 1;
                return Ok(Lookup::Resident(shard));
            }
            Some(Slot::Loading { future, .. }) => {
                if let Some(future) = future.upgrade() {
                    state.counters.coalesced += 1;
                    return Ok(Lookup::Loading(future));
                }
                // The previous load is being torn down; start over.
            }
            None => {}
        }
        state.counters.misses += 1;
        self.start_load(state, index).map(Lookup::Loading)
    }

    fn start_load(self: &Arc<Self>, state: &mut ShardState, index: u32) -> Result<LoadFuture, ShardError> {
        let meta = self
            .manifest
            .get(&index)
            .cloned()
            .ok_or(ShardError::UnknownShard(index))?;

        let generation = state.next_generation;
        state.next_generation += 1;

        let (abort, registration) = AbortHandle::new_pair();
        let cache = Arc::clone(self);
        // Built outside the async block so an unpolled future still cleans up.
        let guard = LoadGuard {
            cache: Arc::downgrade(self),
            index,
            generation,
            armed: true,
        };
        let load = async move {
            let mut guard = guard;
            let result = cache.load(meta).await;
            cache.finish_load(index, generation, &result);
            guard.armed = false;
            result
        };

        let future = Abortable::new(load, registration)
            .map(move |outcome| outcome.unwrap_or(Err(ShardError::Cancelled(index))))
            .boxed()
            .shared();

        if let Some(weak) = future.downgrade() {
            state.slots.insert(
                index,
                Slot::Loading {
                    generation,
                    future: weak,
                    abort,
                },
            );
        }
        debug!(shard = index, generation, "Shard load started");
        Ok(future)
    }

    async fn load(&self, meta: ShardMeta) -> LoadResult {
        let index = meta.index;
        let _permit = match &self.loads {
            Some(loads) => Some(loads.acquire().await.map_err(|_| ShardError::Cancelled(index))?),
            None => None,
        };

        let bytes = self
            .fetcher
            .fetch(&meta)
            .await
            .map_err(|e| ShardError::Load {
                shard_index: index,
                cause: Arc::new(e),
            })?;

        validate_shard(&meta, &bytes, self.config.verify_hashes).map_err(|reason| {
            ShardError::Corrupt {
                shard_index: index,
                reason,
            }
        })?;

        let mut buffer = self
            .pool
            .acquire(bytes.len() as u64, BufferUsage::Storage, &format!("shard.{index}"))
            .map_err(|source| ShardError::Pool {
                shard_index: index,
                source,
            })?;
        buffer.write(0, &bytes).map_err(|source| ShardError::Device {
            shard_index: index,
            source,
        })?;

        Ok(Arc::new(Shard {
            len: bytes.len() as u64,
            source: self.fetcher.source(),
            meta,
            buffer,
        }))
    }

    /// Move a finished load to resident (or drop it on failure), then
    /// enforce the entry capacity.
    fn finish_load(&self, index: u32, generation: u64, result: &LoadResult) {
        let mut victims = Vec::new();
        let superseded;
        {
            let mut state = self.state.lock();
            let current = matches!(
                state.slots.get(&index),
                Some(Slot::Loading { generation: g, .. }) if *g == generation
            );
            if !current {
                debug!(shard = index, "Finished load no longer wanted");
                return;
            }

            match result {
                Ok(shard) => {
                    superseded = state.slots.insert(index, Slot::Resident(Arc::clone(shard)));
                    state.lru.touch(&index);
                    state.counters.loads += 1;
                    debug!(shard = index, bytes = shard.len(), "Shard resident");

                    while state.lru.len() > self.capacity {
                        match state.remove_lru() {
                            Some(victim) => victims.push(victim),
                            None => {
                                warn!(
                                    capacity = self.capacity,
                                    resident = state.lru.len(),
                                    "All shards pinned, cache over capacity"
                                );
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    superseded = state.slots.remove(&index);
                    state.counters.load_failures += 1;
                    if matches!(e, ShardError::Corrupt { .. }) {
                        state.counters.corrupt += 1;
                    }
                    warn!(shard = index, error = %e, "Shard load failed");
                }
            }
        }

        for victim in &victims {
            debug!(shard = victim.index(), "Evicted shard");
        }
        drop(victims);
        drop(superseded);
    }

    fn remove_loading(&self, index: u32, generation: u64) -> Option<Slot> {
        let mut state = self.state.lock();
        let current = matches!(
            state.slots.get(&index),
            Some(Slot::Loading { generation: g, .. }) if *g == generation
        );
        if current {
            state.slots.remove(&index)
        } else {
            None
        }
    }

    /// Start background loads for shards that are neither resident nor loading.
    /// Returns how many loads were started. Must be called inside a tokio runtime.
    pub fn prefetch(self: &Arc<Self>, indices: impl IntoIterator<Item = u32>) -> usize {
        let mut futures = Vec::new();
        // Upgraded handles must outlive the lock: dropping the last one runs
        // the load's cleanup, which locks the state again.
        let mut in_flight = Vec::new();
        {
            let mut state = self.state.lock();
            for index in indices {
                match state.slots.get(&index) {
                    Some(Slot::Resident(_)) => continue,
                    Some(Slot::Loading { future, .. }) => {
                        if let Some(future) = future.upgrade() {
                            in_flight.push(future);
                            continue;
                        }
                    }
                    None => {}
                }
                match self.start_load(&mut state, index) {
                    Ok(future) => futures.push((index, future)),
                    Err(e) => warn!(shard = index, error = %e, "Cannot prefetch shard"),
                }
            }
        }

        drop(in_flight);

        let started = futures.len();
        for (index, future) in futures {
            tokio::spawn(async move {
                if let Err(e) = future.await {
                    debug!(shard = index, error = %e, "Prefetch did not complete");
                }
            });
        }
        started
    }

    /// Abort an in-flight load. Waiters receive [`ShardError::Cancelled`].
    pub fn cancel(&self, index: u32) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.slots.get(&index) {
                Some(Slot::Loading { .. }) => {
                    state.counters.cancellations += 1;
                    state.slots.remove(&index)
                }
                _ => None,
            }
        };

        match removed {
            Some(Slot::Loading { abort, .. }) => {
                abort.abort();
                info!(shard = index, "Cancelled shard load");
                true
            }
            _ => false,
        }
    }

    /// Evict the least recently used unpinned shard.
    pub fn evict_one(&self) -> bool {
        let victim = self.state.lock().remove_lru();
        match victim {
            Some(shard) => {
                debug!(shard = shard.index(), "Evicted shard");
                true
            }
            None => false,
        }
    }

    /// Cancel every load and drop every resident shard. Pinned shards stay
    /// alive until their holders let go.
    pub fn unload(&self) -> usize {
        let slots = {
            let mut state = self.state.lock();
            state.lru.clear();
            std::mem::take(&mut state.slots)
        };

        let mut resident = 0;
        for slot in slots.into_values() {
            match slot {
                Slot::Loading { abort, .. } => abort.abort(),
                Slot::Resident(_) => resident += 1,
            }
        }
        info!(resident, "Unloaded shard cache");
        resident
    }

    pub fn contains(&self, index: u32) -> bool {
        matches!(self.state.lock().slots.get(&index), Some(Slot::Resident(_)))
    }

    pub fn is_loading(&self, index: u32) -> bool {
        matches!(self.state.lock().slots.get(&index), Some(Slot::Loading { .. }))
    }

    pub fn is_pinned(&self, index: u32) -> bool {
        matches!(
            self.state.lock().slots.get(&index),
            Some(Slot::Resident(shard)) if Arc::strong_count(shard) > 1
        )
    }

    /// Number of resident shards.
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ShardCacheStats {
        let state = self.state.lock();
        let mut stats = ShardCacheStats {
            capacity: self.capacity,
            hits: state.counters.hits,
            misses: state.counters.misses,
            coalesced: state.counters.coalesced,
            loads: state.counters.loads,
            load_failures: state.counters.load_failures,
            corrupt: state.counters.corrupt,
            evictions: state.counters.evictions,
            cancellations: state.counters.cancellations,
            ..ShardCacheStats::default()
        };
        for slot in state.slots.values() {
            match slot {
                Slot::Loading { .. } => stats.loading += 1,
                Slot::Resident(shard) => {
                    stats.resident += 1;
                    stats.resident_bytes += shard.buffer.size();
                    if Arc::strong_count(shard) > 1 {
                        stats.pinned += 1;
                    }
                }
            }
        }
        stats
    }
}

enum Lookup {
    Resident(Arc<Shard>),
    Loading(LoadFuture),
}

impl MemoryReclaimer for ShardCache {
    fn name(&self) -> &str {
        "shard_cache"
    }

    fn reclaim(&self, target_bytes: u64) -> u64 {
        let mut victims = Vec::new();
        let mut released = 0;
        {
            let mut state = self.state.lock();
            while released < target_bytes {
                match state.remove_lru() {
                    Some(shard) => {
                        released += shard.buffer.size();
                        victims.push(shard);
                    }
                    None => break,
                }
            }
        }
        if !victims.is_empty() {
            info!(shards = victims.len(), released, "Reclaimed shards");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::config::PoolConfig;
    use crate::gpu::{BufferPool, HostDevice};
    use crate::quant::QuantKind;

    /// Serves `len` bytes of a pattern per shard after an optional delay.
    struct MemoryFetcher {
        source: ShardSource,
        lens: HashMap<u32, usize>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ShardFetcher for MemoryFetcher {
        fn source(&self) -> ShardSource {
            self.source
        }

        async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let len = *self.lens.get(&meta.index).ok_or(FetchError::NotFound(meta.index))?;
            Ok(Bytes::from(vec![meta.index as u8; len]))
        }
    }

    fn q8_meta(index: u32, blocks: u64) -> ShardMeta {
        ShardMeta::single(index, format!("blk.{index}.weight"), blocks * 32, QuantKind::Q8_0)
    }

    fn cache_with(
        source: ShardSource,
        shards: u32,
        delay: Duration,
    ) -> (Arc<ShardCache>, Arc<MemoryFetcher>) {
        let pool = BufferPool::new(Arc::new(HostDevice::new(64 << 20)), PoolConfig::default());
        let fetcher = Arc::new(MemoryFetcher {
            source,
            lens: (0..shards).map(|i| (i, 34 * 8)).collect(),
            delay,
            calls: AtomicUsize::new(0),
        });
        let cache = ShardCache::new(
            pool,
            fetcher.clone(),
            (0..shards).map(|i| q8_meta(i, 8)),
            ShardCacheConfig::default(),
            &ModelConfig::default(),
        );
        (cache, fetcher)
    }

    #[test]
    fn test_validate_truncated_q4k() {
        let meta = ShardMeta::single(0, "w", 1000 * 256, QuantKind::Q4K);
        let bytes = vec![0u8; 143_999];
        let err = validate_shard(&meta, &bytes, true).unwrap_err();
        assert!(matches!(
            err,
            CorruptReason::Tensor {
                source: QuantError::LengthMismatch { expected: 144_000, actual: 143_999, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_validate_overflowing_element_count() {
        let meta = ShardMeta::single(0, "w", u64::MAX / 2, QuantKind::F32);
        assert!(matches!(
            validate_shard(&meta, &[0u8; 4], true),
            Err(CorruptReason::Length { expected: u64::MAX, actual: 4 })
        ));
    }

    #[test]
    fn test_validate_trailing_bytes_and_declared_size() {
        let mut meta = ShardMeta::single(0, "w", 32, QuantKind::Q8_0);
        assert!(matches!(
            validate_shard(&meta, &[0u8; 35], false),
            Err(CorruptReason::Length { expected: 34, actual: 35 })
        ));

        meta.size_bytes = Some(40);
        assert!(matches!(
            validate_shard(&meta, &[0u8; 34], false),
            Err(CorruptReason::DeclaredSize { declared: 40, layout: 34 })
        ));
    }

    #[test]
    fn test_validate_hash() {
        let bytes = [1u8; 34];
        let mut meta = ShardMeta::single(0, "w", 32, QuantKind::Q8_0);
        meta.hash = Some(format!("{:x}", Sha256::digest(bytes)).to_uppercase());
        assert!(validate_shard(&meta, &bytes, true).is_ok());

        meta.hash = Some("00".repeat(32));
        assert!(matches!(
            validate_shard(&meta, &bytes, true),
            Err(CorruptReason::Hash { .. })
        ));
        assert!(validate_shard(&meta, &bytes, false).is_ok());
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let (cache, fetcher) = cache_with(ShardSource::Network, 4, Duration::ZERO);
        let a = cache.get(1).await.unwrap();
        let b = cache.get(1).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.pinned, 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_coalesce() {
        let (cache, fetcher) = cache_with(ShardSource::Network, 4, Duration::from_millis(20));
        let (a, b) = tokio::join!(cache.get(3), cache.get(3));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_local_capacity_evicts_lru() {
        let (cache, _) = cache_with(ShardSource::Local, 4, Duration::ZERO);
        assert_eq!(cache.capacity(), 2);

        drop(cache.get(0).await.unwrap());
        drop(cache.get(1).await.unwrap());
        drop(cache.get(0).await.unwrap());
        drop(cache.get(2).await.unwrap());

        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_pinned_shard_not_evicted() {
        let (cache, _) = cache_with(ShardSource::Local, 4, Duration::ZERO);
        let pinned = cache.get(0).await.unwrap();
        drop(cache.get(1).await.unwrap());
        drop(cache.get(2).await.unwrap());

        assert!(cache.contains(0));
        assert!(cache.is_pinned(0));
        assert!(!cache.contains(1));

        let _also_pinned = cache.get(2).await.unwrap();
        assert!(!cache.evict_one());
        drop(pinned);
        assert!(cache.evict_one());
        assert!(!cache.contains(0));
    }

    #[tokio::test]
    async fn test_unknown_shard() {
        let (cache, _) = cache_with(ShardSource::Local, 2, Duration::ZERO);
        assert!(matches!(cache.get(9).await, Err(ShardError::UnknownShard(9))));
        assert!(!cache.is_loading(9));
    }

    #[tokio::test]
    async fn test_cancel_in_flight_load() {
        let (cache, _) = cache_with(ShardSource::Network, 2, Duration::from_millis(200));
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_loading(1));

        assert!(cache.cancel(1));
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ShardError::Cancelled(1))));
        assert!(!cache.contains(1));
        assert!(!cache.is_loading(1));
        assert_eq!(cache.stats().cancellations, 1);
    }

    #[tokio::test]
    async fn test_dropped_waiters_return_entry_to_absent() {
        let (cache, _) = cache_with(ShardSource::Network, 2, Duration::from_millis(200));
        let result = tokio::time::timeout(Duration::from_millis(20), cache.get(0)).await;
        assert!(result.is_err());
        assert!(!cache.is_loading(0));

        let shard = cache.get(0).await.unwrap();
        assert_eq!(shard.len(), 34 * 8);
    }

    #[tokio::test]
    async fn test_prefetch_loads_in_background() {
        let (cache, fetcher) = cache_with(ShardSource::Network, 4, Duration::from_millis(5));
        assert_eq!(cache.prefetch([0, 1, 1, 2]), 3);
        assert_eq!(cache.prefetch([0]), 0);

        for _ in 0..100 {
            if cache.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.len(), 3);
        cache.get(2).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reclaim_and_unload() {
        let (cache, _) = cache_with(ShardSource::Network, 4, Duration::ZERO);
        for index in 0..4 {
            drop(cache.get(index).await.unwrap());
        }
        let pinned = cache.get(3).await.unwrap();

        let released = cache.reclaim(1);
        assert_eq!(released, pinned.buffer().size());
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(0));

        assert_eq!(cache.unload(), 3);
        assert!(cache.is_empty());
        assert_eq!(pinned.read(0, 2).unwrap(), vec![3, 3]);
    }
}
