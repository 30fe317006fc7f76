//! Bucketed device buffer pool with a global byte budget.
//!
//! - Idle buffers are kept per `(bucket, usage)` and reused only on an exact match
//! - Live bytes are active plus pooled bytes; both count against the budget
//! - Crossing the high watermark drops idle buffers first
//! - Exceeding the budget triggers an emergency trim that also asks every
//!   registered [`MemoryReclaimer`] to let go of cache entries
//!
//! All pool state sits behind one mutex. Reclaimers run with it released,
//! because reclaiming drops [`BufferHandle`]s, which re-enter the pool.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::bucket::bucket_size;
use super::device::{BufferUsage, DeviceError, DeviceMemory, GpuDevice};
use crate::config::PoolConfig;

pub type BufferId = u64;

/// Pool shared between its owner and every outstanding handle.
pub type SharedPool = Arc<BufferPool>;

const PRESSURE_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error(
        "Buffer budget exceeded for '{label}': requested {requested} B \
         (bucket {rounded} B) with {current_bytes} B live of {max_total_bytes} B"
    )]
    BudgetExceeded {
        requested: u64,
        rounded: u64,
        current_bytes: u64,
        max_total_bytes: u64,
        label: String,
    },

    #[error("Device allocation failed: {0}")]
    Device(#[from] DeviceError),
}

/// A cache that can give memory back to the pool under pressure.
pub trait MemoryReclaimer: Send + Sync {
    fn name(&self) -> &str;

    /// Release least-valuable entries worth roughly `target_bytes`.
    /// Returns the number of bytes actually released.
    fn reclaim(&self, target_bytes: u64) -> u64;
}

/// Memory pressure notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PressureEvent {
    /// Idle buffers were dropped to get back under the high watermark.
    WatermarkReclaim { freed_bytes: u64, current_bytes: u64 },

    /// The budget was exceeded and caches were asked to shrink.
    EmergencyTrim {
        freed_pooled_bytes: u64,
        reclaimed_bytes: u64,
        current_bytes: u64,
    },

    /// An allocation did not fit even after the emergency trim.
    OverBudget {
        label: String,
        requested: u64,
        current_bytes: u64,
        max_total_bytes: u64,
        hard_fail: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelStats {
    pub active_count: usize,
    pub active_bytes: u64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Active plus pooled bytes.
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub max_total_bytes: u64,

    pub active_count: usize,
    pub active_bytes: u64,
    pub pooled_count: usize,
    pub pooled_bytes: u64,

    /// Active buffers by label.
    pub labels: BTreeMap<String, LabelStats>,

    pub allocations: u64,
    pub reuses: u64,
    pub frees: u64,
    pub reclaimed_bytes: u64,
    pub watermark_reclaims: u64,
    pub emergency_trims: u64,
    pub budget_failures: u64,
    pub over_budget_allocations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: u64,
    reuses: u64,
    frees: u64,
    reclaimed_bytes: u64,
    watermark_reclaims: u64,
    emergency_trims: u64,
    budget_failures: u64,
    over_budget_allocations: u64,
}

struct ActiveInfo {
    size: u64,
    usage: BufferUsage,
    label: Arc<str>,
}

struct PooledBuffer {
    memory: Box<dyn DeviceMemory>,
    last_used: u64,
}

#[derive(Default)]
struct PoolState {
    next_id: BufferId,
    tick: u64,

    current_bytes: u64,
    peak_bytes: u64,

    active: HashMap<BufferId, ActiveInfo>,
    active_bytes: u64,

    /// Idle buffers; front of each queue is the least recently returned.
    pooled: HashMap<(u64, BufferUsage), VecDeque<PooledBuffer>>,
    pooled_count: usize,
    pooled_bytes: u64,

    labels: HashMap<Arc<str>, LabelStats>,
    counters: Counters,
}

impl PoolState {
    fn activate(&mut self, size: u64, usage: BufferUsage, label: &Arc<str>) -> BufferId {
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(
            id,
            ActiveInfo {
                size,
                usage,
                label: Arc::clone(label),
            },
        );
        self.active_bytes += size;
        let entry = self.labels.entry(Arc::clone(label)).or_default();
        entry.active_count += 1;
        entry.active_bytes += size;
        id
    }

    fn deactivate(&mut self, id: BufferId) -> Option<ActiveInfo> {
        let info = self.active.remove(&id)?;
        self.active_bytes -= info.size;
        if let Some(entry) = self.labels.get_mut(&info.label) {
            entry.active_count -= 1;
            entry.active_bytes -= info.size;
            if entry.active_count == 0 {
                self.labels.remove(&info.label);
            }
        }
        Some(info)
    }

    fn take_pooled(&mut self, size: u64, usage: BufferUsage) -> Option<Box<dyn DeviceMemory>> {
        let queue = self.pooled.get_mut(&(size, usage))?;
        let buffer = queue.pop_back()?;
        if queue.is_empty() {
            self.pooled.remove(&(size, usage));
        }
        self.pooled_count -= 1;
        self.pooled_bytes -= size;
        Some(buffer.memory)
    }

    /// Free the least recently returned idle buffer across all buckets.
    fn evict_lru_pooled(&mut self) -> Option<u64> {
        let key = self
            .pooled
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|b| (*key, b.last_used)))
            .min_by_key(|&(_, last_used)| last_used)
            .map(|(key, _)| key)?;

        let queue = self.pooled.get_mut(&key)?;
        let buffer = queue.pop_front()?;
        if queue.is_empty() {
            self.pooled.remove(&key);
        }

        let size = key.0;
        self.pooled_count -= 1;
        self.pooled_bytes -= size;
        self.current_bytes -= size;
        self.counters.frees += 1;
        self.counters.reclaimed_bytes += size;
        drop(buffer);
        Some(size)
    }

    /// Drop idle buffers until live bytes are at or below `target`.
    fn trim_to(&mut self, target: u64) -> u64 {
        let mut freed = 0;
        while self.current_bytes > target {
            match self.evict_lru_pooled() {
                Some(size) => freed += size,
                None => break,
            }
        }
        freed
    }

    fn clear(&mut self) -> u64 {
        let mut freed = 0;
        while let Some(size) = self.evict_lru_pooled() {
            freed += size;
        }
        freed
    }
}

fn ratio_of(total: u64, ratio: f64) -> u64 {
    (total as f64 * ratio) as u64
}

/// The single arbiter of device memory.
pub struct BufferPool {
    device: Arc<dyn GpuDevice>,
    config: PoolConfig,
    max_total_bytes: u64,

    state: Mutex<PoolState>,
    reclaimers: Mutex<Vec<Weak<dyn MemoryReclaimer>>>,
    events: broadcast::Sender<PressureEvent>,
}

impl BufferPool {
    /// Create a pool. Without a configured budget the device's total memory is used.
    pub fn new(device: Arc<dyn GpuDevice>, config: PoolConfig) -> SharedPool {
        let max_total_bytes = config
            .budget
            .max_total_bytes
            .unwrap_or(device.info().total_memory);
        let (events, _) = broadcast::channel(PRESSURE_CHANNEL_CAPACITY);

        info!(
            device = %device.info().name,
            max_total_bytes,
            max_buffers_per_bucket = config.max_buffers_per_bucket,
            max_total_pooled_buffers = config.max_total_pooled_buffers,
            "Buffer pool initialized"
        );

        Arc::new(Self {
            device,
            config,
            max_total_bytes,
            state: Mutex::new(PoolState::default()),
            reclaimers: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_bytes
    }

    /// Bucket a request would land in.
    pub fn bucket_for(&self, requested: u64) -> u64 {
        bucket_size(requested, &self.config.buckets)
    }

    /// Borrow a buffer of at least `requested` bytes.
    pub fn acquire(
        self: &Arc<Self>,
        requested: u64,
        usage: BufferUsage,
        label: &str,
    ) -> Result<BufferHandle, PoolError> {
        let size = self.bucket_for(requested);
        let label: Arc<str> = Arc::from(label);

        {
            let mut state = self.state.lock();
            if let Some(memory) = state.take_pooled(size, usage) {
                state.counters.reuses += 1;
                let id = state.activate(size, usage, &label);
                debug!(id, requested, size, %usage, label = %label, "Reused pooled buffer");
                return Ok(self.handle(id, requested, size, usage, label, memory));
            }
        }

        self.reserve(requested, size, &label)?;

        let created = self.device.create_buffer(size, usage).or_else(|err| match err {
            DeviceError::OutOfMemory { .. } => {
                let freed = self.state.lock().clear();
                if freed == 0 {
                    return Err(err);
                }
                debug!(freed, size, "Device out of memory, dropped idle buffers and retrying");
                self.device.create_buffer(size, usage)
            }
            other => Err(other),
        });

        let mut state = self.state.lock();
        let memory = match created {
            Ok(memory) => memory,
            Err(e) => {
                state.current_bytes -= size;
                warn!(requested, size, label = %label, error = %e, "Device allocation failed");
                return Err(e.into());
            }
        };
        state.peak_bytes = state.peak_bytes.max(state.current_bytes);
        state.counters.allocations += 1;
        let id = state.activate(size, usage, &label);
        debug!(
            id,
            requested,
            size,
            %usage,
            label = %label,
            current_bytes = state.current_bytes,
            "Allocated buffer"
        );
        drop(state);

        Ok(self.handle(id, requested, size, usage, label, memory))
    }

    /// Return a buffer to the pool. Equivalent to [`BufferHandle::release`].
    pub fn release(&self, handle: BufferHandle) {
        handle.release();
    }

    /// Count `size` new bytes against the budget, reclaiming memory first if needed.
    fn reserve(&self, requested: u64, size: u64, label: &Arc<str>) -> Result<(), PoolError> {
        let max = self.max_total_bytes;
        let budget = &self.config.budget;
        let mut state = self.state.lock();

        let watermark = ratio_of(max, budget.high_watermark_ratio);
        if state.current_bytes + size > watermark {
            let freed = state.trim_to(watermark.saturating_sub(size));
            if freed > 0 {
                state.counters.watermark_reclaims += 1;
                debug!(freed, current_bytes = state.current_bytes, "Watermark reclaim");
                self.emit(PressureEvent::WatermarkReclaim {
                    freed_bytes: freed,
                    current_bytes: state.current_bytes,
                });
            }
        }

        if state.current_bytes + size > max {
            // The emergency target applies to usage including this allocation.
            let target = ratio_of(max, budget.emergency_trim_target_ratio).saturating_sub(size);
            let mut freed_pooled = state.trim_to(target);
            let needed = state.current_bytes.saturating_sub(target);
            drop(state);

            let reclaimed = self.run_reclaimers(needed);

            state = self.state.lock();
            freed_pooled += state.trim_to(target);
            state.counters.emergency_trims += 1;
            warn!(
                label = %label,
                requested,
                freed_pooled,
                reclaimed,
                current_bytes = state.current_bytes,
                max_total_bytes = max,
                "Emergency trim"
            );
            self.emit(PressureEvent::EmergencyTrim {
                freed_pooled_bytes: freed_pooled,
                reclaimed_bytes: reclaimed,
                current_bytes: state.current_bytes,
            });
        }

        if state.current_bytes + size > max {
            let hard_fail = budget.hard_fail_on_budget_exceeded;
            self.emit(PressureEvent::OverBudget {
                label: label.to_string(),
                requested,
                current_bytes: state.current_bytes,
                max_total_bytes: max,
                hard_fail,
            });
            if hard_fail {
                state.counters.budget_failures += 1;
                return Err(PoolError::BudgetExceeded {
                    requested,
                    rounded: size,
                    current_bytes: state.current_bytes,
                    max_total_bytes: max,
                    label: label.to_string(),
                });
            }
            state.counters.over_budget_allocations += 1;
            warn!(
                label = %label,
                requested,
                size,
                current_bytes = state.current_bytes,
                max_total_bytes = max,
                "Allocating over budget"
            );
        }

        state.current_bytes += size;
        Ok(())
    }

    fn handle(
        self: &Arc<Self>,
        id: BufferId,
        requested: u64,
        size: u64,
        usage: BufferUsage,
        label: Arc<str>,
        memory: Box<dyn DeviceMemory>,
    ) -> BufferHandle {
        BufferHandle {
            id,
            requested,
            size,
            usage,
            label,
            memory: Some(memory),
            pool: Arc::clone(self),
        }
    }

    fn return_buffer(&self, id: BufferId, memory: Box<dyn DeviceMemory>) {
        let mut state = self.state.lock();
        let Some(info) = state.deactivate(id) else {
            warn!(id, "Returned buffer is not active in this pool");
            return;
        };

        let key = (info.size, info.usage);
        let in_bucket = state.pooled.get(&key).map_or(0, VecDeque::len);
        if in_bucket < self.config.max_buffers_per_bucket
            && state.pooled_count < self.config.max_total_pooled_buffers
        {
            state.tick += 1;
            let last_used = state.tick;
            state
                .pooled
                .entry(key)
                .or_default()
                .push_back(PooledBuffer { memory, last_used });
            state.pooled_count += 1;
            state.pooled_bytes += info.size;
            debug!(id, size = info.size, label = %info.label, "Returned buffer to pool");
        } else {
            state.current_bytes -= info.size;
            state.counters.frees += 1;
            debug!(id, size = info.size, label = %info.label, "Pool full, freed buffer");
            drop(memory);
        }
    }

    /// Register a cache to be asked for memory during emergency trims.
    /// Reclaimers are asked in registration order.
    pub fn register_reclaimer(&self, reclaimer: Weak<dyn MemoryReclaimer>) {
        self.reclaimers.lock().push(reclaimer);
    }

    fn run_reclaimers(&self, target: u64) -> u64 {
        let live: Vec<Arc<dyn MemoryReclaimer>> = {
            let mut reclaimers = self.reclaimers.lock();
            reclaimers.retain(|r| r.strong_count() > 0);
            reclaimers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut reclaimed = 0;
        for reclaimer in live {
            if reclaimed >= target {
                break;
            }
            let released = reclaimer.reclaim(target - reclaimed);
            debug!(
                reclaimer = reclaimer.name(),
                asked = target - reclaimed,
                released,
                "Reclaimer ran"
            );
            reclaimed += released;
        }
        reclaimed
    }

    /// Shrink live bytes toward `target_bytes`: idle buffers first, then caches.
    /// Returns the bytes freed from the pool.
    pub fn trim(&self, target_bytes: u64) -> u64 {
        let (mut freed, needed) = {
            let mut state = self.state.lock();
            let freed = state.trim_to(target_bytes);
            (freed, state.current_bytes.saturating_sub(target_bytes))
        };

        if needed > 0 {
            self.run_reclaimers(needed);
            freed += self.state.lock().trim_to(target_bytes);
        }

        info!(target_bytes, freed, "Trimmed buffer pool");
        freed
    }

    /// Free every idle buffer.
    pub fn clear_pooled(&self) -> u64 {
        let freed = self.state.lock().clear();
        debug!(freed, "Cleared pooled buffers");
        freed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PressureEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PressureEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            current_bytes: state.current_bytes,
            peak_bytes: state.peak_bytes,
            max_total_bytes: self.max_total_bytes,
            active_count: state.active.len(),
            active_bytes: state.active_bytes,
            pooled_count: state.pooled_count,
            pooled_bytes: state.pooled_bytes,
            labels: state
                .labels
                .iter()
                .map(|(label, stats)| (label.to_string(), stats.clone()))
                .collect(),
            allocations: state.counters.allocations,
            reuses: state.counters.reuses,
            frees: state.counters.frees,
            reclaimed_bytes: state.counters.reclaimed_bytes,
            watermark_reclaims: state.counters.watermark_reclaims,
            emergency_trims: state.counters.emergency_trims,
            budget_failures: state.counters.budget_failures,
            over_budget_allocations: state.counters.over_budget_allocations,
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("device", &self.device.info().name)
            .field("max_total_bytes", &self.max_total_bytes)
            .finish_non_exhaustive()
    }
}

/// A borrowed device buffer. Exactly one owner; returned on release or drop.
pub struct BufferHandle {
    id: BufferId,
    requested: u64,
    size: u64,
    usage: BufferUsage,
    label: Arc<str>,
    memory: Option<Box<dyn DeviceMemory>>,
    pool: SharedPool,
}

impl BufferHandle {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn requested_bytes(&self) -> u64 {
        self.requested
    }

    /// Bucketed size; the usable capacity of the buffer.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        match self.memory.as_mut() {
            Some(memory) => memory.write(offset, data),
            None => Err(DeviceError::Released),
        }
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        match self.memory.as_ref() {
            Some(memory) => memory.read(offset, out),
            None => Err(DeviceError::Released),
        }
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn write_f32(&mut self, offset: u64, values: &[f32]) -> Result<(), DeviceError> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    pub fn read_f32(&self, offset: u64, out: &mut [f32]) -> Result<(), DeviceError> {
        self.read(offset, bytemuck::cast_slice_mut(out))
    }

    pub fn view(&self) -> BufferView<'_> {
        BufferView { handle: self }
    }

    /// Give the buffer back to its pool.
    pub fn release(mut self) {
        if let Some(memory) = self.memory.take() {
            self.pool.return_buffer(self.id, memory);
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            debug!(id = self.id, label = %self.label, "Buffer dropped without release");
            self.pool.return_buffer(self.id, memory);
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("requested", &self.requested)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("label", &self.label)
            .finish()
    }
}

/// Read-only view of a buffer handed to kernel dispatch.
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'a> {
    handle: &'a BufferHandle,
}

impl BufferView<'_> {
    pub fn id(&self) -> BufferId {
        self.handle.id
    }

    pub fn size(&self) -> u64 {
        self.handle.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.handle.usage
    }

    pub fn label(&self) -> &str {
        &self.handle.label
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        self.handle.read(offset, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::gpu::device::HostDevice;

    const MIB: u64 = 1024 * 1024;

    fn pool_with(device_bytes: u64, config: PoolConfig) -> SharedPool {
        BufferPool::new(Arc::new(HostDevice::new(device_bytes)), config)
    }

    fn budget(max: u64, hard_fail: bool) -> PoolConfig {
        PoolConfig {
            budget: BudgetConfig {
                max_total_bytes: Some(max),
                hard_fail_on_budget_exceeded: hard_fail,
                ..BudgetConfig::default()
            },
            ..PoolConfig::default()
        }
    }

    fn assert_conserved(pool: &BufferPool) {
        let stats = pool.stats();
        assert_eq!(stats.current_bytes, stats.active_bytes + stats.pooled_bytes);
        assert_eq!(pool.device().allocated_bytes(), stats.current_bytes);
    }

    struct HoldingReclaimer {
        held: Mutex<Vec<BufferHandle>>,
    }

    impl MemoryReclaimer for HoldingReclaimer {
        fn name(&self) -> &str {
            "holding"
        }

        fn reclaim(&self, target_bytes: u64) -> u64 {
            let mut held = self.held.lock();
            let mut released = 0;
            while released < target_bytes {
                let Some(handle) = held.pop() else { break };
                released += handle.size();
                handle.release();
            }
            released
        }
    }

    #[test]
    fn test_reuse_scenario() {
        let pool = pool_with(
            1 << 30,
            PoolConfig {
                max_buffers_per_bucket: 2,
                ..PoolConfig::default()
            },
        );

        let handles: Vec<_> = (0..4)
            .map(|i| pool.acquire(MIB, BufferUsage::Storage, &format!("w{i}")).unwrap())
            .collect();
        assert_eq!(pool.stats().active_bytes, 4 * MIB);

        for handle in handles {
            pool.release(handle);
        }
        let stats = pool.stats();
        assert_eq!(stats.pooled_count, 2);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.current_bytes, 2 * MIB);
        assert_eq!(stats.peak_bytes, 4 * MIB);
        assert_conserved(&pool);

        let again = pool.acquire(MIB, BufferUsage::Storage, "w").unwrap();
        let stats = pool.stats();
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.allocations, 4);
        assert_eq!(stats.current_bytes, 2 * MIB);
        assert_eq!(stats.peak_bytes, 4 * MIB);
        assert_eq!(again.size(), MIB);
        assert_conserved(&pool);
    }

    #[test]
    fn test_reuse_requires_same_usage() {
        let pool = pool_with(1 << 30, PoolConfig::default());
        let handle = pool.acquire(1000, BufferUsage::Storage, "a").unwrap();
        assert_eq!(handle.size(), 1024);
        handle.release();

        let _kv = pool.acquire(1000, BufferUsage::KvCache, "b").unwrap();
        let stats = pool.stats();
        assert_eq!(stats.reuses, 0);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.pooled_count, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_drop_returns_buffer() {
        let pool = pool_with(1 << 30, PoolConfig::default());
        {
            let mut handle = pool.acquire(300, BufferUsage::Storage, "tmp").unwrap();
            handle.write(0, &[1, 2, 3]).unwrap();
            assert_eq!(pool.stats().labels["tmp"].active_count, 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.pooled_count, 1);
        assert!(stats.labels.is_empty());
        assert_conserved(&pool);
    }

    #[test]
    fn test_total_pooled_cap() {
        let pool = pool_with(
            1 << 30,
            PoolConfig {
                max_total_pooled_buffers: 1,
                ..PoolConfig::default()
            },
        );
        let a = pool.acquire(256, BufferUsage::Storage, "a").unwrap();
        let b = pool.acquire(4096, BufferUsage::Storage, "b").unwrap();
        a.release();
        b.release();
        let stats = pool.stats();
        assert_eq!(stats.pooled_count, 1);
        assert_eq!(stats.current_bytes, 256);
        assert_conserved(&pool);
    }

    #[test]
    fn test_hard_budget_fails() {
        let pool = pool_with(1 << 30, budget(4 * MIB, true));
        let _a = pool.acquire(2 * MIB, BufferUsage::Storage, "a").unwrap();
        let _b = pool.acquire(MIB, BufferUsage::Storage, "b").unwrap();

        let err = pool.acquire(2 * MIB, BufferUsage::Storage, "c").unwrap_err();
        match err {
            PoolError::BudgetExceeded {
                requested,
                current_bytes,
                max_total_bytes,
                label,
                ..
            } => {
                assert_eq!(requested, 2 * MIB);
                assert_eq!(current_bytes, 3 * MIB);
                assert_eq!(max_total_bytes, 4 * MIB);
                assert_eq!(label, "c");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.stats().budget_failures, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_soft_budget_allocates_over() {
        let pool = pool_with(1 << 30, budget(2 * MIB, false));
        let mut events = pool.subscribe();

        let _a = pool.acquire(2 * MIB, BufferUsage::Storage, "a").unwrap();
        let _b = pool.acquire(MIB, BufferUsage::Storage, "b").unwrap();

        let stats = pool.stats();
        assert_eq!(stats.over_budget_allocations, 1);
        assert_eq!(stats.current_bytes, 3 * MIB);

        let mut saw_over_budget = false;
        while let Ok(event) = events.try_recv() {
            if let PressureEvent::OverBudget { hard_fail, .. } = event {
                assert!(!hard_fail);
                saw_over_budget = true;
            }
        }
        assert!(saw_over_budget);
    }

    #[test]
    fn test_watermark_drops_idle_buffers() {
        let pool = pool_with(1 << 30, budget(10 * MIB, true));
        let mut events = pool.subscribe();

        let idle = pool.acquire(4 * MIB, BufferUsage::Storage, "idle").unwrap();
        idle.release();
        assert_eq!(pool.stats().pooled_bytes, 4 * MIB);

        // 4 idle + 8 new would cross 9 MiB; the idle buffer goes first.
        let _big = pool.acquire(8 * MIB, BufferUsage::Storage, "big").unwrap();
        let stats = pool.stats();
        assert_eq!(stats.pooled_bytes, 0);
        assert_eq!(stats.current_bytes, 8 * MIB);
        assert_eq!(stats.watermark_reclaims, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(PressureEvent::WatermarkReclaim { freed_bytes, .. }) if freed_bytes == 4 * MIB
        ));
        assert_conserved(&pool);
    }

    #[test]
    fn test_emergency_trim_asks_reclaimers() {
        let pool = pool_with(1 << 30, budget(8 * MIB, true));
        let reclaimer = Arc::new(HoldingReclaimer {
            held: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn MemoryReclaimer> = reclaimer.clone();
        pool.register_reclaimer(Arc::downgrade(&as_dyn));

        for _ in 0..3 {
            let handle = pool.acquire(2 * MIB, BufferUsage::Storage, "cached").unwrap();
            reclaimer.held.lock().push(handle);
        }
        assert_eq!(pool.stats().active_bytes, 6 * MIB);

        let _fresh = pool.acquire(4 * MIB, BufferUsage::Storage, "fresh").unwrap();
        let stats = pool.stats();
        assert_eq!(stats.emergency_trims, 1);
        assert!(stats.current_bytes <= 8 * MIB);
        assert!(reclaimer.held.lock().len() < 3);
        assert_conserved(&pool);
    }

    #[test]
    fn test_dead_reclaimers_are_pruned() {
        let pool = pool_with(1 << 30, budget(MIB, false));
        {
            let reclaimer: Arc<dyn MemoryReclaimer> = Arc::new(HoldingReclaimer {
                held: Mutex::new(Vec::new()),
            });
            pool.register_reclaimer(Arc::downgrade(&reclaimer));
        }
        let _a = pool.acquire(2 * MIB, BufferUsage::Storage, "a").unwrap();
        assert!(pool.reclaimers.lock().is_empty());
    }

    #[test]
    fn test_trim_and_clear() {
        let pool = pool_with(1 << 30, PoolConfig::default());
        let handles: Vec<_> = [256, 1024, 4096]
            .iter()
            .map(|&n| pool.acquire(n, BufferUsage::Storage, "t").unwrap())
            .collect();
        for handle in handles {
            handle.release();
        }
        assert_eq!(pool.stats().pooled_bytes, 256 + 1024 + 4096);

        // Oldest first: the 256 B buffer is freed before the 1 KiB one.
        let freed = pool.trim(5000);
        assert_eq!(freed, 256 + 1024);
        assert_eq!(pool.stats().pooled_bytes, 4096);

        assert_eq!(pool.clear_pooled(), 4096);
        assert_eq!(pool.stats().current_bytes, 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_device_oom_retries_after_dropping_idle() {
        let device = Arc::new(HostDevice::new(2 * MIB));
        let pool = BufferPool::new(device, budget(64 * MIB, true));
        let idle = pool.acquire(MIB, BufferUsage::Uniform, "idle").unwrap();
        idle.release();

        let handle = pool.acquire(2 * MIB, BufferUsage::Storage, "big").unwrap();
        assert_eq!(handle.size(), 2 * MIB);
        assert_eq!(pool.stats().pooled_count, 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_device_oom_propagates() {
        let device = Arc::new(HostDevice::new(MIB));
        let pool = BufferPool::new(device, budget(64 * MIB, true));
        let _a = pool.acquire(MIB, BufferUsage::Storage, "a").unwrap();
        let err = pool.acquire(MIB, BufferUsage::Storage, "b").unwrap_err();
        assert!(matches!(err, PoolError::Device(DeviceError::OutOfMemory { .. })));
        assert_conserved(&pool);
    }

    #[test]
    fn test_f32_round_trip_through_handle() {
        let pool = pool_with(1 << 20, PoolConfig::default());
        let mut handle = pool.acquire(64, BufferUsage::Storage, "f").unwrap();
        handle.write_f32(16, &[1.5, -2.0]).unwrap();

        let mut out = [0.0f32; 2];
        handle.read_f32(16, &mut out).unwrap();
        assert_eq!(out, [1.5, -2.0]);
        assert_eq!(handle.view().size(), 256);
    }
}
