//! MoE expert weight cache.
//!
//! Experts are materialized lazily from their shard: the locator names the
//! shard and tensors, the shard cache supplies validated bytes, and the
//! weights are staged into a pool buffer either as stored or dequantized to
//! f32. Entries are bounded by a byte budget with LRU eviction; an
//! `Arc<ExpertWeights>` held by a batch pins the entry.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::evictor::LruTracker;
use super::shard::{ShardCache, ShardError};
use crate::config::ExpertCacheConfig;
use crate::gpu::{BufferHandle, BufferUsage, DeviceError, MemoryReclaimer, PoolError, SharedPool};
use crate::quant::{dequantize, validate_tensor_bytes, QuantError, QuantKind};

/// How expert weights are staged on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightLayout {
    /// Bytes as stored in the shard (kernels dequantize on the fly).
    #[default]
    Raw,
    /// Dequantized to little-endian f32.
    DequantizedF32,
}

/// Where an expert's weights live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertWeightSpec {
    pub shard_index: u32,
    /// Tensor names within the shard, staged back to back.
    pub tensors: Vec<String>,
    #[serde(default)]
    pub layout: WeightLayout,
}

/// Resolves experts to their weights. Backed by the model manifest.
pub trait ExpertLocator: Send + Sync {
    fn locate(&self, expert_id: u32, layer: usize) -> Option<ExpertWeightSpec>;
}

impl<F> ExpertLocator for F
where
    F: Fn(u32, usize) -> Option<ExpertWeightSpec> + Send + Sync,
{
    fn locate(&self, expert_id: u32, layer: usize) -> Option<ExpertWeightSpec> {
        self(expert_id, layer)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ExpertError {
    #[error("No weights for expert {expert_id} in layer {layer}")]
    UnknownExpert { expert_id: u32, layer: usize },

    #[error("Shard {shard_index} has no tensor '{tensor}'")]
    MissingTensor { shard_index: u32, tensor: String },

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error("Tensor '{tensor}': {source}")]
    Quant {
        tensor: String,
        #[source]
        source: QuantError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// (layer, expert id)
pub type ExpertKey = (usize, u32);

/// One staged tensor inside an expert's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTensor {
    pub name: String,
    pub num_elements: u64,
    /// Kind of the staged bytes (`F32` when dequantized).
    pub kind: QuantKind,
    pub range: Range<u64>,
}

/// Resident weights for one expert.
#[derive(Debug)]
pub struct ExpertWeights {
    expert_id: u32,
    layer: usize,
    layout: WeightLayout,
    tensors: Vec<StagedTensor>,
    buffer: BufferHandle,
}

impl ExpertWeights {
    pub fn expert_id(&self) -> u32 {
        self.expert_id
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn layout(&self) -> WeightLayout {
        self.layout
    }

    pub fn tensors(&self) -> &[StagedTensor] {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&StagedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    /// Device bytes charged against the budget.
    pub fn size_bytes(&self) -> u64 {
        self.buffer.size()
    }

    /// Read a dequantized tensor back as f32.
    pub fn read_f32(&self, name: &str) -> Option<Result<Vec<f32>, DeviceError>> {
        let tensor = self.tensor(name).filter(|t| t.kind == QuantKind::F32)?;
        let mut out = vec![0f32; tensor.num_elements as usize];
        Some(self.buffer.read_f32(tensor.range.start, &mut out).map(|()| out))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpertCacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined a materialization already in flight.
    pub coalesced: u64,
    pub evictions: u64,
    pub over_budget_inserts: u64,
    pub load_failures: u64,
}

type ExpertResult = Result<Arc<ExpertWeights>, ExpertError>;
type ExpertFuture = Shared<BoxFuture<'static, ExpertResult>>;

struct InFlight {
    generation: u64,
    future: WeakShared<BoxFuture<'static, ExpertResult>>,
}

#[derive(Default)]
struct ExpertState {
    entries: HashMap<ExpertKey, Arc<ExpertWeights>>,
    lru: LruTracker<ExpertKey>,
    in_flight: HashMap<ExpertKey, InFlight>,
    next_generation: u64,
    used_bytes: u64,
    hits: u64,
    misses: u64,
    coalesced: u64,
    evictions: u64,
    over_budget_inserts: u64,
    load_failures: u64,
}

impl ExpertState {
    fn evict_lru(&mut self, filter: impl Fn(&ExpertKey) -> bool) -> Option<Arc<ExpertWeights>> {
        let entries = &self.entries;
        let key = self.lru.lru(|key| {
            !filter(key) || entries.get(key).map_or(true, |e| Arc::strong_count(e) > 1)
        })?;
        self.remove(&key)
    }

    fn remove(&mut self, key: &ExpertKey) -> Option<Arc<ExpertWeights>> {
        let expert = self.entries.remove(key)?;
        self.lru.remove(key);
        self.used_bytes -= expert.size_bytes();
        self.evictions += 1;
        Some(expert)
    }
}

/// Byte-budgeted LRU cache of expert weights.
pub struct ExpertCache {
    pool: SharedPool,
    shards: Arc<ShardCache>,
    locator: Arc<dyn ExpertLocator>,
    budget_bytes: u64,
    state: Mutex<ExpertState>,
}

impl ExpertCache {
    pub fn new(
        pool: SharedPool,
        shards: Arc<ShardCache>,
        locator: Arc<dyn ExpertLocator>,
        config: &ExpertCacheConfig,
    ) -> Arc<Self> {
        let budget_bytes = config.budget_bytes(pool.device().info().max_buffer_size);
        info!(budget_bytes, "Expert cache initialized");
        Arc::new(Self {
            pool,
            shards,
            locator,
            budget_bytes,
            state: Mutex::new(ExpertState::default()),
        })
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Get an expert's weights, materializing them on a miss. Concurrent
    /// misses for one expert share a single staging pass.
    pub async fn get_expert(self: &Arc<Self>, expert_id: u32, layer: usize) -> ExpertResult {
        let key = (layer, expert_id);
        let future = {
            let mut state = self.state.lock();
            if let Some(expert) = state.entries.get(&key).cloned() {
                state.lru.touch(&key);
                state.hits += 1;
                return Ok(expert);
            }
            match state.in_flight.get(&key).and_then(|f| f.future.upgrade()) {
                Some(future) => {
                    state.coalesced += 1;
                    future
                }
                None => {
                    state.misses += 1;
                    self.start_materialize(&mut state, key)
                }
            }
        };
        future.await
    }

    fn start_materialize(self: &Arc<Self>, state: &mut ExpertState, key: ExpertKey) -> ExpertFuture {
        let generation = state.next_generation;
        state.next_generation += 1;

        let cache = Arc::clone(self);
        let future = async move {
            let (layer, expert_id) = key;
            let result = cache.materialize(expert_id, layer).await;
            cache.finish(key, generation, result)
        }
        .boxed()
        .shared();

        if let Some(weak) = future.downgrade() {
            state.in_flight.insert(
                key,
                InFlight {
                    generation,
                    future: weak,
                },
            );
        }
        future
    }

    /// Retire the in-flight entry and cache the result. A result whose
    /// entry was dropped by `clear` is handed to its waiters uncached.
    fn finish(&self, key: ExpertKey, generation: u64, result: Result<ExpertWeights, ExpertError>) -> ExpertResult {
        let (layer, expert_id) = key;
        let mut state = self.state.lock();
        let current = matches!(state.in_flight.get(&key), Some(f) if f.generation == generation);
        if current {
            state.in_flight.remove(&key);
        }

        match result {
            Ok(expert) if current => Ok(self.insert(state, key, Arc::new(expert))),
            Ok(expert) => {
                debug!(expert_id, layer, "Materialized expert no longer wanted");
                Ok(Arc::new(expert))
            }
            Err(e) => {
                state.load_failures += 1;
                warn!(expert_id, layer, error = %e, "Failed to load expert");
                Err(e)
            }
        }
    }

    async fn materialize(&self, expert_id: u32, layer: usize) -> Result<ExpertWeights, ExpertError> {
        let spec = self
            .locator
            .locate(expert_id, layer)
            .ok_or(ExpertError::UnknownExpert { expert_id, layer })?;

        // Held for the whole staging pass so the shard cannot be evicted under us.
        let shard = self.shards.get(spec.shard_index).await?;

        let mut staged = Vec::with_capacity(spec.tensors.len());
        let mut payload = Vec::new();
        for name in &spec.tensors {
            let span = shard
                .meta()
                .tensor(name)
                .ok_or_else(|| ExpertError::MissingTensor {
                    shard_index: spec.shard_index,
                    tensor: name.clone(),
                })?
                .clone();
            let raw = shard.read(span.offset, span.byte_len() as usize)?;
            let quant_err = |source| ExpertError::Quant {
                tensor: name.clone(),
                source,
            };
            validate_tensor_bytes(span.num_elements, span.kind, raw.len() as u64).map_err(quant_err)?;

            let (bytes, kind) = match spec.layout {
                WeightLayout::Raw => (raw, span.kind),
                WeightLayout::DequantizedF32 => {
                    let values = dequantize(span.kind, &raw, span.num_elements as usize)
                        .map_err(quant_err)?;
                    (bytemuck::cast_slice::<f32, u8>(&values).to_vec(), QuantKind::F32)
                }
            };

            let start = payload.len() as u64;
            payload.extend_from_slice(&bytes);
            staged.push(StagedTensor {
                name: name.clone(),
                num_elements: span.num_elements,
                kind,
                range: start..payload.len() as u64,
            });
        }

        let mut buffer = self.pool.acquire(
            payload.len() as u64,
            BufferUsage::Storage,
            &format!("expert.{layer}.{expert_id}"),
        )?;
        buffer.write(0, &payload)?;

        debug!(expert_id, layer, bytes = payload.len(), "Expert materialized");
        Ok(ExpertWeights {
            expert_id,
            layer,
            layout: spec.layout,
            tensors: staged,
            buffer,
        })
    }

    fn insert(
        &self,
        mut state: MutexGuard<'_, ExpertState>,
        key: ExpertKey,
        expert: Arc<ExpertWeights>,
    ) -> Arc<ExpertWeights> {
        let mut victims = Vec::new();
        let result = if let Some(existing) = state.entries.get(&key).cloned() {
            // Already resident; keep that copy.
            state.lru.touch(&key);
            victims.push(expert);
            existing
        } else {
            let incoming = expert.size_bytes();
            while state.used_bytes + incoming > self.budget_bytes {
                match state.evict_lru(|_| true) {
                    Some(victim) => victims.push(victim),
                    None => break,
                }
            }
            if state.used_bytes + incoming > self.budget_bytes {
                state.over_budget_inserts += 1;
                warn!(
                    layer = key.0,
                    expert_id = key.1,
                    used_bytes = state.used_bytes,
                    incoming,
                    budget_bytes = self.budget_bytes,
                    "Expert cache over budget, all residents pinned"
                );
            }
            state.used_bytes += incoming;
            state.entries.insert(key, Arc::clone(&expert));
            state.lru.touch(&key);
            expert
        };
        drop(state);
        drop(victims);
        result
    }

    pub fn contains(&self, expert_id: u32, layer: usize) -> bool {
        self.state.lock().entries.contains_key(&(layer, expert_id))
    }

    /// Drop every unpinned expert of `layer`.
    pub fn evict_layer(&self, layer: usize) -> usize {
        let victims = {
            let mut state = self.state.lock();
            let mut victims = Vec::new();
            while let Some(victim) = state.evict_lru(|key| key.0 == layer) {
                victims.push(victim);
            }
            victims
        };
        if !victims.is_empty() {
            debug!(layer, experts = victims.len(), "Evicted expert layer");
        }
        victims.len()
    }

    /// Forget every expert. Pinned weights stay alive until released.
    pub fn clear(&self) -> usize {
        let entries = {
            let mut state = self.state.lock();
            state.lru.clear();
            state.in_flight.clear();
            state.used_bytes = 0;
            std::mem::take(&mut state.entries)
        };
        info!(experts = entries.len(), "Cleared expert cache");
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ExpertCacheStats {
        let state = self.state.lock();
        ExpertCacheStats {
            entries: state.entries.len(),
            pinned: state
                .entries
                .values()
                .filter(|e| Arc::strong_count(e) > 1)
                .count(),
            used_bytes: state.used_bytes,
            budget_bytes: self.budget_bytes,
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
            evictions: state.evictions,
            over_budget_inserts: state.over_budget_inserts,
            load_failures: state.load_failures,
        }
    }
}

impl MemoryReclaimer for ExpertCache {
    fn name(&self) -> &str {
        "expert_cache"
    }

    fn reclaim(&self, target_bytes: u64) -> u64 {
        let mut victims = Vec::new();
        let mut released = 0;
        {
            let mut state = self.state.lock();
            while released < target_bytes {
                match state.evict_lru(|_| true) {
                    Some(victim) => {
                        released += victim.size_bytes();
                        victims.push(victim);
                    }
                    None => break,
                }
            }
        }
        if !victims.is_empty() {
            info!(experts = victims.len(), released, "Reclaimed experts");
        }
        released
    }
}
