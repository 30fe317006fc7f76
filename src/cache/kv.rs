//! KV attention cache with paging and hot/cold tiering.
//!
//! Every token row is stored as `K ‖ V`, both `kv_dim` wide, in the page
//! dtype. A row sits at `position * stride` inside a contiguous layer buffer,
//! or at `(position - page.start) * stride` inside a page, so a run of
//! tokens is always one contiguous byte range.
//!
//! With tiering on, appends lazily demote whole cold pages that have fallen
//! out of the hot window. Cold pages are device buffers in the cold dtype or,
//! with zstd compression, host-side compressed blocks. Under memory pressure
//! the pool can ask the cache to spill device cold pages to compressed host
//! storage; nothing ever moves back to the hot tier.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::compressor::{self, CompressedPage, CompressionError, Compressor};
use super::page::{KvLayout, PageGeometry, PageInfo, SequenceId, Tier};
use crate::config::{ColdCompression, KvCacheConfig, KvDtype, ModelConfig};
use crate::gpu::{BufferHandle, BufferUsage, DeviceError, MemoryReclaimer, PoolError, SharedPool};

#[derive(Error, Debug)]
pub enum KvCacheError {
    #[error("Sequence {sequence_id}: position {position} exceeds max_seq_len {max_seq_len}")]
    SequenceOverflow {
        sequence_id: SequenceId,
        position: usize,
        max_seq_len: usize,
    },

    #[error("K/V width mismatch: expected {expected}, got key {key} and value {value}")]
    ShapeMismatch {
        expected: usize,
        key: usize,
        value: usize,
    },

    #[error("Layer {layer} out of range ({num_layers} layers)")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("Unknown sequence {0}")]
    UnknownSequence(SequenceId),

    #[error("Sequence {0} already started")]
    SequenceExists(SequenceId),

    #[error("Sequence {sequence_id}: position {position} not written (length {len})")]
    PositionNotWritten {
        sequence_id: SequenceId,
        position: usize,
        len: usize,
    },

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),
}

/// KV cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KvStats {
    pub sequences: usize,
    pub contiguous_buffers: usize,
    pub hot_pages: usize,
    pub cold_pages: usize,
    pub compressed_pages: usize,

    /// Device bytes in contiguous buffers and hot pages.
    pub hot_bytes: u64,
    pub cold_device_bytes: u64,
    /// Host bytes held by compressed cold pages.
    pub cold_host_bytes: u64,

    pub appends: u64,
    pub demotions: u64,
    pub spills: u64,
}

enum ColdStorage {
    Device(BufferHandle),
    Host(CompressedPage),
}

#[derive(Default)]
struct LayerPages {
    contiguous: Option<BufferHandle>,
    hot: BTreeMap<usize, BufferHandle>,
    cold: BTreeMap<usize, ColdStorage>,
}

struct Sequence {
    layout: KvLayout,

    /// One past the highest written position.
    len: usize,

    /// Positions below this are cold. Only ever grows.
    cold_upto: usize,

    layers: Vec<LayerPages>,
}

#[derive(Debug, Default)]
struct Counters {
    appends: u64,
    demotions: u64,
    spills: u64,
}

#[derive(Default)]
struct KvState {
    sequences: BTreeMap<SequenceId, Sequence>,
    counters: Counters,
}

/// Per-sequence, per-layer K/V storage backed by the buffer pool.
pub struct KvCache {
    pool: SharedPool,
    config: KvCacheConfig,
    num_layers: usize,
    kv_dim: usize,
    geometry: PageGeometry,
    compressor: Compressor,
    state: Mutex<KvState>,
}

impl KvCache {
    pub fn new(pool: SharedPool, config: KvCacheConfig, model: &ModelConfig) -> Self {
        let geometry = PageGeometry {
            page_size: config.page_size,
            cold_page_size: config.tiering.cold_page_size,
            hot_window: config.tiering.hot_window,
        };
        info!(
            max_seq_len = config.max_seq_len,
            page_size = config.page_size,
            kv_dtype = %config.kv_dtype,
            paged = config.uses_paged_layout(),
            tiering = config.tiering.enabled,
            "KV cache initialized"
        );
        Self {
            pool,
            compressor: Compressor::new(config.tiering.zstd_level),
            num_layers: model.num_layers,
            kv_dim: model.kv_dim(),
            geometry,
            config,
            state: Mutex::new(KvState::default()),
        }
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Layout new sequences get unless started explicitly.
    pub fn default_layout(&self) -> KvLayout {
        if self.config.uses_paged_layout() {
            KvLayout::Paged
        } else {
            KvLayout::Contiguous
        }
    }

    fn hot_dtype(&self) -> KvDtype {
        self.config.kv_dtype
    }

    fn cold_dtype(&self) -> KvDtype {
        self.config.tiering.cold_dtype
    }

    fn stride(&self, dtype: KvDtype) -> usize {
        2 * self.kv_dim * dtype.size()
    }

    fn cold_page_bytes(&self) -> usize {
        self.config.tiering.cold_page_size * self.stride(self.cold_dtype())
    }

    fn compression_block_bytes(&self) -> usize {
        self.config.tiering.compression_block_tokens * self.stride(self.cold_dtype())
    }

    fn encode_row(&self, key: &[f32], value: &[f32], dtype: KvDtype) -> Vec<u8> {
        let mut row = compressor::encode_values(key, dtype);
        row.extend(compressor::encode_values(value, dtype));
        row
    }

    fn decode_row(&self, row: &[u8], dtype: KvDtype) -> Result<(Vec<f32>, Vec<f32>), KvCacheError> {
        let mut key = compressor::decode_values(row, dtype)?;
        let value = key.split_off(self.kv_dim);
        Ok((key, value))
    }

    /// Acquire a buffer and clear it; pooled buffers carry stale data.
    fn acquire_zeroed(&self, bytes: usize, label: &str) -> Result<BufferHandle, KvCacheError> {
        let mut handle = self.pool.acquire(bytes as u64, BufferUsage::KvCache, label)?;
        handle.write(0, &vec![0u8; bytes])?;
        Ok(handle)
    }

    /// Start a sequence with an explicit layout (or the configured default).
    pub fn begin_sequence(
        &self,
        sequence_id: SequenceId,
        layout: Option<KvLayout>,
    ) -> Result<KvLayout, KvCacheError> {
        let layout = layout.unwrap_or_else(|| self.default_layout());
        let mut state = self.state.lock();
        match state.sequences.entry(sequence_id) {
            Entry::Occupied(_) => Err(KvCacheError::SequenceExists(sequence_id)),
            Entry::Vacant(slot) => {
                slot.insert(self.new_sequence(layout));
                debug!(sequence = sequence_id, ?layout, "Started sequence");
                Ok(layout)
            }
        }
    }

    fn new_sequence(&self, layout: KvLayout) -> Sequence {
        Sequence {
            layout,
            len: 0,
            cold_upto: 0,
            layers: (0..self.num_layers).map(|_| LayerPages::default()).collect(),
        }
    }

    /// Write one token's K/V rows for one layer.
    pub fn append(
        &self,
        sequence_id: SequenceId,
        layer: usize,
        key: &[f32],
        value: &[f32],
        position: usize,
    ) -> Result<(), KvCacheError> {
        if key.len() != self.kv_dim || value.len() != self.kv_dim {
            return Err(KvCacheError::ShapeMismatch {
                expected: self.kv_dim,
                key: key.len(),
                value: value.len(),
            });
        }
        if layer >= self.num_layers {
            return Err(KvCacheError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        if position >= self.config.max_seq_len {
            return Err(KvCacheError::SequenceOverflow {
                sequence_id,
                position,
                max_seq_len: self.config.max_seq_len,
            });
        }

        let mut state = self.state.lock();
        self.retry_after_spill(&mut state, |state| {
            self.write_row(state, sequence_id, layer, key, value, position)
        })?;

        if self.config.tiering.enabled {
            let demoted = self.retry_after_spill(&mut state, |state| self.demote_locked(state, sequence_id));
            if let Err(e) = demoted {
                warn!(sequence = sequence_id, error = %e, "Lazy demotion failed, pages stay hot");
            }
        }
        Ok(())
    }

    /// Store one row. Fails before touching any page if a buffer cannot be
    /// acquired, so it can be retried as a whole.
    fn write_row(
        &self,
        state: &mut KvState,
        sequence_id: SequenceId,
        layer: usize,
        key: &[f32],
        value: &[f32],
        position: usize,
    ) -> Result<(), KvCacheError> {
        let KvState {
            sequences,
            counters,
        } = state;
        let seq = sequences
            .entry(sequence_id)
            .or_insert_with(|| self.new_sequence(self.default_layout()));

        match seq.layout {
            KvLayout::Contiguous => {
                let stride = self.stride(self.hot_dtype());
                let pages = &mut seq.layers[layer];
                let buffer = match pages.contiguous.take() {
                    Some(buffer) => buffer,
                    None => {
                        let bytes = self.config.max_seq_len * stride;
                        self.acquire_zeroed(bytes, "kv.contiguous")?
                    }
                };
                let buffer = pages.contiguous.insert(buffer);
                let row = self.encode_row(key, value, self.hot_dtype());
                buffer.write((position * stride) as u64, &row)?;
            }
            KvLayout::Paged if position < seq.cold_upto => {
                self.write_cold(&mut seq.layers[layer], position, key, value)?;
            }
            KvLayout::Paged => {
                let stride = self.stride(self.hot_dtype());
                let index = self.geometry.hot_page_index(position);
                let page = match seq.layers[layer].hot.entry(index) {
                    Entry::Occupied(page) => page.into_mut(),
                    Entry::Vacant(slot) => {
                        let bytes = self.config.page_size * stride;
                        slot.insert(self.acquire_zeroed(bytes, "kv.hot")?)
                    }
                };
                let start = self.geometry.hot_page_range(index).start;
                let row = self.encode_row(key, value, self.hot_dtype());
                page.write(((position - start) * stride) as u64, &row)?;
            }
        }

        seq.len = seq.len.max(position + 1);
        counters.appends += 1;
        Ok(())
    }

    /// Convert every cold page that has left the hot window. Returns the
    /// number of cold page spans demoted.
    pub fn demote(&self, sequence_id: SequenceId) -> Result<usize, KvCacheError> {
        let mut state = self.state.lock();
        self.retry_after_spill(&mut state, |state| self.demote_locked(state, sequence_id))
    }

    fn demote_locked(&self, state: &mut KvState, sequence_id: SequenceId) -> Result<usize, KvCacheError> {
        let KvState {
            sequences,
            counters,
        } = state;
        let seq = sequences
            .get_mut(&sequence_id)
            .ok_or(KvCacheError::UnknownSequence(sequence_id))?;

        if !self.config.tiering.enabled || seq.layout != KvLayout::Paged {
            return Ok(0);
        }
        self.demote_sequence(sequence_id, seq, counters)
    }

    /// Run `op` on the locked state. If it fails for lack of pool budget,
    /// spill this cache's device cold pages and retry once. The pool's own
    /// reclaim pass cannot reach them while `state` is held.
    fn retry_after_spill<T>(
        &self,
        state: &mut KvState,
        mut op: impl FnMut(&mut KvState) -> Result<T, KvCacheError>,
    ) -> Result<T, KvCacheError> {
        let result = op(state);
        let needed = match &result {
            Err(KvCacheError::Pool(PoolError::BudgetExceeded { rounded, .. })) => Some(*rounded),
            _ => None,
        };
        let Some(needed) = needed else {
            return result;
        };

        let spilled = self.spill_cold(state, needed);
        if spilled == 0 {
            return result;
        }
        debug!(needed, spilled, "Spilled own cold pages, retrying");
        op(state)
    }

    fn demote_sequence(
        &self,
        sequence_id: SequenceId,
        seq: &mut Sequence,
        counters: &mut Counters,
    ) -> Result<usize, KvCacheError> {
        let spans = self.geometry.demotable_cold_pages(seq.len, seq.cold_upto);
        let mut demoted = 0;

        for cold_index in spans {
            // Build every layer's cold page before touching the hot ones so a
            // failure leaves the span entirely hot.
            let mut built = Vec::with_capacity(seq.layers.len());
            for pages in &seq.layers {
                built.push(self.build_cold_page(pages, cold_index)?);
            }

            let hot_pages = self.geometry.hot_pages_in_cold(cold_index);
            for (pages, cold) in seq.layers.iter_mut().zip(built) {
                if let Some(cold) = cold {
                    pages.cold.insert(cold_index, cold);
                }
                for index in hot_pages.clone() {
                    if let Some(handle) = pages.hot.remove(&index) {
                        handle.release();
                    }
                }
            }

            seq.cold_upto = self.geometry.cold_page_range(cold_index).end;
            counters.demotions += 1;
            demoted += 1;
            debug!(
                sequence = sequence_id,
                cold_page = cold_index,
                cold_upto = seq.cold_upto,
                "Demoted KV page"
            );
        }
        Ok(demoted)
    }

    fn build_cold_page(
        &self,
        pages: &LayerPages,
        cold_index: usize,
    ) -> Result<Option<ColdStorage>, KvCacheError> {
        let hot_pages = self.geometry.hot_pages_in_cold(cold_index);
        if !hot_pages.clone().any(|index| pages.hot.contains_key(&index)) {
            return Ok(None);
        }

        let hot_page_bytes = self.config.page_size * self.stride(self.hot_dtype());
        let mut raw = Vec::with_capacity(self.cold_page_bytes());
        for index in hot_pages {
            let hot = match pages.hot.get(&index) {
                Some(handle) => handle.read_vec(0, hot_page_bytes)?,
                None => vec![0u8; hot_page_bytes],
            };
            raw.extend(compressor::convert(&hot, self.hot_dtype(), self.cold_dtype())?);
        }
        self.store_cold(raw).map(Some)
    }

    fn store_cold(&self, raw: Vec<u8>) -> Result<ColdStorage, KvCacheError> {
        match self.config.tiering.compression {
            ColdCompression::Zstd => Ok(ColdStorage::Host(
                self.compressor
                    .compress_page(&raw, self.compression_block_bytes())?,
            )),
            ColdCompression::None => {
                let mut handle = self
                    .pool
                    .acquire(raw.len() as u64, BufferUsage::KvCache, "kv.cold")?;
                handle.write(0, &raw)?;
                Ok(ColdStorage::Device(handle))
            }
        }
    }

    /// Late write into a position that is already cold. Stays cold.
    fn write_cold(
        &self,
        pages: &mut LayerPages,
        position: usize,
        key: &[f32],
        value: &[f32],
    ) -> Result<(), KvCacheError> {
        let stride = self.stride(self.cold_dtype());
        let index = self.geometry.cold_page_index(position);
        let token = position - self.geometry.cold_page_range(index).start;
        let row = self.encode_row(key, value, self.cold_dtype());

        let storage = match pages.cold.entry(index) {
            Entry::Occupied(storage) => storage.into_mut(),
            Entry::Vacant(slot) => slot.insert(self.store_cold(vec![0u8; self.cold_page_bytes()])?),
        };

        match storage {
            ColdStorage::Device(handle) => handle.write((token * stride) as u64, &row)?,
            ColdStorage::Host(page) => {
                let block_tokens = self.config.tiering.compression_block_tokens;
                let block = token / block_tokens;
                let mut raw = self.compressor.read_block(page, block)?;
                let offset = (token % block_tokens) * stride;
                raw[offset..offset + stride].copy_from_slice(&row);
                self.compressor.write_block(page, block, &raw)?;
            }
        }
        Ok(())
    }

    fn read_cold(&self, pages: &LayerPages, position: usize) -> Result<Vec<u8>, KvCacheError> {
        let stride = self.stride(self.cold_dtype());
        let index = self.geometry.cold_page_index(position);
        let token = position - self.geometry.cold_page_range(index).start;

        match pages.cold.get(&index) {
            None => Ok(vec![0u8; stride]),
            Some(ColdStorage::Device(handle)) => Ok(handle.read_vec((token * stride) as u64, stride)?),
            Some(ColdStorage::Host(page)) => {
                let block_tokens = self.config.tiering.compression_block_tokens;
                let raw = self.compressor.read_block(page, token / block_tokens)?;
                let offset = (token % block_tokens) * stride;
                Ok(raw[offset..offset + stride].to_vec())
            }
        }
    }

    /// Read one token's K/V rows from whichever tier holds them.
    pub fn read(
        &self,
        sequence_id: SequenceId,
        layer: usize,
        position: usize,
    ) -> Result<(Vec<f32>, Vec<f32>), KvCacheError> {
        let state = self.state.lock();
        let seq = state
            .sequences
            .get(&sequence_id)
            .ok_or(KvCacheError::UnknownSequence(sequence_id))?;
        let pages = seq.layers.get(layer).ok_or(KvCacheError::LayerOutOfRange {
            layer,
            num_layers: self.num_layers,
        })?;
        if position >= seq.len {
            return Err(KvCacheError::PositionNotWritten {
                sequence_id,
                position,
                len: seq.len,
            });
        }

        let hot_stride = self.stride(self.hot_dtype());
        match seq.layout {
            KvLayout::Contiguous => {
                let row = match &pages.contiguous {
                    Some(buffer) => buffer.read_vec((position * hot_stride) as u64, hot_stride)?,
                    None => vec![0u8; hot_stride],
                };
                self.decode_row(&row, self.hot_dtype())
            }
            KvLayout::Paged if position < seq.cold_upto => {
                let row = self.read_cold(pages, position)?;
                self.decode_row(&row, self.cold_dtype())
            }
            KvLayout::Paged => {
                let index = self.geometry.hot_page_index(position);
                let start = self.geometry.hot_page_range(index).start;
                let row = match pages.hot.get(&index) {
                    Some(page) => page.read_vec(((position - start) * hot_stride) as u64, hot_stride)?,
                    None => vec![0u8; hot_stride],
                };
                self.decode_row(&row, self.hot_dtype())
            }
        }
    }

    /// Page holding `position`, if one has been allocated.
    pub fn page_tier(&self, sequence_id: SequenceId, layer: usize, position: usize) -> Option<PageInfo> {
        let state = self.state.lock();
        let seq = state.sequences.get(&sequence_id)?;
        let pages = seq.layers.get(layer)?;

        let info = |tokens, dtype, tier, compressed| PageInfo {
            sequence_id,
            layer,
            tokens,
            dtype,
            tier,
            compressed,
        };

        match seq.layout {
            KvLayout::Contiguous => pages
                .contiguous
                .as_ref()
                .map(|_| info(0..self.config.max_seq_len, self.hot_dtype(), Tier::Hot, false)),
            KvLayout::Paged if position < seq.cold_upto => {
                let index = self.geometry.cold_page_index(position);
                pages.cold.get(&index).map(|storage| {
                    info(
                        self.geometry.cold_page_range(index),
                        self.cold_dtype(),
                        Tier::Cold,
                        matches!(storage, ColdStorage::Host(_)),
                    )
                })
            }
            KvLayout::Paged => {
                let index = self.geometry.hot_page_index(position);
                pages.hot.get(&index).map(|_| {
                    info(self.geometry.hot_page_range(index), self.hot_dtype(), Tier::Hot, false)
                })
            }
        }
    }

    /// One past the highest written position.
    pub fn sequence_len(&self, sequence_id: SequenceId) -> Option<usize> {
        self.state.lock().sequences.get(&sequence_id).map(|s| s.len)
    }

    pub fn sequence_layout(&self, sequence_id: SequenceId) -> Option<KvLayout> {
        self.state.lock().sequences.get(&sequence_id).map(|s| s.layout)
    }

    pub fn sequences(&self) -> Vec<SequenceId> {
        self.state.lock().sequences.keys().copied().collect()
    }

    /// Free all of a sequence's pages back to the pool.
    pub fn release(&self, sequence_id: SequenceId) -> Result<(), KvCacheError> {
        let seq = self
            .state
            .lock()
            .sequences
            .remove(&sequence_id)
            .ok_or(KvCacheError::UnknownSequence(sequence_id))?;
        debug!(sequence = sequence_id, len = seq.len, "Released sequence");
        drop(seq);
        Ok(())
    }

    /// Release every sequence. Returns how many there were.
    pub fn release_all(&self) -> usize {
        let sequences = std::mem::take(&mut self.state.lock().sequences);
        let count = sequences.len();
        drop(sequences);
        if count > 0 {
            info!(sequences = count, "Released all KV sequences");
        }
        count
    }

    pub fn stats(&self) -> KvStats {
        let state = self.state.lock();
        let mut stats = KvStats {
            sequences: state.sequences.len(),
            appends: state.counters.appends,
            demotions: state.counters.demotions,
            spills: state.counters.spills,
            ..KvStats::default()
        };

        for pages in state.sequences.values().flat_map(|s| &s.layers) {
            if let Some(buffer) = &pages.contiguous {
                stats.contiguous_buffers += 1;
                stats.hot_bytes += buffer.size();
            }
            stats.hot_pages += pages.hot.len();
            stats.hot_bytes += pages.hot.values().map(BufferHandle::size).sum::<u64>();
            for storage in pages.cold.values() {
                stats.cold_pages += 1;
                match storage {
                    ColdStorage::Device(handle) => stats.cold_device_bytes += handle.size(),
                    ColdStorage::Host(page) => {
                        stats.compressed_pages += 1;
                        stats.cold_host_bytes += page.compressed_len() as u64;
                    }
                }
            }
        }
        stats
    }

    fn spill(&self, handle: &BufferHandle) -> Result<CompressedPage, KvCacheError> {
        let raw = handle.read_vec(0, self.cold_page_bytes())?;
        Ok(self
            .compressor
            .compress_page(&raw, self.compression_block_bytes())?)
    }

    /// Spill device cold pages to compressed host storage, oldest sequences
    /// first, until `target_bytes` of device memory went back to the pool.
    fn spill_cold(&self, state: &mut KvState, target_bytes: u64) -> u64 {
        let KvState {
            sequences,
            counters,
        } = state;

        let mut released = 0;
        'sequences: for (sequence_id, seq) in sequences.iter_mut() {
            for pages in &mut seq.layers {
                for storage in pages.cold.values_mut() {
                    if released >= target_bytes {
                        break 'sequences;
                    }
                    let spilled = match storage {
                        ColdStorage::Device(handle) => self.spill(handle),
                        ColdStorage::Host(_) => continue,
                    };
                    match spilled {
                        Ok(page) => {
                            if let ColdStorage::Device(handle) =
                                std::mem::replace(storage, ColdStorage::Host(page))
                            {
                                released += handle.size();
                                handle.release();
                            }
                            counters.spills += 1;
                        }
                        Err(e) => {
                            warn!(sequence = *sequence_id, error = %e, "Failed to spill cold page");
                        }
                    }
                }
            }
        }

        released
    }
}

impl MemoryReclaimer for KvCache {
    fn name(&self) -> &str {
        "kv_cache"
    }

    /// Spill device cold pages to compressed host storage, oldest sequences first.
    /// Hot pages are never touched.
    fn reclaim(&self, target_bytes: u64) -> u64 {
        // Held by an append that is itself allocating; it spills on its own.
        let Some(mut state) = self.state.try_lock() else {
            debug!("KV cache busy, skipping reclaim");
            return 0;
        };
        let released = self.spill_cold(&mut state, target_bytes);
        if released > 0 {
            info!(released, "Spilled cold KV pages to host");
        }
        released
    }
}
