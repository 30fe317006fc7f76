//! Caches backed by the buffer pool.
//!
//! - [`shard`]: LRU cache of validated weight shards with coalesced loads
//! - [`expert`]: byte-budgeted LRU cache of MoE expert weights
//! - [`kv`]: per-sequence K/V storage with hot/cold tiering
//! - [`page`]: KV page geometry and tier definitions
//! - [`evictor`]: LRU bookkeeping shared by the caches
//! - [`compressor`]: dtype conversion and zstd block compression for cold pages

pub mod compressor;
pub mod evictor;
pub mod expert;
pub mod kv;
pub mod page;
pub mod shard;

pub use expert::{
    ExpertCache, ExpertCacheStats, ExpertError, ExpertLocator, ExpertWeightSpec, ExpertWeights,
    WeightLayout,
};
pub use kv::{KvCache, KvCacheError, KvStats};
pub use page::{KvLayout, PageInfo, SequenceId, Tier, PAGED_LAYOUT_SEQ_LEN_THRESHOLD};
pub use shard::{CorruptReason, Shard, ShardCache, ShardCacheStats, ShardError};
