//! gpu-residency: device memory residency for quantized LLM inference.
//!
//! A bucketed buffer pool is the single arbiter of device memory. On top of
//! it sit an LRU cache of weight shards, a byte-budgeted cache of MoE expert
//! weights and a per-sequence KV cache with hot/cold tiering. Under memory
//! pressure the pool asks the caches to give buffers back.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod fetch;
pub mod gpu;
pub mod metrics;
pub mod quant;
pub mod runtime;

pub use config::Config;
pub use runtime::{ResourceManager, ResourceStats, RuntimeError};
