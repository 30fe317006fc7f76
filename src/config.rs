//! Runtime configuration for gpu-residency.
//!
//! Every knob is a plain number or enum with a documented default. A config
//! file holds [`ConfigOverrides`]: a partial tree that [`Config::merge`] folds
//! onto the defaults field by field.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::page::PAGED_LAYOUT_SEQ_LEN_THRESHOLD;
use crate::fetch::ShardSource;
use crate::quant::QuantKind;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gpu-residency",
    about = "GPU buffer pool, weight caches and tiered KV cache for quantized inference"
)]
pub struct Cli {
    /// Path to configuration overrides (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the codec byte layout for a tensor size.
    Sizes {
        /// Number of tensor elements.
        elements: u64,

        /// Restrict to one quantization kind (e.g. q4_k).
        #[arg(long)]
        kind: Option<String>,
    },

    /// Run a synthetic shard + KV workload against a host-backed device.
    Simulate {
        /// Number of weight shards in the synthetic model.
        #[arg(long, default_value_t = 8)]
        shards: u32,

        /// Concurrent sequences.
        #[arg(long, default_value_t = 2)]
        sequences: u64,

        /// Tokens generated per sequence.
        #[arg(long, default_value_t = 512)]
        tokens: usize,

        /// Simulated device memory in MiB.
        #[arg(long, default_value_t = 512)]
        device_mib: u64,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Buffer pool limits and budget.
    pub pool: PoolConfig,

    /// Weight shard cache sizing.
    pub shard_cache: ShardCacheConfig,

    /// MoE expert cache budget.
    pub expert_cache: ExpertCacheConfig,

    /// KV cache layout and tiering.
    pub kv_cache: KvCacheConfig,

    /// Fetch retry and download concurrency.
    pub distribution: DistributionConfig,

    /// Model shape consumed by the caches.
    pub model: ModelConfig,
}

/// Size-class rules for pooled buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Smallest bucket; smaller requests round up to it.
    pub min_bucket_bytes: u64,

    /// Requests at or above this size use linear steps instead of powers of two.
    pub large_buffer_threshold: u64,

    /// Linear step for large buffers.
    pub large_buffer_step: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            min_bucket_bytes: 256,
            large_buffer_threshold: 32 * MIB,
            large_buffer_step: 16 * MIB,
        }
    }
}

/// Global byte budget for the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Hard budget in bytes (`None` = the device's total memory).
    pub max_total_bytes: Option<u64>,

    /// Fraction of the budget above which pooled buffers are reclaimed first.
    pub high_watermark_ratio: f64,

    /// Fraction of the budget an emergency trim shrinks usage to.
    pub emergency_trim_target_ratio: f64,

    /// Fail allocations that cannot fit instead of allocating over budget.
    pub hard_fail_on_budget_exceeded: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: None,
            high_watermark_ratio: 0.9,
            emergency_trim_target_ratio: 0.75,
            hard_fail_on_budget_exceeded: true,
        }
    }
}

/// Buffer pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub buckets: BucketConfig,

    /// Maximum idle buffers kept per bucket.
    pub max_buffers_per_bucket: usize,

    /// Maximum idle buffers kept across all buckets.
    pub max_total_pooled_buffers: usize,

    pub budget: BudgetConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buckets: BucketConfig::default(),
            max_buffers_per_bucket: 8,
            max_total_pooled_buffers: 64,
            budget: BudgetConfig::default(),
        }
    }
}

/// Shard cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardCacheConfig {
    /// Entries kept when shards come from fast local storage.
    pub opfs_entries: usize,

    /// Entries kept when shards come over the network.
    pub network_entries: usize,

    /// Upper bound on the MoE-derived entry count.
    pub moe_max_entries: usize,

    /// Verify shard hashes on the transition to resident.
    pub verify_hashes: bool,

    /// Concurrent shard loads (0 = unbounded).
    pub max_concurrent_loads: usize,
}

impl Default for ShardCacheConfig {
    fn default() -> Self {
        Self {
            opfs_entries: 2,
            network_entries: 16,
            moe_max_entries: 64,
            verify_hashes: true,
            max_concurrent_loads: 4,
        }
    }
}

impl ShardCacheConfig {
    /// Entry capacity for shards from `source`.
    ///
    /// MoE models override the source-based size with
    /// `min(experts_per_token * layers, moe_max_entries)`.
    pub fn capacity_for(&self, source: ShardSource, model: &ModelConfig) -> usize {
        if let Some(experts_per_token) = model.experts_per_token {
            let wanted = experts_per_token.saturating_mul(model.num_layers);
            return wanted.min(self.moe_max_entries).max(1);
        }
        match source {
            ShardSource::Local => self.opfs_entries,
            ShardSource::Network => self.network_entries,
        }
    }
}

/// Expert cache budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertCacheConfig {
    /// Default byte budget.
    pub default_size_bytes: u64,

    /// Fraction of the adapter's max buffer size the cache may use.
    pub max_buffer_percentage: f64,

    /// Cap applied when the adapter limit is large or unknown.
    pub max_buffer_fallback_bytes: u64,
}

impl Default for ExpertCacheConfig {
    fn default() -> Self {
        Self {
            default_size_bytes: 2 * GIB,
            max_buffer_percentage: 0.25,
            max_buffer_fallback_bytes: GIB,
        }
    }
}

impl ExpertCacheConfig {
    /// Byte budget given the device's maximum single-buffer size.
    pub fn budget_bytes(&self, adapter_max_buffer_bytes: u64) -> u64 {
        let from_adapter = (adapter_max_buffer_bytes as f64 * self.max_buffer_percentage) as u64;
        from_adapter
            .min(self.max_buffer_fallback_bytes)
            .min(self.default_size_bytes)
    }
}

/// Element type stored in KV pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvDtype {
    F16,
    F32,
}

impl KvDtype {
    pub fn size(&self) -> usize {
        match self {
            KvDtype::F16 => 2,
            KvDtype::F32 => 4,
        }
    }

    pub fn quant_kind(&self) -> QuantKind {
        match self {
            KvDtype::F16 => QuantKind::F16,
            KvDtype::F32 => QuantKind::F32,
        }
    }
}

impl std::fmt::Display for KvDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.quant_kind().as_str())
    }
}

/// How a sequence's KV storage is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutPolicy {
    /// Paged once `max_seq_len` exceeds the paging threshold.
    Auto,
    Contiguous,
    Paged,
}

/// Compression of cold KV pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColdCompression {
    None,
    Zstd,
}

/// Hot/cold tiering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieringConfig {
    pub enabled: bool,

    /// Most recent tokens kept in the hot tier.
    pub hot_window: usize,

    /// Tokens per cold page (a multiple of the hot page size).
    pub cold_page_size: usize,

    pub cold_dtype: KvDtype,

    pub compression: ColdCompression,

    /// Tokens per independently compressed block.
    pub compression_block_tokens: usize,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hot_window: 1024,
            cold_page_size: 1024,
            cold_dtype: KvDtype::F16,
            compression: ColdCompression::None,
            compression_block_tokens: 64,
            zstd_level: 3,
        }
    }
}

/// KV cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheConfig {
    pub max_seq_len: usize,

    /// Tokens per hot page.
    pub page_size: usize,

    /// Hot-tier element type.
    pub kv_dtype: KvDtype,

    pub layout: LayoutPolicy,

    pub tiering: TieringConfig,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 4096,
            page_size: 256,
            kv_dtype: KvDtype::F16,
            layout: LayoutPolicy::Auto,
            tiering: TieringConfig::default(),
        }
    }
}

impl KvCacheConfig {
    /// Whether new sequences use the paged layout.
    pub fn uses_paged_layout(&self) -> bool {
        match self.layout {
            LayoutPolicy::Auto => self.max_seq_len > PAGED_LAYOUT_SEQ_LEN_THRESHOLD,
            LayoutPolicy::Contiguous => false,
            LayoutPolicy::Paged => true,
        }
    }
}

/// Shard fetch retry policy and download concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub concurrent_downloads: usize,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: 3,
            max_retries: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 10_000,
        }
    }
}

/// Model shape needed for cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub num_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub num_kv_heads: usize,

    pub head_dim: usize,

    /// Experts routed per token (MoE models only).
    pub experts_per_token: Option<usize>,

    /// Experts per MoE layer.
    pub num_experts: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_layers: 32,
            num_kv_heads: 8,
            head_dim: 128,
            experts_per_token: None,
            num_experts: None,
        }
    }
}

impl ModelConfig {
    /// Width of one token's key (or value) vector in one layer.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn is_moe(&self) -> bool {
        self.experts_per_token.is_some()
    }
}

// ─── Overrides ──────────────────────────────────────────────────────────────

/// Partial configuration as read from a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub pool: PoolOverrides,
    pub shard_cache: ShardCacheOverrides,
    pub expert_cache: ExpertCacheOverrides,
    pub kv_cache: KvCacheOverrides,
    pub distribution: DistributionOverrides,
    pub model: ModelOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOverrides {
    pub buckets: BucketOverrides,
    pub max_buffers_per_bucket: Option<usize>,
    pub max_total_pooled_buffers: Option<usize>,
    pub budget: BudgetOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketOverrides {
    pub min_bucket_bytes: Option<u64>,
    pub large_buffer_threshold: Option<u64>,
    pub large_buffer_step: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetOverrides {
    pub max_total_bytes: Option<u64>,
    pub high_watermark_ratio: Option<f64>,
    pub emergency_trim_target_ratio: Option<f64>,
    pub hard_fail_on_budget_exceeded: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardCacheOverrides {
    pub opfs_entries: Option<usize>,
    pub network_entries: Option<usize>,
    pub moe_max_entries: Option<usize>,
    pub verify_hashes: Option<bool>,
    pub max_concurrent_loads: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpertCacheOverrides {
    pub default_size_bytes: Option<u64>,
    pub max_buffer_percentage: Option<f64>,
    pub max_buffer_fallback_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringOverrides {
    pub enabled: Option<bool>,
    pub hot_window: Option<usize>,
    pub cold_page_size: Option<usize>,
    pub cold_dtype: Option<KvDtype>,
    pub compression: Option<ColdCompression>,
    pub compression_block_tokens: Option<usize>,
    pub zstd_level: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheOverrides {
    pub max_seq_len: Option<usize>,
    pub page_size: Option<usize>,
    pub kv_dtype: Option<KvDtype>,
    pub layout: Option<LayoutPolicy>,
    pub tiering: TieringOverrides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionOverrides {
    pub concurrent_downloads: Option<usize>,
    pub max_retries: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub num_layers: Option<usize>,
    pub num_kv_heads: Option<usize>,
    pub head_dim: Option<usize>,
    pub experts_per_token: Option<usize>,
    pub num_experts: Option<usize>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl Config {
    /// Load overrides from a JSON file and merge them onto the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let overrides: ConfigOverrides =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let config = Config::default().merge(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Deep-merge `overrides` onto `self`.
    ///
    /// Every leaf falls back per field and nested sections are merged, never
    /// replaced. `Option` leaves can be set but not cleared by an override.
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        let ConfigOverrides {
            pool,
            shard_cache,
            expert_cache,
            kv_cache,
            distribution,
            model,
        } = overrides;

        set(&mut self.pool.buckets.min_bucket_bytes, pool.buckets.min_bucket_bytes);
        set(
            &mut self.pool.buckets.large_buffer_threshold,
            pool.buckets.large_buffer_threshold,
        );
        set(&mut self.pool.buckets.large_buffer_step, pool.buckets.large_buffer_step);
        set(&mut self.pool.max_buffers_per_bucket, pool.max_buffers_per_bucket);
        set(&mut self.pool.max_total_pooled_buffers, pool.max_total_pooled_buffers);
        set_opt(&mut self.pool.budget.max_total_bytes, pool.budget.max_total_bytes);
        set(
            &mut self.pool.budget.high_watermark_ratio,
            pool.budget.high_watermark_ratio,
        );
        set(
            &mut self.pool.budget.emergency_trim_target_ratio,
            pool.budget.emergency_trim_target_ratio,
        );
        set(
            &mut self.pool.budget.hard_fail_on_budget_exceeded,
            pool.budget.hard_fail_on_budget_exceeded,
        );

        set(&mut self.shard_cache.opfs_entries, shard_cache.opfs_entries);
        set(&mut self.shard_cache.network_entries, shard_cache.network_entries);
        set(&mut self.shard_cache.moe_max_entries, shard_cache.moe_max_entries);
        set(&mut self.shard_cache.verify_hashes, shard_cache.verify_hashes);
        set(
            &mut self.shard_cache.max_concurrent_loads,
            shard_cache.max_concurrent_loads,
        );

        set(
            &mut self.expert_cache.default_size_bytes,
            expert_cache.default_size_bytes,
        );
        set(
            &mut self.expert_cache.max_buffer_percentage,
            expert_cache.max_buffer_percentage,
        );
        set(
            &mut self.expert_cache.max_buffer_fallback_bytes,
            expert_cache.max_buffer_fallback_bytes,
        );

        set(&mut self.kv_cache.max_seq_len, kv_cache.max_seq_len);
        set(&mut self.kv_cache.page_size, kv_cache.page_size);
        set(&mut self.kv_cache.kv_dtype, kv_cache.kv_dtype);
        set(&mut self.kv_cache.layout, kv_cache.layout);
        let tiering = &mut self.kv_cache.tiering;
        set(&mut tiering.enabled, kv_cache.tiering.enabled);
        set(&mut tiering.hot_window, kv_cache.tiering.hot_window);
        set(&mut tiering.cold_page_size, kv_cache.tiering.cold_page_size);
        set(&mut tiering.cold_dtype, kv_cache.tiering.cold_dtype);
        set(&mut tiering.compression, kv_cache.tiering.compression);
        set(
            &mut tiering.compression_block_tokens,
            kv_cache.tiering.compression_block_tokens,
        );
        set(&mut tiering.zstd_level, kv_cache.tiering.zstd_level);

        set(
            &mut self.distribution.concurrent_downloads,
            distribution.concurrent_downloads,
        );
        set(&mut self.distribution.max_retries, distribution.max_retries);
        set(
            &mut self.distribution.initial_retry_delay_ms,
            distribution.initial_retry_delay_ms,
        );
        set(
            &mut self.distribution.max_retry_delay_ms,
            distribution.max_retry_delay_ms,
        );

        set(&mut self.model.num_layers, model.num_layers);
        set(&mut self.model.num_kv_heads, model.num_kv_heads);
        set(&mut self.model.head_dim, model.head_dim);
        set_opt(&mut self.model.experts_per_token, model.experts_per_token);
        set_opt(&mut self.model.num_experts, model.num_experts);

        self
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }
        fn ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(invalid(field, format!("{value} is outside (0, 1]")))
            }
        }

        let buckets = &self.pool.buckets;
        if buckets.min_bucket_bytes == 0 {
            return Err(invalid("pool.buckets.min_bucket_bytes", "must be non-zero"));
        }
        if buckets.large_buffer_step == 0 {
            return Err(invalid("pool.buckets.large_buffer_step", "must be non-zero"));
        }
        if self.pool.budget.max_total_bytes == Some(0) {
            return Err(invalid("pool.budget.max_total_bytes", "must be non-zero"));
        }
        ratio(
            "pool.budget.high_watermark_ratio",
            self.pool.budget.high_watermark_ratio,
        )?;
        ratio(
            "pool.budget.emergency_trim_target_ratio",
            self.pool.budget.emergency_trim_target_ratio,
        )?;
        ratio(
            "expert_cache.max_buffer_percentage",
            self.expert_cache.max_buffer_percentage,
        )?;

        let shards = &self.shard_cache;
        if shards.opfs_entries == 0 || shards.network_entries == 0 || shards.moe_max_entries == 0 {
            return Err(invalid("shard_cache", "entry caps must be non-zero"));
        }

        let kv = &self.kv_cache;
        if kv.max_seq_len == 0 {
            return Err(invalid("kv_cache.max_seq_len", "must be non-zero"));
        }
        if kv.page_size == 0 {
            return Err(invalid("kv_cache.page_size", "must be non-zero"));
        }
        if kv.tiering.enabled {
            let t = &kv.tiering;
            if t.hot_window < kv.page_size {
                return Err(invalid(
                    "kv_cache.tiering.hot_window",
                    format!("{} is smaller than page_size {}", t.hot_window, kv.page_size),
                ));
            }
            if t.cold_page_size == 0 || t.cold_page_size % kv.page_size != 0 {
                return Err(invalid(
                    "kv_cache.tiering.cold_page_size",
                    format!("{} is not a multiple of page_size {}", t.cold_page_size, kv.page_size),
                ));
            }
            if t.compression_block_tokens == 0 {
                return Err(invalid("kv_cache.tiering.compression_block_tokens", "must be non-zero"));
            }
            if !(1..=22).contains(&t.zstd_level) {
                return Err(invalid("kv_cache.tiering.zstd_level", "must be in 1..=22"));
            }
        }

        if self.model.num_layers == 0 || self.model.kv_dim() == 0 {
            return Err(invalid("model", "layers, kv heads and head_dim must be non-zero"));
        }
        if self.model.experts_per_token == Some(0) {
            return Err(invalid("model.experts_per_token", "must be non-zero"));
        }

        Ok(())
    }

    /// Bytes of K+V for one token in one layer at `dtype`.
    pub fn kv_token_bytes(&self, dtype: KvDtype) -> usize {
        2 * self.model.kv_dim() * dtype.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.pool.max_buffers_per_bucket, 8);
        assert_eq!(cfg.shard_cache.opfs_entries, 2);
        assert_eq!(cfg.shard_cache.network_entries, 16);
        assert_eq!(cfg.kv_cache.page_size, 256);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_merge_is_per_field() {
        let overrides: ConfigOverrides = serde_json::from_str(
            r#"{
                "pool": { "budget": { "max_total_bytes": 1048576 } },
                "kv_cache": { "tiering": { "enabled": true, "hot_window": 512 } }
            }"#,
        )
        .unwrap();

        let cfg = Config::default().merge(overrides);
        assert_eq!(cfg.pool.budget.max_total_bytes, Some(1048576));
        // Siblings of an overridden field keep their defaults.
        assert_eq!(cfg.pool.budget.high_watermark_ratio, 0.9);
        assert!(cfg.pool.budget.hard_fail_on_budget_exceeded);
        assert_eq!(cfg.pool.max_buffers_per_bucket, 8);
        assert!(cfg.kv_cache.tiering.enabled);
        assert_eq!(cfg.kv_cache.tiering.hot_window, 512);
        assert_eq!(cfg.kv_cache.tiering.cold_page_size, 1024);
        assert_eq!(cfg.kv_cache.page_size, 256);
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut cfg = Config::default();
        cfg.pool.budget.high_watermark_ratio = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_misaligned_cold_pages() {
        let mut cfg = Config::default();
        cfg.kv_cache.tiering.enabled = true;
        cfg.kv_cache.tiering.cold_page_size = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_expert_budget_takes_minimum() {
        let cfg = ExpertCacheConfig::default();
        // 25% of 2 GiB = 512 MiB, below both caps.
        assert_eq!(cfg.budget_bytes(2 * GIB), 512 * MIB);
        // 25% of 16 GiB = 4 GiB, capped by the 1 GiB fallback.
        assert_eq!(cfg.budget_bytes(16 * GIB), GIB);
    }

    #[test]
    fn test_shard_capacity_by_source() {
        let cfg = ShardCacheConfig::default();
        let mut model = ModelConfig::default();
        assert_eq!(cfg.capacity_for(ShardSource::Local, &model), 2);
        assert_eq!(cfg.capacity_for(ShardSource::Network, &model), 16);

        model.experts_per_token = Some(4);
        model.num_layers = 24;
        assert_eq!(cfg.capacity_for(ShardSource::Local, &model), 64);
        model.num_layers = 4;
        assert_eq!(cfg.capacity_for(ShardSource::Network, &model), 16);
    }

    #[test]
    fn test_paged_layout_threshold() {
        let mut kv = KvCacheConfig::default();
        assert!(!kv.uses_paged_layout());
        kv.max_seq_len = PAGED_LAYOUT_SEQ_LEN_THRESHOLD + 1;
        assert!(kv.uses_paged_layout());
        kv.layout = LayoutPolicy::Contiguous;
        assert!(!kv.uses_paged_layout());
    }

    #[test]
    fn test_kv_token_bytes() {
        let cfg = Config::default();
        // K+V * kv_heads(8) * head_dim(128) * fp16
        assert_eq!(cfg.kv_token_bytes(KvDtype::F16), 2 * 8 * 128 * 2);
    }
}
