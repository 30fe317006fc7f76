//! Pool pressure and cache eviction working together.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use gpu_residency::cache::{ExpertLocator, ExpertWeightSpec, WeightLayout};
use gpu_residency::config::{ColdCompression, Config, KvDtype, LayoutPolicy};
use gpu_residency::fetch::{FetchError, ShardFetcher, ShardMeta, ShardSource};
use gpu_residency::gpu::{BufferPool, BufferUsage, HostDevice, PoolError, PressureEvent};
use gpu_residency::quant::QuantKind;
use gpu_residency::ResourceManager;

const SHARD_BYTES: u64 = 4096;

/// Serves F32 shards of 1024 elements filled with the shard index.
struct Filled;

#[async_trait]
impl ShardFetcher for Filled {
    fn source(&self) -> ShardSource {
        ShardSource::Network
    }

    async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError> {
        Ok(Bytes::from(vec![meta.index as u8; SHARD_BYTES as usize]))
    }
}

fn manifest(count: u32) -> impl Iterator<Item = ShardMeta> {
    (0..count).map(|i| ShardMeta::single(i, "w", SHARD_BYTES / 4, QuantKind::F32))
}

fn small_model(config: &mut Config) {
    config.model.num_layers = 1;
    config.model.num_kv_heads = 1;
    config.model.head_dim = 8;
}

#[test]
fn test_pool_reuses_bucket() {
    let pool = BufferPool::new(Arc::new(HostDevice::new(1 << 20)), Default::default());
    let first = pool.acquire(1000, BufferUsage::Storage, "a").unwrap();
    assert_eq!(first.size(), 1024);
    first.release();

    let second = pool.acquire(900, BufferUsage::Storage, "b").unwrap();
    assert_eq!(second.size(), 1024);
    assert_eq!(second.requested_bytes(), 900);
    let stats = pool.stats();
    assert_eq!(stats.reuses, 1);
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.current_bytes, 1024);
}

#[tokio::test]
async fn test_emergency_trim_evicts_unpinned_shards() {
    let mut config = Config::default();
    small_model(&mut config);
    config.pool.budget.max_total_bytes = Some(4 * SHARD_BYTES);

    let manager = ResourceManager::new(
        config,
        Arc::new(HostDevice::new(1 << 20)),
        Arc::new(Filled),
        manifest(4),
        None,
    )
    .unwrap();
    let mut events = manager.pool().subscribe();

    let pinned = manager.shards().get(2).await.unwrap();
    for index in [0, 1] {
        drop(manager.shards().get(index).await.unwrap());
    }
    assert_eq!(manager.pool().stats().current_bytes, 3 * SHARD_BYTES);

    // Needs two shards' worth of room; only the two unpinned shards can go.
    let scratch = manager
        .pool()
        .acquire(2 * SHARD_BYTES, BufferUsage::Staging, "scratch")
        .unwrap();

    assert!(manager.shards().contains(2));
    assert!(!manager.shards().contains(0));
    assert!(!manager.shards().contains(1));
    assert_eq!(pinned.read(0, 4).unwrap(), vec![2; 4]);

    let stats = manager.pool().stats();
    assert_eq!(stats.emergency_trims, 1);
    assert!(stats.current_bytes <= 4 * SHARD_BYTES);

    let mut saw_trim = false;
    while let Ok(event) = events.try_recv() {
        if let PressureEvent::EmergencyTrim { reclaimed_bytes, .. } = event {
            assert_eq!(reclaimed_bytes, 2 * SHARD_BYTES);
            saw_trim = true;
        }
    }
    assert!(saw_trim);
    drop(scratch);
}

#[tokio::test]
async fn test_budget_exceeded_when_everything_pinned() {
    let mut config = Config::default();
    small_model(&mut config);
    config.pool.budget.max_total_bytes = Some(2 * SHARD_BYTES);

    let manager = ResourceManager::new(
        config,
        Arc::new(HostDevice::new(1 << 20)),
        Arc::new(Filled),
        manifest(4),
        None,
    )
    .unwrap();

    let _a = manager.shards().get(0).await.unwrap();
    let _b = manager.shards().get(1).await.unwrap();

    match manager.shards().get(2).await {
        Err(gpu_residency::cache::ShardError::Pool {
            source: PoolError::BudgetExceeded { requested, max_total_bytes, .. },
            ..
        }) => {
            assert_eq!(requested, SHARD_BYTES);
            assert_eq!(max_total_bytes, 2 * SHARD_BYTES);
        }
        other => panic!("expected budget failure, got {other:?}"),
    }
    assert!(!manager.shards().is_loading(2));
    assert_eq!(manager.pool().stats().budget_failures, 1);
}

#[tokio::test]
async fn test_reclaim_order_prefers_experts() {
    let mut config = Config::default();
    small_model(&mut config);
    config.pool.budget.max_total_bytes = Some(5 * SHARD_BYTES);
    config.pool.budget.emergency_trim_target_ratio = 1.0;

    let locator: Arc<dyn ExpertLocator> = Arc::new(|expert_id: u32, _layer: usize| {
        Some(ExpertWeightSpec {
            shard_index: expert_id,
            tensors: vec!["w".to_string()],
            layout: WeightLayout::Raw,
        })
    });
    let manager = ResourceManager::new(
        config,
        Arc::new(HostDevice::new(1 << 20)),
        Arc::new(Filled),
        manifest(4),
        Some(locator),
    )
    .unwrap();

    // Two shards plus the two experts staged from them.
    for expert in [0, 1] {
        drop(manager.get_expert(expert, 0).await.unwrap());
    }
    assert_eq!(manager.pool().stats().current_bytes, 4 * SHARD_BYTES);

    let _big = manager
        .pool()
        .acquire(2 * SHARD_BYTES, BufferUsage::Staging, "scratch")
        .unwrap();

    // Target is the budget minus the incoming two shards' worth, so exactly
    // one buffer must go, and the expert cache is asked first.
    let experts = manager.experts().unwrap().stats();
    assert_eq!(experts.entries, 1);
    assert_eq!(manager.shards().len(), 2);
}

#[tokio::test]
async fn test_kv_spill_under_pressure() {
    let mut config = Config::default();
    small_model(&mut config);
    config.kv_cache.max_seq_len = 64;
    config.kv_cache.page_size = 4;
    config.kv_cache.kv_dtype = KvDtype::F32;
    config.kv_cache.layout = LayoutPolicy::Paged;
    config.kv_cache.tiering.enabled = true;
    config.kv_cache.tiering.hot_window = 8;
    config.kv_cache.tiering.cold_page_size = 8;
    config.kv_cache.tiering.compression = ColdCompression::None;
    config.kv_cache.tiering.compression_block_tokens = 4;

    let manager = ResourceManager::new(
        config,
        Arc::new(HostDevice::new(1 << 20)),
        Arc::new(Filled),
        manifest(0),
        None,
    )
    .unwrap();

    let kv = manager.kv();
    for position in 0..32 {
        let row = vec![position as f32; 8];
        kv.append(1, 0, &row, &row, position).unwrap();
    }
    let before = kv.stats();
    assert!(before.cold_device_bytes > 0);

    // With the KV cache idle, a trim spills its cold device pages.
    manager.pool().trim(0);
    let after = kv.stats();
    assert_eq!(after.cold_device_bytes, 0);
    assert_eq!(after.compressed_pages, before.cold_pages);
    assert_eq!(after.hot_pages, before.hot_pages);

    let (k, v) = kv.read(1, 0, 3).unwrap();
    assert_eq!(k, vec![3.0; 8]);
    assert_eq!(v, vec![3.0; 8]);
}

#[tokio::test]
async fn test_kv_appends_spill_own_cold_pages_at_budget() {
    let mut config = Config::default();
    small_model(&mut config);
    config.pool.budget.max_total_bytes = Some(16 * 1024);
    config.kv_cache.max_seq_len = 1024;
    config.kv_cache.page_size = 4;
    config.kv_cache.kv_dtype = KvDtype::F32;
    config.kv_cache.layout = LayoutPolicy::Paged;
    config.kv_cache.tiering.enabled = true;
    config.kv_cache.tiering.hot_window = 8;
    config.kv_cache.tiering.cold_page_size = 8;
    config.kv_cache.tiering.compression = ColdCompression::None;
    config.kv_cache.tiering.compression_block_tokens = 4;

    let manager = ResourceManager::new(
        config,
        Arc::new(HostDevice::new(1 << 20)),
        Arc::new(Filled),
        manifest(0),
        None,
    )
    .unwrap();

    // 127 cold pages of 256 B each would need about twice the budget on
    // the device; the cache has to move older ones to the host as it goes.
    let kv = manager.kv();
    for position in 0..1024 {
        let row = vec![position as f32; 8];
        kv.append(1, 0, &row, &row, position).unwrap();
    }

    let stats = kv.stats();
    assert!(stats.spills > 0);
    assert!(stats.compressed_pages > 0);
    assert!(stats.cold_device_bytes <= 16 * 1024);

    let pool = manager.pool().stats();
    assert!(pool.emergency_trims > 0);
    assert!(pool.current_bytes <= pool.max_total_bytes);

    for position in [0, 100, 1015] {
        let (k, v) = kv.read(1, 0, position).unwrap();
        assert_eq!(k, vec![position as f32; 8]);
        assert_eq!(v, vec![position as f32; 8]);
    }
}
