//! Shard cache behaviour over an on-disk shard store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use gpu_residency::cache::{CorruptReason, ShardCache, ShardError};
use gpu_residency::config::{DistributionConfig, ModelConfig, PoolConfig, ShardCacheConfig};
use gpu_residency::fetch::{
    FetchError, LocalShardStore, RetryingFetcher, ShardFetcher, ShardMeta, ShardSource,
};
use gpu_residency::gpu::{BufferPool, HostDevice, SharedPool};
use gpu_residency::quant::{quantize, QuantKind};

/// Counts fetches and slows them down so concurrent requests overlap.
struct SlowCounting<F> {
    inner: F,
    delay: Duration,
    fetches: AtomicUsize,
}

#[async_trait]
impl<F: ShardFetcher> ShardFetcher for SlowCounting<F> {
    fn source(&self) -> ShardSource {
        self.inner.source()
    }

    async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(meta).await
    }
}

fn pool() -> SharedPool {
    BufferPool::new(Arc::new(HostDevice::new(64 << 20)), PoolConfig::default())
}

fn q8_values(index: u32) -> Vec<f32> {
    (0..1024).map(|i| ((i + index) % 64) as f32 / 32.0 - 1.0).collect()
}

async fn store_with_shards(dir: &std::path::Path, count: u32) -> (LocalShardStore, Vec<ShardMeta>) {
    let store = LocalShardStore::open(dir).await.unwrap();
    let mut manifest = Vec::new();
    for index in 0..count {
        let bytes = quantize(QuantKind::Q8_0, &q8_values(index)).unwrap();
        store.write_shard(index, &bytes).await.unwrap();
        let mut meta = ShardMeta::single(index, format!("blk.{index}.ffn"), 1024, QuantKind::Q8_0);
        meta.hash = Some(format!("{:x}", Sha256::digest(&bytes)));
        meta.size_bytes = Some(bytes.len() as u64);
        manifest.push(meta);
    }
    (store, manifest)
}

#[tokio::test]
async fn test_concurrent_requests_share_one_load() {
    let dir = tempfile::tempdir().unwrap();
    let (store, manifest) = store_with_shards(dir.path(), 4).await;
    let fetcher = Arc::new(SlowCounting {
        inner: store,
        delay: Duration::from_millis(30),
        fetches: AtomicUsize::new(0),
    });
    let cache = ShardCache::new(
        pool(),
        fetcher.clone(),
        manifest,
        ShardCacheConfig::default(),
        &ModelConfig::default(),
    );

    let (a, b) = tokio::join!(cache.get(3), cache.get(3));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(a.len(), 34 * 32);
    assert_eq!(a.source(), ShardSource::Local);

    let stored = quantize(QuantKind::Q8_0, &q8_values(3)).unwrap();
    assert_eq!(a.tensor_bytes("blk.3.ffn").unwrap().unwrap(), stored);
}

#[tokio::test]
async fn test_truncated_q4k_shard_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalShardStore::open(dir.path()).await.unwrap();
    store.write_shard(0, &vec![0u8; 143_999]).await.unwrap();

    let pool = pool();
    let cache = ShardCache::new(
        pool.clone(),
        Arc::new(store),
        [ShardMeta::single(0, "w", 1000 * 256, QuantKind::Q4K)],
        ShardCacheConfig::default(),
        &ModelConfig::default(),
    );

    match cache.get(0).await {
        Err(ShardError::Corrupt {
            shard_index: 0,
            reason: CorruptReason::Tensor { .. },
        }) => {}
        other => panic!("expected corrupt shard, got {other:?}"),
    }
    assert!(!cache.contains(0));
    assert!(!cache.is_loading(0));
    assert_eq!(cache.stats().corrupt, 1);
    assert_eq!(pool.stats().active_count, 0);
}

#[tokio::test]
async fn test_hash_mismatch_rejected_only_when_verifying() {
    let dir = tempfile::tempdir().unwrap();
    let (store, mut manifest) = store_with_shards(dir.path(), 1).await;
    let store = Arc::new(store);
    manifest[0].hash = Some("ab".repeat(32));

    let verifying = ShardCache::new(
        pool(),
        store.clone(),
        manifest.clone(),
        ShardCacheConfig::default(),
        &ModelConfig::default(),
    );
    assert!(matches!(
        verifying.get(0).await,
        Err(ShardError::Corrupt {
            reason: CorruptReason::Hash { .. },
            ..
        })
    ));

    let trusting = ShardCache::new(
        pool(),
        store,
        manifest,
        ShardCacheConfig {
            verify_hashes: false,
            ..ShardCacheConfig::default()
        },
        &ModelConfig::default(),
    );
    assert!(trusting.get(0).await.is_ok());
}

#[tokio::test]
async fn test_missing_shard_fails_without_retries() {
    let dir = tempfile::tempdir().unwrap();
    let (store, manifest) = store_with_shards(dir.path(), 2).await;
    store.remove_shard(1).await.unwrap();

    let fetcher = Arc::new(RetryingFetcher::from_config(
        store,
        &DistributionConfig {
            initial_retry_delay_ms: 1,
            max_retry_delay_ms: 2,
            ..DistributionConfig::default()
        },
    ));
    let cache = ShardCache::new(
        pool(),
        fetcher.clone(),
        manifest,
        ShardCacheConfig::default(),
        &ModelConfig::default(),
    );

    match cache.get(1).await {
        Err(ShardError::Load { shard_index: 1, cause }) => {
            assert!(matches!(*cause, FetchError::NotFound(1)));
        }
        other => panic!("expected load failure, got {other:?}"),
    }
    assert_eq!(fetcher.stats().retries, 0);
    assert_eq!(cache.stats().load_failures, 1);

    // The failed entry went back to absent; other shards still load.
    assert!(cache.get(0).await.is_ok());
}

#[tokio::test]
async fn test_moe_capacity_from_model() {
    let dir = tempfile::tempdir().unwrap();
    let (store, manifest) = store_with_shards(dir.path(), 8).await;
    let model = ModelConfig {
        num_layers: 2,
        experts_per_token: Some(2),
        num_experts: Some(8),
        ..ModelConfig::default()
    };
    let cache = ShardCache::new(
        pool(),
        Arc::new(store),
        manifest,
        ShardCacheConfig::default(),
        &model,
    );
    assert_eq!(cache.capacity(), 4);

    for index in 0..8 {
        drop(cache.get(index).await.unwrap());
    }
    assert_eq!(cache.len(), 4);
    assert_eq!(cache.stats().evictions, 4);
    assert!((4..8).all(|i| cache.contains(i)));
}
