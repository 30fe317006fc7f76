//! Resource manager: owns the pool and the caches for one device.
//!
//! Construction wires the caches into the pool as reclaimers (experts first,
//! then shards, then KV pages) so emergency trims release the cheapest-to-
//! rebuild data first.

use std::sync::{Arc, Weak};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::cache::{
    ExpertCache, ExpertCacheStats, ExpertError, ExpertLocator, ExpertWeights, KvCache, KvStats,
    ShardCache, ShardCacheStats, ShardError,
};
use crate::config::{Config, ConfigError};
use crate::dispatch::{DispatchError, KernelDispatcher};
use crate::fetch::{ShardFetcher, ShardMeta};
use crate::gpu::{BufferPool, BufferView, GpuDevice, PoolStats, SharedPool};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Expert(#[from] ExpertError),

    #[error("Model has no expert cache")]
    NoExpertCache,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub pool: PoolStats,
    pub shards: ShardCacheStats,
    pub experts: Option<ExpertCacheStats>,
    pub kv: KvStats,
}

pub struct ResourceManager {
    config: Config,
    pool: SharedPool,
    shards: Arc<ShardCache>,
    experts: Option<Arc<ExpertCache>>,
    kv: Arc<KvCache>,
}

impl ResourceManager {
    /// Build the pool and caches. The expert cache exists only when a locator
    /// is supplied.
    pub fn new(
        config: Config,
        device: Arc<dyn GpuDevice>,
        fetcher: Arc<dyn ShardFetcher>,
        manifest: impl IntoIterator<Item = ShardMeta>,
        locator: Option<Arc<dyn ExpertLocator>>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let pool = BufferPool::new(device, config.pool.clone());
        let shards = ShardCache::new(
            pool.clone(),
            fetcher,
            manifest,
            config.shard_cache.clone(),
            &config.model,
        );
        let experts = locator.map(|locator| {
            ExpertCache::new(pool.clone(), shards.clone(), locator, &config.expert_cache)
        });
        let kv = Arc::new(KvCache::new(pool.clone(), config.kv_cache.clone(), &config.model));

        if let Some(experts) = &experts {
            let weak: Weak<ExpertCache> = Arc::downgrade(experts);
            pool.register_reclaimer(weak);
        }
        let weak: Weak<ShardCache> = Arc::downgrade(&shards);
        pool.register_reclaimer(weak);
        let weak: Weak<KvCache> = Arc::downgrade(&kv);
        pool.register_reclaimer(weak);

        info!(
            budget = pool.max_total_bytes(),
            shard_capacity = shards.capacity(),
            experts = experts.is_some(),
            "Resource manager ready"
        );

        Ok(Self {
            config,
            pool,
            shards,
            experts,
            kv,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub fn shards(&self) -> &Arc<ShardCache> {
        &self.shards
    }

    pub fn experts(&self) -> Option<&Arc<ExpertCache>> {
        self.experts.as_ref()
    }

    pub fn kv(&self) -> &Arc<KvCache> {
        &self.kv
    }

    pub async fn get_expert(&self, expert_id: u32, layer: usize) -> Result<Arc<ExpertWeights>, RuntimeError> {
        let experts = self.experts.as_ref().ok_or(RuntimeError::NoExpertCache)?;
        Ok(experts.get_expert(expert_id, layer).await?)
    }

    /// Run a kernel over a shard's buffer followed by `extra`. The shard is
    /// pinned until the dispatch resolves.
    pub async fn dispatch_with_shard(
        &self,
        dispatcher: &dyn KernelDispatcher,
        op: &str,
        shard_index: u32,
        extra: &[BufferView<'_>],
    ) -> Result<(), RuntimeError> {
        let shard = self.shards.get(shard_index).await?;
        let mut views = Vec::with_capacity(extra.len() + 1);
        views.push(shard.buffer().view());
        views.extend_from_slice(extra);
        dispatcher.dispatch(op, &views).await?;
        Ok(())
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            pool: self.pool.stats(),
            shards: self.shards.stats(),
            experts: self.experts.as_ref().map(|e| e.stats()),
            kv: self.kv.stats(),
        }
    }

    /// Drop every shard and expert. KV sequences are left alone.
    pub fn unload_model(&self) {
        let shards = self.shards.unload();
        let experts = self.experts.as_ref().map_or(0, |e| e.clear());
        info!(shards, experts, "Model unloaded");
    }

    /// Release everything the manager holds and free pooled device memory.
    pub fn shutdown(&self) {
        self.unload_model();
        let sequences = self.kv.release_all();
        let freed = self.pool.clear_pooled();
        info!(sequences, freed, "Resource manager shut down");
    }
}
