//! gpu-residency: inspect codec layouts and exercise the residency stack on a
//! host-backed device.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn};

use gpu_residency::config::{Cli, Command, Config};
use gpu_residency::dispatch::HostDispatcher;
use gpu_residency::fetch::{FetchError, RetryingFetcher, ShardFetcher, ShardMeta, ShardSource};
use gpu_residency::gpu::HostDevice;
use gpu_residency::metrics::RuntimeMetrics;
use gpu_residency::quant::{self, QuantKind};
use gpu_residency::ResourceManager;

const MIB: u64 = 1024 * 1024;

/// Elements per synthetic shard tensor.
const SHARD_ELEMENTS: u64 = 256 * 1024;

/// Serves deterministic Q8_0 shards.
struct SyntheticShards;

#[async_trait]
impl ShardFetcher for SyntheticShards {
    fn source(&self) -> ShardSource {
        ShardSource::Network
    }

    async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError> {
        let values: Vec<f32> = (0..SHARD_ELEMENTS)
            .map(|i| ((i + meta.index as u64) % 255) as f32 / 127.0 - 1.0)
            .collect();
        let bytes = quant::quantize(QuantKind::Q8_0, &values)
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gpu_residency=debug"
    } else {
        "gpu_residency=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    match cli.command {
        Command::Sizes { elements, kind } => sizes(elements, kind.as_deref()),
        Command::Simulate {
            shards,
            sequences,
            tokens,
            device_mib,
        } => {
            let config = Config::load(&cli.config)?;
            simulate(config, shards, sequences, tokens, device_mib).await
        }
    }
}

fn sizes(elements: u64, kind: Option<&str>) -> anyhow::Result<()> {
    let kinds = match kind {
        Some(tag) => vec![tag.parse::<QuantKind>()?],
        None => QuantKind::ALL.to_vec(),
    };

    println!(
        "{:<6} {:>8} {:>8} {:>14} {:>14}",
        "kind", "blk_elem", "blk_B", "tensor_B", "padded_B"
    );
    for kind in kinds {
        let bytes = quant::tensor_byte_size(elements, kind);
        println!(
            "{:<6} {:>8} {:>8} {:>14} {:>14}",
            kind,
            kind.block_elements(),
            kind.block_bytes(),
            bytes,
            quant::pad_to_block_boundary(bytes, kind),
        );
    }
    Ok(())
}

async fn simulate(
    mut config: Config,
    shards: u32,
    sequences: u64,
    tokens: usize,
    device_mib: u64,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let kv_dim = config.model.kv_dim();
    let num_layers = config.model.num_layers;
    // Size KV buffers to the run instead of the configured context.
    let tokens = tokens.clamp(1, config.kv_cache.max_seq_len);
    config.kv_cache.max_seq_len = tokens;

    let fetcher = Arc::new(RetryingFetcher::from_config(
        SyntheticShards,
        &config.distribution,
    ));
    let manifest = (0..shards)
        .map(|i| ShardMeta::single(i, format!("blk.{i}.weight"), SHARD_ELEMENTS, QuantKind::Q8_0));
    let manager = ResourceManager::new(
        config,
        Arc::new(HostDevice::new(device_mib * MIB)),
        fetcher.clone(),
        manifest,
        None,
    )
    .context("failed to build resource manager")?;

    let mut pressure = manager.pool().subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = pressure.recv().await {
            warn!(?event, "Memory pressure");
        }
    });

    let dispatcher = HostDispatcher::new();
    let key = vec![0.5f32; kv_dim];
    let value = vec![-0.5f32; kv_dim];

    for position in 0..tokens {
        let shard = (position / 16) as u32 % shards.max(1);
        if shards > 0 && position % 16 == 0 {
            manager.shards().prefetch([(shard + 1) % shards]);
            manager
                .dispatch_with_shard(&dispatcher, "matvec", shard, &[])
                .await
                .with_context(|| format!("dispatch over shard {shard}"))?;
        }
        for sequence in 0..sequences {
            for layer in 0..num_layers {
                manager
                    .kv()
                    .append(sequence, layer, &key, &value, position)
                    .with_context(|| format!("append seq {sequence} layer {layer} pos {position}"))?;
            }
        }
    }

    let stats = manager.stats();
    let metrics = RuntimeMetrics::new()?;
    metrics.update(&stats);

    info!(
        tokens,
        sequences,
        dispatches = dispatcher.records().len(),
        fetch_retries = fetcher.stats().retries,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Simulation complete"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{}", metrics.render()?);

    manager.shutdown();
    watcher.abort();
    Ok(())
}
