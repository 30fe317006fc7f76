//! Prometheus metrics refreshed from [`ResourceStats`] snapshots.
//!
//! Each `RuntimeMetrics` owns its registry, so several managers (or tests) can
//! coexist in one process.

use std::collections::BTreeMap;

use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::runtime::ResourceStats;

const NAMESPACE: &str = "gpu_residency";

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Advance a counter to a cumulative total taken from a snapshot.
fn sync_counter(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

pub struct RuntimeMetrics {
    registry: Registry,

    pool_current_bytes: IntGauge,
    pool_peak_bytes: IntGauge,
    pool_budget_bytes: IntGauge,
    pool_active_buffers: IntGauge,
    pool_pooled_buffers: IntGauge,
    pool_pooled_bytes: IntGauge,
    pool_label_bytes: IntGaugeVec,
    pool_allocations: IntCounter,
    pool_reuses: IntCounter,
    pool_reclaimed_bytes: IntCounter,
    pool_emergency_trims: IntCounter,
    pool_budget_failures: IntCounter,

    shard_resident: IntGauge,
    shard_resident_bytes: IntGauge,
    shard_pinned: IntGauge,
    shard_hits: IntCounter,
    shard_misses: IntCounter,
    shard_coalesced: IntCounter,
    shard_load_failures: IntCounter,
    shard_evictions: IntCounter,

    expert_entries: IntGauge,
    expert_used_bytes: IntGauge,
    expert_budget_bytes: IntGauge,
    expert_hits: IntCounter,
    expert_misses: IntCounter,
    expert_coalesced: IntCounter,
    expert_evictions: IntCounter,
    expert_over_budget: IntCounter,

    kv_sequences: IntGauge,
    kv_hot_pages: IntGauge,
    kv_cold_pages: IntGauge,
    kv_hot_bytes: IntGauge,
    kv_cold_device_bytes: IntGauge,
    kv_cold_host_bytes: IntGauge,
    kv_appends: IntCounter,
    kv_demotions: IntCounter,
    kv_spills: IntCounter,
}

impl RuntimeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let r = Registry::new();

        let pool_label_bytes = IntGaugeVec::new(
            Opts::new("pool_active_bytes_by_owner", "Active pool bytes by owner")
                .namespace(NAMESPACE),
            &["owner"],
        )?;
        r.register(Box::new(pool_label_bytes.clone()))?;

        Ok(Self {
            pool_current_bytes: gauge(&r, "pool_current_bytes", "Active plus pooled device bytes")?,
            pool_peak_bytes: gauge(&r, "pool_peak_bytes", "Peak device bytes")?,
            pool_budget_bytes: gauge(&r, "pool_budget_bytes", "Pool byte budget")?,
            pool_active_buffers: gauge(&r, "pool_active_buffers", "Buffers handed out")?,
            pool_pooled_buffers: gauge(&r, "pool_pooled_buffers", "Idle buffers kept for reuse")?,
            pool_pooled_bytes: gauge(&r, "pool_pooled_bytes", "Bytes in idle buffers")?,
            pool_label_bytes,
            pool_allocations: counter(&r, "pool_allocations_total", "Device allocations")?,
            pool_reuses: counter(&r, "pool_reuses_total", "Pooled buffer reuses")?,
            pool_reclaimed_bytes: counter(&r, "pool_reclaimed_bytes_total", "Bytes reclaimed under pressure")?,
            pool_emergency_trims: counter(&r, "pool_emergency_trims_total", "Emergency trims")?,
            pool_budget_failures: counter(&r, "pool_budget_failures_total", "Allocations refused by the budget")?,

            shard_resident: gauge(&r, "shard_resident", "Resident shards")?,
            shard_resident_bytes: gauge(&r, "shard_resident_bytes", "Device bytes held by shards")?,
            shard_pinned: gauge(&r, "shard_pinned", "Shards pinned by in-flight work")?,
            shard_hits: counter(&r, "shard_hits_total", "Shard cache hits")?,
            shard_misses: counter(&r, "shard_misses_total", "Shard cache misses")?,
            shard_coalesced: counter(&r, "shard_coalesced_total", "Requests joined to an in-flight load")?,
            shard_load_failures: counter(&r, "shard_load_failures_total", "Failed shard loads")?,
            shard_evictions: counter(&r, "shard_evictions_total", "Evicted shards")?,

            expert_entries: gauge(&r, "expert_entries", "Resident experts")?,
            expert_used_bytes: gauge(&r, "expert_used_bytes", "Bytes charged to the expert budget")?,
            expert_budget_bytes: gauge(&r, "expert_budget_bytes", "Expert cache byte budget")?,
            expert_hits: counter(&r, "expert_hits_total", "Expert cache hits")?,
            expert_misses: counter(&r, "expert_misses_total", "Expert cache misses")?,
            expert_coalesced: counter(&r, "expert_coalesced_total", "Misses joined to an in-flight staging")?,
            expert_evictions: counter(&r, "expert_evictions_total", "Evicted experts")?,
            expert_over_budget: counter(&r, "expert_over_budget_inserts_total", "Inserts past the budget")?,

            kv_sequences: gauge(&r, "kv_sequences", "Live KV sequences")?,
            kv_hot_pages: gauge(&r, "kv_hot_pages", "Hot KV pages")?,
            kv_cold_pages: gauge(&r, "kv_cold_pages", "Cold KV pages")?,
            kv_hot_bytes: gauge(&r, "kv_hot_bytes", "Device bytes in hot KV storage")?,
            kv_cold_device_bytes: gauge(&r, "kv_cold_device_bytes", "Device bytes in cold KV pages")?,
            kv_cold_host_bytes: gauge(&r, "kv_cold_host_bytes", "Host bytes in compressed KV pages")?,
            kv_appends: counter(&r, "kv_appends_total", "K/V rows written")?,
            kv_demotions: counter(&r, "kv_demotions_total", "Cold page spans demoted")?,
            kv_spills: counter(&r, "kv_spills_total", "Cold pages spilled to host")?,

            registry: r,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn update(&self, stats: &ResourceStats) {
        let pool = &stats.pool;
        self.pool_current_bytes.set(pool.current_bytes as i64);
        self.pool_peak_bytes.set(pool.peak_bytes as i64);
        self.pool_budget_bytes.set(pool.max_total_bytes as i64);
        self.pool_active_buffers.set(pool.active_count as i64);
        self.pool_pooled_buffers.set(pool.pooled_count as i64);
        self.pool_pooled_bytes.set(pool.pooled_bytes as i64);
        sync_counter(&self.pool_allocations, pool.allocations);
        sync_counter(&self.pool_reuses, pool.reuses);
        sync_counter(&self.pool_reclaimed_bytes, pool.reclaimed_bytes);
        sync_counter(&self.pool_emergency_trims, pool.emergency_trims);
        sync_counter(&self.pool_budget_failures, pool.budget_failures);

        // Labels carry ids ("shard.12"); group by the owner prefix.
        let mut by_owner: BTreeMap<&str, u64> = BTreeMap::new();
        for (label, label_stats) in &pool.labels {
            let owner = label.split('.').next().unwrap_or(label);
            *by_owner.entry(owner).or_default() += label_stats.active_bytes;
        }
        self.pool_label_bytes.reset();
        for (owner, bytes) in by_owner {
            self.pool_label_bytes.with_label_values(&[owner]).set(bytes as i64);
        }

        let shards = &stats.shards;
        self.shard_resident.set(shards.resident as i64);
        self.shard_resident_bytes.set(shards.resident_bytes as i64);
        self.shard_pinned.set(shards.pinned as i64);
        sync_counter(&self.shard_hits, shards.hits);
        sync_counter(&self.shard_misses, shards.misses);
        sync_counter(&self.shard_coalesced, shards.coalesced);
        sync_counter(&self.shard_load_failures, shards.load_failures);
        sync_counter(&self.shard_evictions, shards.evictions);

        if let Some(experts) = &stats.experts {
            self.expert_entries.set(experts.entries as i64);
            self.expert_used_bytes.set(experts.used_bytes as i64);
            self.expert_budget_bytes.set(experts.budget_bytes as i64);
            sync_counter(&self.expert_hits, experts.hits);
            sync_counter(&self.expert_misses, experts.misses);
            sync_counter(&self.expert_coalesced, experts.coalesced);
            sync_counter(&self.expert_evictions, experts.evictions);
            sync_counter(&self.expert_over_budget, experts.over_budget_inserts);
        }

        let kv = &stats.kv;
        self.kv_sequences.set(kv.sequences as i64);
        self.kv_hot_pages.set((kv.hot_pages + kv.contiguous_buffers) as i64);
        self.kv_cold_pages.set(kv.cold_pages as i64);
        self.kv_hot_bytes.set(kv.hot_bytes as i64);
        self.kv_cold_device_bytes.set(kv.cold_device_bytes as i64);
        self.kv_cold_host_bytes.set(kv.cold_host_bytes as i64);
        sync_counter(&self.kv_appends, kv.appends);
        sync_counter(&self.kv_demotions, kv.demotions);
        sync_counter(&self.kv_spills, kv.spills);
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
