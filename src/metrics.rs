//! Prometheus metrics for the block cache.
//!
//! Each [`CacheMetrics`] owns its registry, so several caches (or tests) can
//! live in one process without colliding on metric names.

use std::fmt;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::{CacheTier, ZoneStats};

#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    lookups: IntCounterVec,
    inserts: IntCounterVec,
    evictions: IntCounter,
    remote_errors: IntCounter,
    entries: IntGauge,
}

impl fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("evictions", &self.evictions.get())
            .field("remote_errors", &self.remote_errors.get())
            .field("entries", &self.entries.get())
            .finish_non_exhaustive()
    }
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let lookups = IntCounterVec::new(
            Opts::new("tfs_block_cache_lookups_total", "Block cache lookups by tier and result"),
            &["tier", "result"],
        )?;
        let inserts = IntCounterVec::new(
            Opts::new("tfs_block_cache_inserts_total", "Block cache inserts by tier"),
            &["tier"],
        )?;
        let evictions = IntCounter::new(
            "tfs_block_cache_evictions_total",
            "Local block cache nodes evicted by discard",
        )?;
        let remote_errors = IntCounter::new(
            "tfs_block_cache_remote_errors_total",
            "Failed remote block cache operations",
        )?;
        let entries = IntGauge::new("tfs_block_cache_entries", "Nodes in the local block cache zone")?;

        registry.register(Box::new(lookups.clone()))?;
        registry.register(Box::new(inserts.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(remote_errors.clone()))?;
        registry.register(Box::new(entries.clone()))?;

        Ok(Self {
            registry,
            lookups,
            inserts,
            evictions,
            remote_errors,
            entries,
        })
    }

    pub fn record_lookup(&self, tier: CacheTier, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.lookups
            .with_label_values(&[tier.as_str(), result])
            .inc();
    }

    pub fn lookup_count(&self, tier: CacheTier, hit: bool) -> u64 {
        let result = if hit { "hit" } else { "miss" };
        self.lookups
            .with_label_values(&[tier.as_str(), result])
            .get()
    }

    pub fn record_insert(&self, tier: CacheTier) {
        self.inserts.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn insert_count(&self, tier: CacheTier) -> u64 {
        self.inserts.with_label_values(&[tier.as_str()]).get()
    }

    pub fn record_remote_error(&self) {
        self.remote_errors.inc();
    }

    pub fn remote_errors(&self) -> u64 {
        self.remote_errors.get()
    }

    /// Bring the zone-derived metrics up to date with `stats`.
    pub fn observe_zone(&self, stats: &ZoneStats) {
        self.entries.set(stats.entries as i64);
        let seen = self.evictions.get();
        if stats.discarded > seen {
            self.evictions.inc_by(stats.discarded - seen);
        }
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
