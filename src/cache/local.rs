//! Local block cache: the shared zone every worker on the host consults first.
//!
//! A zone holds a [`NodeIndex`] (ordered by key, queued by recency), the
//! [`SlabPool`] that bounds its memory, and the hit/miss/discard counters.
//! Workers never touch the zone directly; they go through a cloneable
//! [`SharedCacheHandle`] whose every operation runs entirely under the zone
//! lock. No I/O happens while the lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::error::CacheError;
use crate::cache::index::{NodeId, NodeIndex};
use crate::cache::key::{BlockCacheKey, BlockCacheKv, BlockCacheValue};
use crate::cache::slab::{SizeClassStats, SlabChunk, SlabPool};
use crate::cache::CacheTier;
use crate::serialize::{Reader, Writer};

/// Nodes evicted per discard round.
pub const DEFAULT_DISCARD_ITEM_COUNT: usize = 10_000;

/// Lookups between two hit ratio log lines.
pub const DEFAULT_STAT_REPORT_INTERVAL: u64 = 3000 * 60 * 60;

/// Zones must be larger than this.
pub const MIN_ZONE_SIZE: usize = 8192;

/// Bytes a node spends on tree and queue linkage, the key, and the blob header.
pub const NODE_HEADER_SIZE: usize = 64;

/// The stored blob length is a single byte, which caps a node at 31 addresses.
pub const MAX_DS_COUNT: usize = u8::MAX as usize / 8;

/// Sizing and policy of one named zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    pub name: String,
    pub size: usize,
    pub discard_item_count: usize,
    pub stat_report_interval: u64,
}

impl ZoneConfig {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            discard_item_count: DEFAULT_DISCARD_ITEM_COUNT,
            stat_report_interval: DEFAULT_STAT_REPORT_INTERVAL,
        }
    }
}

/// Encoded value as it sits in the zone.
#[derive(Debug)]
struct StoredValue {
    len: u8,
    count: u16,
    data: Vec<u8>,
    chunk: SlabChunk,
}

/// Point-in-time view of a zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneStats {
    pub name: String,
    pub entries: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub discard_item_count: usize,
    pub discarded: u64,
    pub alloc_failures: u64,
    pub invalidations: u64,
    pub corrupt_entries: u64,
    pub accounting_errors: u64,
    pub slab_used: usize,
    pub slab_capacity: usize,
    pub slab_utilization: f64,
    pub size_classes: Vec<SizeClassStats>,
    pub hit_ratio: f64,
}

/// Contents of a zone. Only reachable through [`SharedCacheHandle`].
#[derive(Debug)]
pub struct LocalBlockCache {
    name: String,
    index: NodeIndex<StoredValue>,
    pool: SlabPool,
    discard_item_count: usize,
    stat_report_interval: u64,
    hit_count: u64,
    miss_count: u64,
    last_report_at: u64,
    discarded: u64,
    alloc_failures: u64,
    invalidations: u64,
    corrupt_entries: u64,
    accounting_errors: u64,
}

impl LocalBlockCache {
    fn new(config: &ZoneConfig) -> Self {
        Self {
            name: config.name.clone(),
            index: NodeIndex::new(),
            pool: SlabPool::new(config.size),
            discard_item_count: config.discard_item_count,
            stat_report_interval: config.stat_report_interval,
            hit_count: 0,
            miss_count: 0,
            last_report_at: 0,
            discarded: 0,
            alloc_failures: 0,
            invalidations: 0,
            corrupt_entries: 0,
            accounting_errors: 0,
        }
    }

    /// Slab bytes a node holding `ds_count` addresses occupies.
    pub fn node_footprint(ds_count: usize) -> usize {
        SlabPool::chunk_size(NODE_HEADER_SIZE + ds_count * 8).unwrap_or(usize::MAX)
    }

    fn encode_blob(value: &BlockCacheValue) -> Result<Vec<u8>, CacheError> {
        let mut data = vec![0u8; value.ds_addrs.len() * 8];
        let mut w = Writer::new(&mut data);
        for addr in &value.ds_addrs {
            w.write_u64(*addr)?;
        }
        Ok(data)
    }

    fn decode_blob(stored: &StoredValue) -> Result<BlockCacheValue, CacheError> {
        let expected = usize::from(stored.count) * 8;
        if usize::from(stored.len) != expected || stored.data.len() != expected {
            return Err(CacheError::CorruptEntry {
                expected,
                actual: stored.data.len(),
            });
        }
        let mut r = Reader::new(&stored.data);
        let ds_addrs = (0..stored.count)
            .map(|_| r.read_u64())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockCacheValue { ds_addrs })
    }

    fn maybe_report(&mut self) {
        let total = self.hit_count + self.miss_count;
        if self.stat_report_interval == 0 || total - self.last_report_at < self.stat_report_interval {
            return;
        }
        self.last_report_at = total;
        info!(
            zone = %self.name,
            hit_ratio = %format!("{:.2}%", self.hit_ratio() * 100.0),
            hits = self.hit_count,
            misses = self.miss_count,
            "Local block cache hit ratio"
        );
    }

    fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            return 0.0;
        }
        self.hit_count as f64 / total as f64
    }

    /// Return a chunk to the pool. A refused free means the pool and the index disagree.
    fn release(&mut self, chunk: SlabChunk) {
        if let Err(e) = self.pool.free(chunk) {
            self.accounting_errors += 1;
            warn!(
                zone = %self.name,
                error = %e,
                entries = self.index.len(),
                live_chunks = self.pool.live_chunks(),
                "Slab accounting out of step with node index"
            );
        }
    }

    fn unlink_node(&mut self, id: NodeId) {
        let (_, stored) = self.index.remove(id);
        self.release(stored.chunk);
    }

    /// Find `key`, touch it, and decode its value. Corrupt nodes are dropped and count as misses.
    fn lookup_locked(&mut self, key: &BlockCacheKey) -> Option<BlockCacheValue> {
        let Some(id) = self.index.get(key) else {
            self.miss_count += 1;
            return None;
        };

        match Self::decode_blob(self.index.value(id)) {
            Ok(value) => {
                self.index.touch(id);
                self.hit_count += 1;
                Some(value)
            }
            Err(e) => {
                warn!(zone = %self.name, %key, error = %e, "Dropping corrupt local block cache node");
                self.unlink_node(id);
                self.corrupt_entries += 1;
                self.miss_count += 1;
                None
            }
        }
    }

    fn lookup(&mut self, key: &BlockCacheKey) -> Option<BlockCacheValue> {
        let found = self.lookup_locked(key);
        self.maybe_report();
        found
    }

    fn batch_lookup(&mut self, keys: &[BlockCacheKey]) -> Vec<BlockCacheKv> {
        let kvs = keys
            .iter()
            .filter_map(|key| {
                self.lookup_locked(key).map(|value| BlockCacheKv { key: *key, value })
            })
            .collect();
        self.maybe_report();
        kvs
    }

    fn alloc_with_discard(&mut self, footprint: usize) -> Result<SlabChunk, CacheError> {
        match self.pool.alloc(footprint) {
            Ok(chunk) => Ok(chunk),
            Err(_) => {
                self.discard();
                self.pool.alloc(footprint).map_err(|e| {
                    self.alloc_failures += 1;
                    CacheError::AllocationFailure(e)
                })
            }
        }
    }

    fn insert(&mut self, key: BlockCacheKey, value: &BlockCacheValue) -> Result<(), CacheError> {
        let count = value.ds_addrs.len();
        if count == 0 {
            return Err(CacheError::InvalidArgument("value has no data servers"));
        }
        if count > MAX_DS_COUNT {
            warn!(zone = %self.name, %key, count, max = MAX_DS_COUNT, "Rejecting oversize block cache value");
            return Err(CacheError::ValueTooLarge {
                count,
                max: MAX_DS_COUNT,
            });
        }

        let data = Self::encode_blob(value)?;
        let footprint = NODE_HEADER_SIZE + data.len();

        if let Some(id) = self.index.get(&key) {
            let same_class = SlabPool::chunk_size(footprint) == Some(self.index.value(id).chunk.size());
            if same_class {
                let stored = self.index.value_mut(id);
                stored.len = data.len() as u8;
                stored.count = count as u16;
                stored.data = data;
                self.index.touch(id);
                return Ok(());
            }

            match self.pool.alloc(footprint) {
                Ok(chunk) => {
                    let old = std::mem::replace(&mut self.index.value_mut(id).chunk, chunk);
                    self.release(old);
                    let stored = self.index.value_mut(id);
                    stored.len = data.len() as u8;
                    stored.count = count as u16;
                    stored.data = data;
                    self.index.touch(id);
                    return Ok(());
                }
                // No room to resize: drop the old node and go through the fresh-insert path.
                Err(_) => self.unlink_node(id),
            }
        }

        let chunk = self.alloc_with_discard(footprint)?;
        let stored = StoredValue {
            len: data.len() as u8,
            count: count as u16,
            data,
            chunk,
        };
        if let Err(stored) = self.index.insert_tail(key, stored) {
            self.release(stored.chunk);
        }
        Ok(())
    }

    fn remove(&mut self, key: &BlockCacheKey, hit_status: CacheTier) -> bool {
        let Some(id) = self.index.get(key) else {
            return false;
        };
        self.unlink_node(id);
        if hit_status != CacheTier::None {
            self.invalidations += 1;
        }
        true
    }

    /// Evict up to `discard_item_count` nodes from the head of the recency queue.
    fn discard(&mut self) -> usize {
        let mut evicted = 0;
        while evicted < self.discard_item_count {
            let Some((_, stored)) = self.index.pop_head() else {
                break;
            };
            self.release(stored.chunk);
            evicted += 1;
        }
        self.discarded += evicted as u64;
        if evicted > 0 {
            info!(
                zone = %self.name,
                evicted,
                remaining = self.index.len(),
                "Discarded least recently used block cache nodes"
            );
        }
        evicted
    }

    fn stats(&self) -> ZoneStats {
        ZoneStats {
            name: self.name.clone(),
            entries: self.index.len(),
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            discard_item_count: self.discard_item_count,
            discarded: self.discarded,
            alloc_failures: self.alloc_failures,
            invalidations: self.invalidations,
            corrupt_entries: self.corrupt_entries,
            accounting_errors: self.accounting_errors,
            slab_used: self.pool.used(),
            slab_capacity: self.pool.capacity(),
            slab_utilization: self.pool.utilization(),
            size_classes: self.pool.class_stats(),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Explicit handle to a shared zone. Cheap to clone; every clone sees the same zone.
#[derive(Debug, Clone)]
pub struct SharedCacheHandle {
    name: Arc<str>,
    size: usize,
    zone: Arc<Mutex<LocalBlockCache>>,
}

impl SharedCacheHandle {
    /// Create a standalone zone that is not registered anywhere.
    pub fn new(config: &ZoneConfig) -> Result<Self, CacheError> {
        if config.size < MIN_ZONE_SIZE {
            return Err(CacheError::InvalidZoneSize(config.size));
        }
        Ok(Self {
            name: Arc::from(config.name.as_str()),
            size: config.size,
            zone: Arc::new(Mutex::new(LocalBlockCache::new(config))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether both handles point at the same zone.
    pub fn same_zone(&self, other: &SharedCacheHandle) -> bool {
        Arc::ptr_eq(&self.zone, &other.zone)
    }

    pub fn lookup(&self, key: &BlockCacheKey) -> Option<BlockCacheValue> {
        debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Lookup local block cache");
        let found = self.zone.lock().lookup(key);
        if found.is_none() {
            debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Local block cache miss");
        }
        found
    }

    /// Insert or replace `key`. Allocation pressure triggers one discard round and a retry.
    pub fn insert(&self, key: BlockCacheKey, value: &BlockCacheValue) -> Result<(), CacheError> {
        debug!(
            ns_addr = key.ns_addr,
            block_id = key.block_id,
            count = value.ds_addrs.len(),
            "Insert local block cache"
        );
        self.zone.lock().insert(key, value)
    }

    /// Remove `key`. `hit_status` records which tier served the stale entry, for statistics only.
    pub fn remove(&self, key: &BlockCacheKey, hit_status: CacheTier) -> bool {
        debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Remove local block cache");
        let removed = self.zone.lock().remove(key, hit_status);
        if !removed {
            debug!(
                ns_addr = key.ns_addr,
                block_id = key.block_id,
                "Remove local block cache: not found"
            );
        }
        removed
    }

    /// Run one discard round. Exposed for schedulers outside the cache.
    pub fn discard(&self) -> usize {
        self.zone.lock().discard()
    }

    /// Look up each key in order; absent keys produce no entry.
    pub fn batch_lookup(&self, keys: &[BlockCacheKey]) -> Vec<BlockCacheKv> {
        debug!(count = keys.len(), "Batch lookup local block cache");
        let kvs = self.zone.lock().batch_lookup(keys);
        debug!(hits = kvs.len(), "Batch lookup local block cache done");
        kvs
    }

    pub fn len(&self) -> usize {
        self.zone.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &BlockCacheKey) -> bool {
        self.zone.lock().index.get(key).is_some()
    }

    pub fn stats(&self) -> ZoneStats {
        self.zone.lock().stats()
    }

    /// Keys from least to most recently used.
    pub fn lru_keys(&self) -> Vec<BlockCacheKey> {
        self.zone.lock().index.lru_keys()
    }

    /// Check that the key index and the recency queue agree.
    pub fn is_consistent(&self) -> bool {
        let zone = self.zone.lock();
        zone.index.is_consistent() && zone.pool.live_chunks() == zone.index.len()
    }

    #[cfg(test)]
    fn corrupt(&self, key: &BlockCacheKey) {
        let mut zone = self.zone.lock();
        if let Some(id) = zone.index.get(key) {
            zone.index.value_mut(id).count += 1;
        }
    }

    #[cfg(test)]
    fn release_foreign_chunk(&self, chunk: SlabChunk) {
        self.zone.lock().release(chunk);
    }
}

/// Named zones shared by every worker started from the same configuration.
///
/// Re-initialising a name returns the existing zone with its contents; a
/// different size for the same name is rejected, since a zone cannot be
/// resized in place.
#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: Mutex<HashMap<String, SharedCacheHandle>>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_zone(&self, config: &ZoneConfig) -> Result<SharedCacheHandle, CacheError> {
        let mut zones = self.zones.lock();

        if let Some(existing) = zones.get(&config.name) {
            if existing.size() != config.size {
                return Err(CacheError::ZoneSizeMismatch {
                    name: config.name.clone(),
                    existing: existing.size(),
                    requested: config.size,
                });
            }
            info!(zone = %config.name, size = config.size, "Reusing block cache zone");
            return Ok(existing.clone());
        }

        let handle = SharedCacheHandle::new(config)?;
        info!(
            zone = %config.name,
            size = config.size,
            discard_item_count = config.discard_item_count,
            "Created block cache zone"
        );
        zones.insert(config.name.clone(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<SharedCacheHandle> {
        self.zones.lock().get(name).cloned()
    }

    /// Forget a zone so the next init recreates it.
    pub fn remove(&self, name: &str) -> Option<SharedCacheHandle> {
        self.zones.lock().remove(name)
    }
}
