//! Per-request block cache facade.
//!
//! A [`BlockCacheCtx`] is what a request handler talks to. It hides which
//! tiers are enabled and walks them in order (local, then remote) with a
//! cursor that only moves forward, so a handler that retries after a stale
//! hit resumes at the next tier instead of asking the same tier twice.
//!
//! Local operations are synchronous. Remote writes are fire-and-forget: they
//! are spawned onto the runtime and their failures only logged. Remote hits
//! are written through to the local tier when it is enabled.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::error::CacheError;
use crate::cache::guard::GuardToken;
use crate::cache::key::{BlockCacheKey, BlockCacheKv, BlockCacheValue};
use crate::cache::local::SharedCacheHandle;
use crate::cache::remote::RemoteBlockCache;
use crate::cache::{CacheMode, CacheTier};
use crate::metrics::CacheMetrics;

/// Most keys a batch operation considers; extra keys are ignored.
pub const MAX_BATCH_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit {
        value: BlockCacheValue,
        tier: CacheTier,
    },
    Miss,
}

impl LookupOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, LookupOutcome::Hit { .. })
    }

    /// Tier that served the value, [`CacheTier::None`] on a miss.
    pub fn tier(&self) -> CacheTier {
        match self {
            LookupOutcome::Hit { tier, .. } => *tier,
            LookupOutcome::Miss => CacheTier::None,
        }
    }

    pub fn value(&self) -> Option<&BlockCacheValue> {
        match self {
            LookupOutcome::Hit { value, .. } => Some(value),
            LookupOutcome::Miss => None,
        }
    }
}

/// One key found by a batch lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub key: BlockCacheKey,
    pub value: BlockCacheValue,
    pub tier: CacheTier,
}

/// Handle on a detached remote write. Dropping it does not cancel the write.
#[derive(Debug, Default)]
pub struct PendingWrite(Option<JoinHandle<()>>);

impl PendingWrite {
    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }

    /// Wait for the remote write, if any, to finish.
    pub async fn settled(self) {
        if let Some(handle) = self.0 {
            if let Err(e) = handle.await {
                warn!(error = %e, "Remote block cache write task failed");
            }
        }
    }
}

/// Result of [`BlockCacheCtx::lookup_deferred`].
#[derive(Debug)]
pub enum Deferred {
    /// Answered without leaving the local tier.
    Ready(LookupOutcome),
    /// A remote lookup is running; the callback fires when it completes and the token is still live.
    Pending(JoinHandle<()>),
}

/// Tier handles shared by a ctx and the tasks it spawns.
#[derive(Debug, Clone)]
struct Tiers {
    local: Option<SharedCacheHandle>,
    remote: RemoteBlockCache,
    metrics: Option<CacheMetrics>,
}

impl Tiers {
    fn remote_enabled(&self) -> bool {
        self.remote.instance().is_some()
    }

    fn record_lookup(&self, tier: CacheTier, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_lookup(tier, hit);
        }
    }

    fn record_insert(&self, tier: CacheTier) {
        if let Some(metrics) = &self.metrics {
            metrics.record_insert(tier);
        }
    }

    fn record_remote_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_remote_error();
        }
    }

    fn insert_local(&self, key: BlockCacheKey, value: &BlockCacheValue) {
        let Some(local) = &self.local else {
            return;
        };
        match local.insert(key, value) {
            Ok(()) => self.record_insert(CacheTier::Local),
            Err(e) if e.is_operational() => {
                warn!(%key, error = %e, "Local block cache insert failed")
            }
            Err(e) => debug!(%key, error = %e, "Local block cache insert rejected"),
        }
    }

    /// Remote get. Transport failures are logged and reported as a miss.
    async fn fetch_remote(&self, key: &BlockCacheKey) -> LookupOutcome {
        match self.remote.lookup(key).await {
            Ok(Some(value)) => {
                self.record_lookup(CacheTier::Remote, true);
                LookupOutcome::Hit {
                    value,
                    tier: CacheTier::Remote,
                }
            }
            Ok(None) => {
                self.record_lookup(CacheTier::Remote, false);
                LookupOutcome::Miss
            }
            Err(e) => {
                self.record_lookup(CacheTier::Remote, false);
                self.record_remote_error();
                warn!(%key, error = %e, "Remote block cache lookup failed");
                LookupOutcome::Miss
            }
        }
    }

    /// Run a remote write detached. The future yields how many entries it stored,
    /// which are counted as remote inserts once it settles.
    fn spawn_remote<F, Fut>(&self, op: &'static str, f: F) -> PendingWrite
    where
        F: FnOnce(RemoteBlockCache) -> Fut,
        Fut: Future<Output = Result<usize, CacheError>> + Send + 'static,
    {
        if !self.remote_enabled() {
            return PendingWrite::default();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(op, "No runtime available for remote block cache write");
            return PendingWrite::default();
        };

        let metrics = self.metrics.clone();
        let fut = f(self.remote.clone());
        PendingWrite(Some(runtime.spawn(async move {
            match fut.await {
                Ok(stored) => {
                    if let Some(metrics) = &metrics {
                        for _ in 0..stored {
                            metrics.record_insert(CacheTier::Remote);
                        }
                    }
                }
                Err(e @ CacheError::RemoteTransport(_)) => {
                    if let Some(metrics) = &metrics {
                        metrics.record_remote_error();
                    }
                    warn!(op, error = %e, "Remote block cache write failed");
                }
                Err(e) => debug!(op, error = %e, "Remote block cache write rejected"),
            }
        })))
    }
}

/// Per-request view over the enabled tiers.
#[derive(Debug, Clone)]
pub struct BlockCacheCtx {
    mode: CacheMode,
    tiers: Tiers,
    curr_lookup_cache: CacheTier,
    served_by: CacheTier,
}

impl BlockCacheCtx {
    /// Build a ctx for `mode`. Tiers the mode does not enable are dropped.
    pub fn new(mode: CacheMode, local: Option<SharedCacheHandle>, remote: RemoteBlockCache) -> Self {
        let local = if mode.uses_local() { local } else { None };
        let remote = if mode.uses_remote() {
            remote
        } else {
            RemoteBlockCache::default()
        };
        Self {
            mode,
            tiers: Tiers {
                local,
                remote,
                metrics: None,
            },
            curr_lookup_cache: CacheTier::Local,
            served_by: CacheTier::None,
        }
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.tiers.metrics = Some(metrics);
        self
    }

    /// A fresh ctx over the same tiers with the cursor at the start.
    pub fn new_request(&self) -> Self {
        let mut ctx = self.clone();
        ctx.reset_cursor();
        ctx
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn local(&self) -> Option<&SharedCacheHandle> {
        self.tiers.local.as_ref()
    }

    pub fn remote(&self) -> &RemoteBlockCache {
        &self.tiers.remote
    }

    pub fn local_enabled(&self) -> bool {
        self.tiers.local.is_some()
    }

    pub fn remote_enabled(&self) -> bool {
        self.tiers.remote_enabled()
    }

    /// Next tier a lookup will consult.
    pub fn cursor(&self) -> CacheTier {
        self.curr_lookup_cache
    }

    /// Tier that served the most recent hit on this ctx.
    pub fn served_tier(&self) -> CacheTier {
        self.served_by
    }

    pub fn reset_cursor(&mut self) {
        self.curr_lookup_cache = CacheTier::Local;
        self.served_by = CacheTier::None;
    }

    /// Try the local tier if the cursor is on it. Advances the cursor either way.
    fn lookup_local_step(&mut self, key: &BlockCacheKey) -> Option<LookupOutcome> {
        if self.curr_lookup_cache != CacheTier::Local {
            return None;
        }
        self.curr_lookup_cache = CacheTier::Remote;

        let local = self.tiers.local.as_ref()?;
        let found = local.lookup(key);
        self.tiers.record_lookup(CacheTier::Local, found.is_some());
        found.map(|value| {
            self.served_by = CacheTier::Local;
            LookupOutcome::Hit {
                value,
                tier: CacheTier::Local,
            }
        })
    }

    /// Look `key` up in the tier under the cursor and every tier after it, stopping at the first hit.
    pub async fn lookup(&mut self, key: &BlockCacheKey) -> LookupOutcome {
        if let Some(hit) = self.lookup_local_step(key) {
            return hit;
        }

        if self.curr_lookup_cache == CacheTier::Remote {
            self.curr_lookup_cache = CacheTier::None;
            if self.tiers.remote_enabled() {
                let outcome = self.tiers.fetch_remote(key).await;
                if let LookupOutcome::Hit { value, .. } = &outcome {
                    self.tiers.insert_local(*key, value);
                    self.served_by = CacheTier::Remote;
                }
                return outcome;
            }
        }

        debug!(%key, cursor = %self.curr_lookup_cache, "Block cache miss");
        LookupOutcome::Miss
    }

    /// Like [`lookup`](Self::lookup), but a remote lookup runs detached.
    ///
    /// `on_done` receives the remote outcome only if `token` is still live
    /// when it completes. A stale completion is dropped and nothing is
    /// written through to the local tier.
    pub fn lookup_deferred<F>(&mut self, key: &BlockCacheKey, token: GuardToken, on_done: F) -> Deferred
    where
        F: FnOnce(LookupOutcome) + Send + 'static,
    {
        if let Some(hit) = self.lookup_local_step(key) {
            return Deferred::Ready(hit);
        }
        if self.curr_lookup_cache != CacheTier::Remote || !self.tiers.remote_enabled() {
            return Deferred::Ready(LookupOutcome::Miss);
        }
        self.curr_lookup_cache = CacheTier::None;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%key, "No runtime available for remote block cache lookup");
            return Deferred::Ready(LookupOutcome::Miss);
        };
        let tiers = self.tiers.clone();
        let key = *key;
        Deferred::Pending(runtime.spawn(async move {
            let outcome = tiers.fetch_remote(&key).await;
            if !token.is_live() {
                debug!(%key, "Request finalized before remote block cache lookup completed");
                return;
            }
            if let LookupOutcome::Hit { value, .. } = &outcome {
                tiers.insert_local(key, value);
            }
            on_done(outcome);
        }))
    }

    /// Insert into every enabled tier. The local insert is done on return.
    pub fn insert(&self, key: BlockCacheKey, value: BlockCacheValue) -> PendingWrite {
        self.tiers.insert_local(key, &value);
        self.tiers.spawn_remote("insert", move |remote| async move {
            remote.insert(&key, &value).await.map(|()| 1)
        })
    }

    /// Remove from every enabled tier. `hit_status` is the tier that served the stale value.
    pub fn remove(&self, key: BlockCacheKey, hit_status: CacheTier) -> PendingWrite {
        if let Some(local) = &self.tiers.local {
            local.remove(&key, hit_status);
        }
        self.tiers.spawn_remote("remove", move |remote| async move {
            remote.remove(&key).await.map(|()| 0)
        })
    }

    /// Look up at most [`MAX_BATCH_COUNT`] keys. Keys the local tier misses go to the remote tier in one call.
    pub async fn batch_lookup(&mut self, keys: &[BlockCacheKey]) -> Vec<CacheHit> {
        let keys = if keys.len() > MAX_BATCH_COUNT {
            debug!(requested = keys.len(), max = MAX_BATCH_COUNT, "Truncating block cache batch");
            &keys[..MAX_BATCH_COUNT]
        } else {
            keys
        };
        let mut hits = Vec::new();
        if keys.is_empty() {
            return hits;
        }
        let mut pending: Vec<BlockCacheKey> = keys.to_vec();

        if self.curr_lookup_cache == CacheTier::Local {
            self.curr_lookup_cache = CacheTier::Remote;
            if let Some(local) = &self.tiers.local {
                let kvs = local.batch_lookup(&pending);
                pending.retain(|key| !kvs.iter().any(|kv| kv.key == *key));
                for _ in &pending {
                    self.tiers.record_lookup(CacheTier::Local, false);
                }
                if !kvs.is_empty() {
                    self.served_by = CacheTier::Local;
                }
                hits.extend(kvs.into_iter().map(|kv| {
                    self.tiers.record_lookup(CacheTier::Local, true);
                    CacheHit {
                        key: kv.key,
                        value: kv.value,
                        tier: CacheTier::Local,
                    }
                }));
            }
        }

        if pending.is_empty() || self.curr_lookup_cache != CacheTier::Remote {
            return hits;
        }
        self.curr_lookup_cache = CacheTier::None;
        if !self.tiers.remote_enabled() {
            return hits;
        }

        match self.tiers.remote.batch_lookup(&pending).await {
            Ok(kvs) => {
                for _ in 0..pending.len().saturating_sub(kvs.len()) {
                    self.tiers.record_lookup(CacheTier::Remote, false);
                }
                if !kvs.is_empty() {
                    self.served_by = CacheTier::Remote;
                }
                for kv in kvs {
                    self.tiers.record_lookup(CacheTier::Remote, true);
                    self.tiers.insert_local(kv.key, &kv.value);
                    hits.push(CacheHit {
                        key: kv.key,
                        value: kv.value,
                        tier: CacheTier::Remote,
                    });
                }
            }
            Err(e) => {
                for _ in &pending {
                    self.tiers.record_lookup(CacheTier::Remote, false);
                }
                self.tiers.record_remote_error();
                warn!(count = pending.len(), error = %e, "Remote block cache batch lookup failed");
            }
        }
        hits
    }

    /// Insert at most [`MAX_BATCH_COUNT`] pairs into every enabled tier.
    pub fn batch_insert(&self, kvs: &[BlockCacheKv]) -> PendingWrite {
        let kvs = &kvs[..kvs.len().min(MAX_BATCH_COUNT)];
        if kvs.is_empty() {
            return PendingWrite::default();
        }
        for kv in kvs {
            self.tiers.insert_local(kv.key, &kv.value);
        }
        if !self.tiers.remote_enabled() {
            return PendingWrite::default();
        }
        let kvs = kvs.to_vec();
        self.tiers
            .spawn_remote("batch_insert", move |remote| async move { remote.batch_insert(&kvs).await })
    }
}
