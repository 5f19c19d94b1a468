//! Integration tests for the two-tier block cache facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tfs_block_cache::cache::{
    BlockCacheCtx, BlockCacheKey, BlockCacheKv, BlockCacheValue, CacheMode, CacheTier, Deferred,
    LookupOutcome, RemoteBlockCache, RequestGuard, SharedCacheHandle, ZoneConfig,
};
use tfs_block_cache::metrics::CacheMetrics;
use tfs_block_cache::store::{MemoryKvStore, RemoteKvStore};

const SERVER_ADDR: &str = "10.0.0.1:5198;10.0.0.2:5198;group_1;1";
const AREA: i32 = 1;

fn make_zone() -> SharedCacheHandle {
    SharedCacheHandle::new(&ZoneConfig::new("facade_tests", 1 << 20)).unwrap()
}

fn make_remote(store: Arc<MemoryKvStore>) -> RemoteBlockCache {
    let mut remote = RemoteBlockCache::default();
    remote
        .attach(SERVER_ADDR, Duration::from_millis(500), move |_| {
            store as Arc<dyn RemoteKvStore>
        })
        .unwrap();
    remote
}

fn seed_remote(store: &MemoryKvStore, key: BlockCacheKey, ds_addrs: Vec<u64>) {
    let value = BlockCacheValue::new(ds_addrs).encode().unwrap();
    store.raw_put(AREA, &key.encode(), &value);
}

#[tokio::test]
async fn test_remote_only_mode_skips_local() {
    let store = Arc::new(MemoryKvStore::new());
    let zone = make_zone();
    let key = BlockCacheKey::new(0x1000, 42);
    seed_remote(&store, key, vec![0xAAAA, 0xBBBB]);

    let mut ctx = BlockCacheCtx::new(CacheMode::Remote, Some(zone.clone()), make_remote(store.clone()));
    let outcome = ctx.lookup(&key).await;

    assert_eq!(
        outcome,
        LookupOutcome::Hit {
            value: BlockCacheValue::new(vec![0xAAAA, 0xBBBB]),
            tier: CacheTier::Remote,
        }
    );
    assert_eq!(store.call_counts().gets, 1);
    assert!(zone.is_empty());
    assert_eq!(zone.stats().miss_count, 0);
}

#[tokio::test]
async fn test_remote_hit_writes_through_to_local() {
    let store = Arc::new(MemoryKvStore::new());
    let zone = make_zone();
    let key = BlockCacheKey::new(0x1000, 7);
    seed_remote(&store, key, vec![1, 2]);

    let template = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()));

    let mut first = template.new_request();
    assert_eq!(first.lookup(&key).await.tier(), CacheTier::Remote);
    assert_eq!(first.served_tier(), CacheTier::Remote);
    assert!(zone.contains(&key));

    let mut second = template.new_request();
    assert_eq!(second.lookup(&key).await.tier(), CacheTier::Local);
    assert_eq!(store.call_counts().gets, 1);
}

#[tokio::test]
async fn test_retry_resumes_at_next_tier() {
    let store = Arc::new(MemoryKvStore::new());
    let zone = make_zone();
    let key = BlockCacheKey::new(0x1000, 8);
    zone.insert(key, &BlockCacheValue::new(vec![0xDEAD])).unwrap();
    seed_remote(&store, key, vec![0xBEEF]);

    let mut ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()));
    let stale = ctx.lookup(&key).await;
    assert_eq!(stale.value().unwrap().ds_addrs, vec![0xDEAD]);

    // The local value turned out stale; drop it and ask the next tier.
    zone.remove(&key, stale.tier());
    let fresh = ctx.lookup(&key).await;
    assert_eq!(fresh.tier(), CacheTier::Remote);
    assert_eq!(fresh.value().unwrap().ds_addrs, vec![0xBEEF]);

    assert_eq!(ctx.lookup(&key).await, LookupOutcome::Miss);
    assert_eq!(ctx.cursor(), CacheTier::None);
}

#[tokio::test]
async fn test_transport_failure_is_a_miss() {
    let store = Arc::new(MemoryKvStore::new());
    let key = BlockCacheKey::new(0x1000, 9);
    seed_remote(&store, key, vec![5]);
    store.set_unavailable(true);

    let metrics = CacheMetrics::new().unwrap();
    let mut ctx = BlockCacheCtx::new(CacheMode::Both, Some(make_zone()), make_remote(store.clone()))
        .with_metrics(metrics.clone());

    assert_eq!(ctx.lookup(&key).await, LookupOutcome::Miss);
    assert_eq!(metrics.remote_errors(), 1);
    assert_eq!(metrics.lookup_count(CacheTier::Local, false), 1);
    assert_eq!(metrics.lookup_count(CacheTier::Remote, false), 1);
}

#[tokio::test]
async fn test_invalid_remote_value_is_removed() {
    let store = Arc::new(MemoryKvStore::new());
    let key = BlockCacheKey::new(0x1000, 10);
    // Nothing past the count prefix.
    store.raw_put(AREA, &key.encode(), &[0, 0, 0, 0]);

    let zone = make_zone();
    let mut ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()));
    assert_eq!(ctx.lookup(&key).await, LookupOutcome::Miss);
    assert!(!zone.contains(&key));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.raw_get(AREA, &key.encode()).is_none());
    assert_eq!(store.call_counts().deletes, 1);
}

#[tokio::test]
async fn test_insert_and_remove_reach_both_tiers() {
    let store = Arc::new(MemoryKvStore::new());
    let zone = make_zone();
    let ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()));
    let key = BlockCacheKey::new(0x2000, 1);
    let value = BlockCacheValue::new(vec![0xAAAA, 0xBBBB]);

    let pending = ctx.insert(key, value.clone());
    // The local write is visible before the remote one settles.
    assert!(zone.contains(&key));
    assert!(pending.is_pending());
    pending.settled().await;

    let stored = store.raw_get(AREA, &key.encode()).unwrap();
    assert_eq!(BlockCacheValue::decode(&stored).unwrap(), value);

    ctx.remove(key, CacheTier::Local).settled().await;
    assert!(!zone.contains(&key));
    assert!(store.raw_get(AREA, &key.encode()).is_none());
    assert_eq!(zone.stats().invalidations, 1);
}

#[tokio::test]
async fn test_remote_write_failure_does_not_fail_insert() {
    let store = Arc::new(MemoryKvStore::new());
    store.set_unavailable(true);
    let zone = make_zone();
    let metrics = CacheMetrics::new().unwrap();
    let ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()))
        .with_metrics(metrics.clone());

    let key = BlockCacheKey::new(0x2000, 2);
    ctx.insert(key, BlockCacheValue::new(vec![1])).settled().await;

    assert!(zone.contains(&key));
    assert!(store.is_empty());
    assert_eq!(metrics.remote_errors(), 1);
    assert_eq!(metrics.insert_count(CacheTier::Remote), 0);
    assert_eq!(metrics.insert_count(CacheTier::Local), 1);
}

#[tokio::test]
async fn test_remote_inserts_counted_once_stored() {
    let store = Arc::new(MemoryKvStore::with_latency(Duration::from_millis(20)));
    let metrics = CacheMetrics::new().unwrap();
    let ctx = BlockCacheCtx::new(CacheMode::Remote, None, make_remote(store.clone()))
        .with_metrics(metrics.clone());

    let pending = ctx.insert(BlockCacheKey::new(0x2000, 3), BlockCacheValue::new(vec![1]));
    assert_eq!(metrics.insert_count(CacheTier::Remote), 0);
    pending.settled().await;
    assert_eq!(metrics.insert_count(CacheTier::Remote), 1);

    let kvs: Vec<_> = (10..13)
        .map(|i| BlockCacheKv {
            key: BlockCacheKey::new(0x2000, i),
            value: BlockCacheValue::new(vec![u64::from(i)]),
        })
        .collect();
    ctx.batch_insert(&kvs).settled().await;
    assert_eq!(metrics.insert_count(CacheTier::Remote), 4);
    assert_eq!(metrics.remote_errors(), 0);
}

#[tokio::test]
async fn test_rejected_remote_insert_is_not_a_transport_error() {
    let store = Arc::new(MemoryKvStore::new());
    let metrics = CacheMetrics::new().unwrap();
    let ctx = BlockCacheCtx::new(CacheMode::Remote, None, make_remote(store.clone()))
        .with_metrics(metrics.clone());

    ctx.insert(BlockCacheKey::new(0x2000, 4), BlockCacheValue::default())
        .settled()
        .await;

    assert!(store.is_empty());
    assert_eq!(metrics.remote_errors(), 0);
    assert_eq!(metrics.insert_count(CacheTier::Remote), 0);
}

#[tokio::test]
async fn test_batch_lookup_combines_tiers() {
    let store = Arc::new(MemoryKvStore::new());
    let zone = make_zone();
    let k1 = BlockCacheKey::new(0x3000, 1);
    let k2 = BlockCacheKey::new(0x3000, 2);
    let k3 = BlockCacheKey::new(0x3000, 3);
    zone.insert(k1, &BlockCacheValue::new(vec![11])).unwrap();
    seed_remote(&store, k2, vec![22]);

    let mut ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()));
    let hits = ctx.batch_lookup(&[k1, k2, k3]).await;

    assert_eq!(hits.len(), 2);
    let local_hit = hits.iter().find(|hit| hit.key == k1).unwrap();
    assert_eq!(local_hit.tier, CacheTier::Local);
    let remote_hit = hits.iter().find(|hit| hit.key == k2).unwrap();
    assert_eq!(remote_hit.tier, CacheTier::Remote);
    assert_eq!(remote_hit.value.ds_addrs, vec![22]);

    assert_eq!(store.call_counts().mgets, 1);
    assert!(zone.contains(&k2));
    assert!(!zone.contains(&k3));
}

#[tokio::test]
async fn test_batch_insert_reaches_both_tiers() {
    let store = Arc::new(MemoryKvStore::new());
    let zone = make_zone();
    let ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store.clone()));

    let kvs: Vec<_> = (0..3)
        .map(|i| BlockCacheKv {
            key: BlockCacheKey::new(0x4000, i),
            value: BlockCacheValue::new(vec![u64::from(i) + 100]),
        })
        .collect();
    ctx.batch_insert(&kvs).settled().await;

    assert_eq!(zone.len(), 3);
    assert_eq!(store.len(), 3);
    assert_eq!(store.call_counts().puts, 3);
}

#[tokio::test]
async fn test_deferred_lookup_delivers_while_request_lives() {
    let store = Arc::new(MemoryKvStore::with_latency(Duration::from_millis(20)));
    let zone = make_zone();
    let key = BlockCacheKey::new(0x5000, 1);
    seed_remote(&store, key, vec![0x77]);

    let mut ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store));
    let guard = RequestGuard::new();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let deferred = ctx.lookup_deferred(&key, guard.token(), move |outcome| {
        let _ = tx.send(outcome);
    });
    let Deferred::Pending(handle) = deferred else {
        panic!("expected a pending remote lookup");
    };
    handle.await.unwrap();

    let outcome = rx.await.unwrap();
    assert_eq!(outcome.tier(), CacheTier::Remote);
    assert!(zone.contains(&key));
}

#[tokio::test]
async fn test_deferred_lookup_dropped_after_cancel() {
    let store = Arc::new(MemoryKvStore::with_latency(Duration::from_millis(20)));
    let zone = make_zone();
    let key = BlockCacheKey::new(0x5000, 2);
    seed_remote(&store, key, vec![0x88]);

    let mut ctx = BlockCacheCtx::new(CacheMode::Both, Some(zone.clone()), make_remote(store));
    let guard = RequestGuard::new();
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let deferred = ctx.lookup_deferred(&key, guard.token(), move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    // The request is finalized before the remote answer arrives.
    guard.cancel();

    let Deferred::Pending(handle) = deferred else {
        panic!("expected a pending remote lookup");
    };
    handle.await.unwrap();

    assert!(!called.load(Ordering::SeqCst));
    assert!(!zone.contains(&key));
}

#[tokio::test]
async fn test_deferred_lookup_local_hit_is_ready() {
    let zone = make_zone();
    let key = BlockCacheKey::new(0x5000, 3);
    zone.insert(key, &BlockCacheValue::new(vec![1])).unwrap();

    let mut ctx = BlockCacheCtx::new(CacheMode::Local, Some(zone), RemoteBlockCache::default());
    let guard = RequestGuard::new();
    match ctx.lookup_deferred(&key, guard.token(), |_| panic!("no callback for local hits")) {
        Deferred::Ready(outcome) => assert_eq!(outcome.tier(), CacheTier::Local),
        Deferred::Pending(_) => panic!("local hit should be ready"),
    }
}
