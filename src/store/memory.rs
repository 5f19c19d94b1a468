//! In-process [`RemoteKvStore`] backed by a hash map.
//!
//! Counts every call and can be switched into an unavailable state or given
//! artificial latency, which is what the facade tests lean on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::store::{KvEntry, RemoteError, RemoteKvStore};

/// Number of calls seen per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub gets: u64,
    pub mgets: u64,
    pub puts: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: Mutex<HashMap<(i32, Bytes), Bytes>>,
    unavailable: AtomicBool,
    latency: Option<Duration>,
    gets: AtomicU64,
    mgets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency` before it completes.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make every subsequent call fail with [`RemoteError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn call_counts(&self) -> StoreCallCounts {
        StoreCallCounts {
            gets: self.gets.load(Ordering::SeqCst),
            mgets: self.mgets.load(Ordering::SeqCst),
            puts: self.puts.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    /// Write directly, bypassing counters and failure injection.
    pub fn raw_put(&self, area: i32, key: &[u8], value: &[u8]) {
        self.data
            .lock()
            .insert((area, Bytes::copy_from_slice(key)), Bytes::copy_from_slice(value));
    }

    /// Read directly, bypassing counters and failure injection.
    pub fn raw_get(&self, area: i32, key: &[u8]) -> Option<Bytes> {
        self.data
            .lock()
            .get(&(area, Bytes::copy_from_slice(key)))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteKvStore for MemoryKvStore {
    async fn get(&self, area: i32, key: Bytes) -> Result<Option<Bytes>, RemoteError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.data.lock().get(&(area, key)).cloned())
    }

    async fn mget(&self, area: i32, keys: Vec<Bytes>) -> Result<Vec<KvEntry>, RemoteError> {
        self.mgets.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let data = self.data.lock();
        Ok(keys
            .into_iter()
            .map(|key| {
                let value = data.get(&(area, key.clone())).cloned();
                KvEntry { key, value }
            })
            .collect())
    }

    async fn put(
        &self,
        area: i32,
        key: Bytes,
        value: Bytes,
        _expire: u32,
        _version: u32,
    ) -> Result<(), RemoteError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        debug!(area, len = value.len(), "Memory store put");
        self.data.lock().insert((area, key), value);
        Ok(())
    }

    async fn delete(&self, area: i32, keys: Vec<Bytes>) -> Result<(), RemoteError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let mut data = self.data.lock();
        for key in keys {
            data.remove(&(area, key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_scoped_by_area() {
        let store = MemoryKvStore::new();
        let key = Bytes::from_static(b"k");

        store.put(1, key.clone(), Bytes::from_static(b"v"), 0, 0).await.unwrap();
        assert_eq!(store.get(1, key.clone()).await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(store.get(2, key.clone()).await.unwrap(), None);

        store.delete(1, vec![key.clone()]).await.unwrap();
        assert_eq!(store.get(1, key).await.unwrap(), None);

        let counts = store.call_counts();
        assert_eq!(counts.puts, 1);
        assert_eq!(counts.gets, 3);
        assert_eq!(counts.deletes, 1);
    }

    #[tokio::test]
    async fn test_mget_marks_missing_keys() {
        let store = MemoryKvStore::new();
        store.raw_put(0, b"a", b"1");
        let entries = store
            .mget(0, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();
        assert_eq!(entries[0].value, Some(Bytes::from_static(b"1")));
        assert_eq!(entries[1].value, None);
    }

    #[tokio::test]
    async fn test_unavailable_fails_calls() {
        let store = MemoryKvStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get(0, Bytes::from_static(b"a")).await,
            Err(RemoteError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get(0, Bytes::from_static(b"a")).await.is_ok());
    }
}
