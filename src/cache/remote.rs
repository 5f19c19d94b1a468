//! Remote block cache: block cache semantics on top of a [`RemoteKvStore`].
//!
//! Keys are the 12-byte encoded [`BlockCacheKey`], values the count-prefixed
//! [`BlockCacheValue`], both scoped by the instance's area. A missing
//! instance or an empty key batch is rejected before any I/O. Values that
//! come back malformed or with zero data servers count as misses, and a
//! delete for them is fired off so the next reader does not trip on them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::error::CacheError;
use crate::cache::key::{BlockCacheKey, BlockCacheKv, BlockCacheValue, VALUE_BASE_SIZE};
use crate::store::{RemoteError, RemoteKvStore};

/// `;`-terminated parts before the area: master, slave, group.
pub const SERVER_ADDR_PART_COUNT: usize = 3;

/// Leading parts that name config servers.
pub const CONFIG_SERVER_COUNT: usize = 2;

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_millis(500);

/// Parsed `"master;slave;group;area"` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddrInfo {
    /// Non-empty config servers, master first.
    pub config_servers: Vec<String>,
    pub group: String,
    pub area: i32,
}

impl ServerAddrInfo {
    pub fn parse(addr: &str) -> Result<Self, CacheError> {
        let invalid = || CacheError::InvalidServerAddr(addr.to_string());

        let mut rest = addr;
        let mut parts = Vec::with_capacity(SERVER_ADDR_PART_COUNT);
        for _ in 0..SERVER_ADDR_PART_COUNT {
            let (part, tail) = rest.split_once(';').ok_or_else(invalid)?;
            parts.push(part.to_string());
            rest = tail;
        }
        if rest.is_empty() {
            return Err(invalid());
        }
        let area: i32 = rest.trim().parse().map_err(|_| invalid())?;
        if area < 0 {
            return Err(invalid());
        }

        let group = parts.pop().unwrap_or_default();
        let config_servers: Vec<String> = parts
            .into_iter()
            .take(CONFIG_SERVER_COUNT)
            .filter(|s| !s.is_empty())
            .collect();
        if config_servers.is_empty() || group.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            config_servers,
            group,
            area,
        })
    }
}

fn addr_hash(addr: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish()
}

/// Connection to one remote cache cluster, read-only once built.
#[derive(Debug)]
pub struct TairInstance {
    server_addr_hash: u64,
    info: ServerAddrInfo,
    store: Arc<dyn RemoteKvStore>,
    timeout: Duration,
}

impl TairInstance {
    pub fn new(
        server_addr: &str,
        store: Arc<dyn RemoteKvStore>,
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        let info = ServerAddrInfo::parse(server_addr)?;
        Ok(Self {
            server_addr_hash: addr_hash(server_addr),
            info,
            store,
            timeout,
        })
    }

    pub fn area(&self) -> i32 {
        self.info.area
    }

    pub fn info(&self) -> &ServerAddrInfo {
        &self.info
    }

    pub fn server_addr_hash(&self) -> u64 {
        self.server_addr_hash
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: std::future::Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.timeout)),
        }
    }
}

/// Remote tier adapter. Clones share the same instance.
#[derive(Debug, Clone, Default)]
pub struct RemoteBlockCache {
    instance: Option<Arc<TairInstance>>,
}

impl RemoteBlockCache {
    pub fn new(instance: Option<Arc<TairInstance>>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> Option<&Arc<TairInstance>> {
        self.instance.as_ref()
    }

    /// Point the adapter at `server_addr`, keeping the current instance if the address is unchanged.
    ///
    /// Returns `true` when a new instance was built.
    pub fn attach<C>(
        &mut self,
        server_addr: &str,
        timeout: Duration,
        connect: C,
    ) -> Result<bool, CacheError>
    where
        C: FnOnce(&ServerAddrInfo) -> Arc<dyn RemoteKvStore>,
    {
        if server_addr.is_empty() {
            return Err(CacheError::InvalidServerAddr(String::new()));
        }
        if let Some(current) = &self.instance {
            if current.server_addr_hash == addr_hash(server_addr) {
                return Ok(false);
            }
        }

        let info = ServerAddrInfo::parse(server_addr)?;
        let store = connect(&info);
        self.instance = Some(Arc::new(TairInstance {
            server_addr_hash: addr_hash(server_addr),
            info,
            store,
            timeout,
        }));
        Ok(true)
    }

    fn require(&self) -> Result<&Arc<TairInstance>, CacheError> {
        self.instance
            .as_ref()
            .ok_or(CacheError::InvalidArgument("remote cache instance not configured"))
    }

    /// Decode a remote value, or `None` if it should be treated as invalid.
    fn decode_value(key: &BlockCacheKey, raw: &[u8]) -> Option<BlockCacheValue> {
        if raw.len() <= VALUE_BASE_SIZE {
            return None;
        }
        match BlockCacheValue::decode(raw) {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!(%key, error = %e, "Malformed remote block cache value");
                None
            }
        }
    }

    fn spawn_invalidate(instance: Arc<TairInstance>, keys: Vec<Bytes>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let count = keys.len();
            let result = instance
                .call(instance.store.delete(instance.area(), keys))
                .await;
            if let Err(e) = result {
                warn!(count, error = %e, "Failed to drop invalid remote block cache entries");
            }
        });
    }

    pub async fn lookup(&self, key: &BlockCacheKey) -> Result<Option<BlockCacheValue>, CacheError> {
        let instance = self.require()?;
        debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Lookup remote block cache");

        let raw = instance
            .call(instance.store.get(instance.area(), key.to_bytes()))
            .await?;
        let Some(raw) = raw else {
            debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Remote block cache miss");
            return Ok(None);
        };

        match Self::decode_value(key, &raw) {
            Some(value) => Ok(Some(value)),
            None => {
                Self::spawn_invalidate(instance.clone(), vec![key.to_bytes()]);
                Ok(None)
            }
        }
    }

    pub async fn insert(&self, key: &BlockCacheKey, value: &BlockCacheValue) -> Result<(), CacheError> {
        let instance = self.require()?;
        if value.is_empty() {
            return Err(CacheError::InvalidArgument("value has no data servers"));
        }
        debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Insert remote block cache");

        let encoded = value.encode()?;
        instance
            .call(instance.store.put(instance.area(), key.to_bytes(), encoded, 0, 0))
            .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &BlockCacheKey) -> Result<(), CacheError> {
        let instance = self.require()?;
        debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Remove remote block cache");

        instance
            .call(instance.store.delete(instance.area(), vec![key.to_bytes()]))
            .await?;
        Ok(())
    }

    /// Multi-get `keys`. Keys without a valid value are absent from the result.
    pub async fn batch_lookup(&self, keys: &[BlockCacheKey]) -> Result<Vec<BlockCacheKv>, CacheError> {
        let instance = self.require()?;
        if keys.is_empty() {
            return Err(CacheError::InvalidArgument("empty key batch"));
        }
        for key in keys {
            debug!(ns_addr = key.ns_addr, block_id = key.block_id, "Batch lookup remote block cache");
        }

        let entries = instance
            .call(
                instance
                    .store
                    .mget(instance.area(), keys.iter().map(BlockCacheKey::to_bytes).collect()),
            )
            .await?;

        let mut kvs = Vec::new();
        let mut invalid = Vec::new();
        for entry in entries {
            let Some(raw) = entry.value else {
                continue;
            };
            let Ok(key) = BlockCacheKey::decode(&entry.key) else {
                continue;
            };
            match Self::decode_value(&key, &raw) {
                Some(value) => kvs.push(BlockCacheKv { key, value }),
                None => invalid.push(entry.key),
            }
        }
        if !invalid.is_empty() {
            Self::spawn_invalidate(instance.clone(), invalid);
        }

        debug!(requested = keys.len(), hits = kvs.len(), "Batch lookup remote block cache done");
        Ok(kvs)
    }

    /// Put every pair. Succeeds if at least one put went through.
    pub async fn batch_insert(&self, kvs: &[BlockCacheKv]) -> Result<usize, CacheError> {
        let instance = self.require()?;
        if kvs.is_empty() {
            return Err(CacheError::InvalidArgument("empty key batch"));
        }

        let mut puts = Vec::with_capacity(kvs.len());
        for kv in kvs {
            if kv.value.is_empty() {
                continue;
            }
            let encoded = kv.value.encode()?;
            puts.push(instance.call(instance.store.put(
                instance.area(),
                kv.key.to_bytes(),
                encoded,
                0,
                0,
            )));
        }

        let mut stored = 0;
        let mut last_error = None;
        for result in join_all(puts).await {
            match result {
                Ok(()) => stored += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if stored == 0 => Err(e.into()),
            Some(e) => {
                warn!(stored, total = kvs.len(), error = %e, "Partial remote block cache batch insert");
                Ok(stored)
            }
            None => Ok(stored),
        }
    }
}
