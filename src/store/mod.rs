//! Generic remote key-value store contract used by the remote cache tier.
//!
//! The store itself (a distributed KV cluster) lives outside this crate.
//! The cache only needs byte-string keys and values scoped by a numeric
//! area, and completion delivered asynchronously.
//!
//! - [`memory`]: in-process store used when no cluster is wired in, and by tests

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryKvStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote store returned error code {0}")]
    Code(i32),
}

/// One key of a multi-get. `value` is `None` when the store has nothing for the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

#[async_trait]
pub trait RemoteKvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, area: i32, key: Bytes) -> Result<Option<Bytes>, RemoteError>;

    async fn mget(&self, area: i32, keys: Vec<Bytes>) -> Result<Vec<KvEntry>, RemoteError>;

    /// Store `value` under `key`. `expire` of 0 never expires; `version` of 0 skips version checks.
    async fn put(
        &self,
        area: i32,
        key: Bytes,
        value: Bytes,
        expire: u32,
        version: u32,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, area: i32, keys: Vec<Bytes>) -> Result<(), RemoteError>;
}
