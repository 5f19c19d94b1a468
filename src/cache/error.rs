//! Failure taxonomy for the block cache.
//!
//! None of these abort a request. The facade collapses every variant into a
//! cache miss and reports it through logs and metrics.

use thiserror::Error;

use crate::cache::slab::SlabError;
use crate::serialize::SerializeError;
use crate::store::RemoteError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("shared zone exhausted: {0}")]
    AllocationFailure(#[from] SlabError),

    #[error("remote cache transport failure: {0}")]
    RemoteTransport(#[from] RemoteError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("corrupt cache entry: expected {expected} bytes, found {actual}")]
    CorruptEntry { expected: usize, actual: usize },

    #[error("value with {count} data servers exceeds node capacity of {max}")]
    ValueTooLarge { count: usize, max: usize },

    #[error("zone \"{name}\" already exists with size {existing}, requested {requested}")]
    ZoneSizeMismatch {
        name: String,
        existing: usize,
        requested: usize,
    },

    #[error("zone size {0} is too small")]
    InvalidZoneSize(usize),

    #[error("invalid remote server address: {0}")]
    InvalidServerAddr(String),

    #[error(transparent)]
    Serialize(#[from] SerializeError),
}

impl CacheError {
    /// Whether the failure should be visible to operators (allocation and transport).
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            CacheError::AllocationFailure(_) | CacheError::RemoteTransport(_)
        )
    }
}
