//! Block location cache.
//!
//! This module contains the cache data structures and the two tiers:
//! - [`key`]: BlockCacheKey / BlockCacheValue and their wire encodings
//! - [`index`]: arena-backed dual index (ordered map + recency queue)
//! - [`slab`]: bounded size-class pool backing a zone
//! - [`local`]: shared local zone, its handle, and the zone registry
//! - [`remote`]: adapter onto a remote key-value store
//! - [`facade`]: per-request entry point combining both tiers
//! - [`guard`]: generation guards for deferred lookups
//! - [`error`]: failure taxonomy

pub mod error;
pub mod facade;
pub mod guard;
pub mod index;
pub mod key;
pub mod local;
pub mod remote;
pub mod slab;

use serde::{Deserialize, Serialize};

pub use error::CacheError;
pub use facade::{BlockCacheCtx, CacheHit, Deferred, LookupOutcome, PendingWrite};
pub use guard::{GuardToken, RequestGuard};
pub use key::{BlockCacheKey, BlockCacheKv, BlockCacheValue};
pub use local::{SharedCacheHandle, ZoneConfig, ZoneRegistry, ZoneStats};
pub use remote::{RemoteBlockCache, ServerAddrInfo, TairInstance};

/// A cache tier. Also used as the lookup cursor and as the hit status of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// No tier: nothing served the value, or the cursor is exhausted.
    None,
    Local,
    Remote,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::None => "none",
            CacheTier::Local => "local",
            CacheTier::Remote => "remote",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tiers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Off,
    #[default]
    Local,
    Remote,
    Both,
}

impl CacheMode {
    pub fn uses_local(&self) -> bool {
        matches!(self, CacheMode::Local | CacheMode::Both)
    }

    pub fn uses_remote(&self) -> bool {
        matches!(self, CacheMode::Remote | CacheMode::Both)
    }
}

impl std::fmt::Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMode::Off => write!(f, "off"),
            CacheMode::Local => write!(f, "local"),
            CacheMode::Remote => write!(f, "remote"),
            CacheMode::Both => write!(f, "both"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_tiers() {
        assert!(!CacheMode::Off.uses_local() && !CacheMode::Off.uses_remote());
        assert!(CacheMode::Local.uses_local() && !CacheMode::Local.uses_remote());
        assert!(!CacheMode::Remote.uses_local() && CacheMode::Remote.uses_remote());
        assert!(CacheMode::Both.uses_local() && CacheMode::Both.uses_remote());
    }

    #[test]
    fn test_mode_serde() {
        let mode: CacheMode = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(mode, CacheMode::Both);
        assert_eq!(serde_json::to_string(&CacheTier::Remote).unwrap(), "\"remote\"");
    }
}
