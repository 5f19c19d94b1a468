//! tfs-block-cache: block location cache for the TFS HTTP gateway.
//!
//! Maps `(name server, block id)` to the data servers holding that block,
//! so a gateway can skip the name server round trip on repeat reads:
//!   shared local zone (LRU, bounded) → remote KV tier (optional)
//!
//! The binary wraps the cache in a small admin HTTP API.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod serialize;
pub mod server;
pub mod store;
