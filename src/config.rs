//! Runtime configuration for tfs-block-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file (or none at all) is valid.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::error::CacheError;
use crate::cache::local::{
    ZoneConfig, DEFAULT_DISCARD_ITEM_COUNT, DEFAULT_STAT_REPORT_INTERVAL, MIN_ZONE_SIZE,
};
use crate::cache::remote::ServerAddrInfo;
use crate::cache::CacheMode;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tfs-block-cache", about = "TFS block location cache with admin API")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for the admin API.
    #[arg(long, default_value = "127.0.0.1:8090")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
}

/// Local zone and tier selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Which tiers are consulted.
    pub mode: CacheMode,

    /// Name of the shared zone.
    pub zone_name: String,

    /// Zone size in bytes.
    pub zone_size: usize,

    /// Nodes evicted per discard round.
    pub discard_item_count: usize,

    /// Lookups between hit ratio log lines (0 disables the report).
    pub stat_report_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Local,
            zone_name: "tfs_module_block_cache_zone".to_string(),
            zone_size: 64 * 1024 * 1024, // 64 MiB
            discard_item_count: DEFAULT_DISCARD_ITEM_COUNT,
            stat_report_interval: DEFAULT_STAT_REPORT_INTERVAL,
        }
    }
}

/// Remote cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `"master;slave;group;area"`.
    pub server_addr: Option<String>,

    /// Per-operation timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_addr: None,
            timeout_ms: 500,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Check the settings the enabled tiers depend on.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.cache.mode.uses_local() {
            if self.cache.zone_size < MIN_ZONE_SIZE {
                return Err(CacheError::InvalidZoneSize(self.cache.zone_size));
            }
            if self.cache.discard_item_count == 0 {
                return Err(CacheError::InvalidArgument("discard_item_count must be positive"));
            }
        }

        match &self.remote.server_addr {
            Some(addr) => {
                ServerAddrInfo::parse(addr)?;
            }
            None if self.cache.mode.uses_remote() => {
                return Err(CacheError::InvalidServerAddr(String::new()));
            }
            None => {}
        }
        if self.cache.mode.uses_remote() && self.remote.timeout_ms == 0 {
            return Err(CacheError::InvalidArgument("remote timeout must be positive"));
        }
        Ok(())
    }

    /// Zone settings for the local tier.
    pub fn zone_config(&self) -> ZoneConfig {
        ZoneConfig {
            name: self.cache.zone_name.clone(),
            size: self.cache.zone_size,
            discard_item_count: self.cache.discard_item_count,
            stat_report_interval: self.cache.stat_report_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.mode, CacheMode::Local);
        assert_eq!(cfg.cache.zone_name, "tfs_module_block_cache_zone");
        assert_eq!(cfg.cache.discard_item_count, 10_000);
        assert_eq!(cfg.cache.stat_report_interval, 3000 * 60 * 60);
        assert_eq!(cfg.remote.timeout(), Duration::from_millis(500));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cache": {{"mode": "both", "zone_size": 16384}},
                "remote": {{"server_addr": "10.0.0.1:5198;10.0.0.2:5198;group_1;3"}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.cache.mode, CacheMode::Both);
        assert_eq!(cfg.cache.zone_size, 16384);
        assert_eq!(cfg.cache.discard_item_count, 10_000);
        assert_eq!(cfg.remote.timeout_ms, 500);
        assert!(cfg.validate().is_ok());

        let zone = cfg.zone_config();
        assert_eq!(zone.size, 16384);
        assert_eq!(zone.name, "tfs_module_block_cache_zone");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_validate_rejects_small_zone() {
        let mut cfg = Config::default();
        cfg.cache.zone_size = 8191;
        assert!(matches!(cfg.validate(), Err(CacheError::InvalidZoneSize(8191))));

        // The zone is irrelevant when the local tier is off.
        cfg.cache.mode = CacheMode::Off;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_remote_address() {
        let mut cfg = Config::default();
        cfg.cache.mode = CacheMode::Remote;
        assert!(matches!(cfg.validate(), Err(CacheError::InvalidServerAddr(_))));

        cfg.remote.server_addr = Some("only;two;".to_string());
        assert!(matches!(cfg.validate(), Err(CacheError::InvalidServerAddr(_))));

        cfg.remote.server_addr = Some("m:1;s:1;g;0".to_string());
        assert!(cfg.validate().is_ok());
    }
}
