use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tfs_block_cache::cache::{BlockCacheCtx, RemoteBlockCache, ZoneRegistry};
use tfs_block_cache::config::{Cli, Config};
use tfs_block_cache::metrics::CacheMetrics;
use tfs_block_cache::server::admin_api::{build_router, AppState};
use tfs_block_cache::store::{MemoryKvStore, RemoteKvStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tfs_block_cache=debug,tower_http=debug"
    } else {
        "tfs_block_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("tfs-block-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    info!(
        mode = %config.cache.mode,
        zone = %config.cache.zone_name,
        zone_size = config.cache.zone_size,
        discard_item_count = config.cache.discard_item_count,
        "Configuration loaded"
    );

    // Initialize the local zone.
    let registry = ZoneRegistry::new();
    let local = if config.cache.mode.uses_local() {
        Some(registry.init_zone(&config.zone_config())?)
    } else {
        None
    };

    // Attach the remote tier. No cluster client is linked in, so the
    // configured address is served by an in-process store.
    let mut remote = RemoteBlockCache::default();
    if let Some(addr) = &config.remote.server_addr {
        if config.cache.mode.uses_remote() {
            remote.attach(addr, config.remote.timeout(), |info| {
                warn!(
                    group = %info.group,
                    area = info.area,
                    "Serving remote block cache from an in-process store"
                );
                Arc::new(MemoryKvStore::new()) as Arc<dyn RemoteKvStore>
            })?;
        }
    }

    let metrics = CacheMetrics::new()?;
    let cache = BlockCacheCtx::new(config.cache.mode, local, remote).with_metrics(metrics.clone());

    // Build application state.
    let state = Arc::new(AppState {
        cache,
        metrics,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli.listen;
    info!(addr = %listen_addr, "Starting admin server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
