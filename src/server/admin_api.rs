//! Admin HTTP API over the block cache.
//!
//! - GET /health
//! - GET /v1/cache/stats
//! - GET /metrics
//! - GET|PUT|DELETE /v1/blocks/{ns_addr}/{block_id}
//! - POST /v1/cache/discard

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::local::MAX_DS_COUNT;
use crate::cache::{
    BlockCacheCtx, BlockCacheKey, BlockCacheValue, CacheMode, CacheTier, LookupOutcome, ZoneStats,
};
use crate::metrics::CacheMetrics;

/// Application state shared across handlers.
pub struct AppState {
    /// Template ctx; each request works on a fresh copy.
    pub cache: BlockCacheCtx,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/discard", post(discard))
        .route("/metrics", get(metrics))
        .route(
            "/v1/blocks/{ns_addr}/{block_id}",
            get(get_block).put(put_block).delete(delete_block),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub mode: CacheMode,
    pub remote_enabled: bool,
    pub local: Option<ZoneStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockBody {
    pub ds_addrs: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub ns_addr: u64,
    pub block_id: u32,
    pub ds_addrs: Vec<u64>,
    pub tier: CacheTier,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiscardResponse {
    pub evicted: usize,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let local = state.cache.local().map(|zone| zone.stats());
    if let Some(stats) = &local {
        state.metrics.observe_zone(stats);
    }

    Json(CacheStatsResponse {
        mode: state.cache.mode(),
        remote_enabled: state.cache.remote_enabled(),
        local,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    if let Some(zone) = state.cache.local() {
        state.metrics.observe_zone(&zone.stats());
    }
    let body = state.metrics.render().map_err(|e| {
        warn!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn get_block(
    State(state): State<Arc<AppState>>,
    Path((ns_addr, block_id)): Path<(u64, u32)>,
) -> Result<Json<BlockResponse>, StatusCode> {
    let mut ctx = state.cache.new_request();
    match ctx.lookup(&BlockCacheKey::new(ns_addr, block_id)).await {
        LookupOutcome::Hit { value, tier } => Ok(Json(BlockResponse {
            ns_addr,
            block_id,
            ds_addrs: value.ds_addrs,
            tier,
        })),
        LookupOutcome::Miss => Err(StatusCode::NOT_FOUND),
    }
}

async fn put_block(
    State(state): State<Arc<AppState>>,
    Path((ns_addr, block_id)): Path<(u64, u32)>,
    Json(body): Json<BlockBody>,
) -> Result<StatusCode, StatusCode> {
    if body.ds_addrs.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    // Oversize values only fail when the local tier is the sole place they could go.
    let local_only = state.cache.local_enabled() && !state.cache.remote_enabled();
    if local_only && body.ds_addrs.len() > MAX_DS_COUNT {
        warn!(ns_addr, block_id, count = body.ds_addrs.len(), "Rejecting oversize block for local-only cache");
        return Err(StatusCode::BAD_REQUEST);
    }
    let ctx = state.cache.new_request();
    // The remote write, if any, completes on its own.
    let _ = ctx.insert(
        BlockCacheKey::new(ns_addr, block_id),
        BlockCacheValue::new(body.ds_addrs),
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_block(
    State(state): State<Arc<AppState>>,
    Path((ns_addr, block_id)): Path<(u64, u32)>,
) -> StatusCode {
    let ctx = state.cache.new_request();
    let _ = ctx.remove(BlockCacheKey::new(ns_addr, block_id), CacheTier::None);
    StatusCode::NO_CONTENT
}

async fn discard(State(state): State<Arc<AppState>>) -> Json<DiscardResponse> {
    let evicted = state.cache.local().map_or(0, |zone| zone.discard());
    info!(evicted, "Discard requested through admin API");
    Json(DiscardResponse { evicted })
}
