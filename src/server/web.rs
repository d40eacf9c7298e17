//! Worker web API.
//!
//! - GET /metrics
//! - GET /health
//! - GET /api/v1/worker

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::metrics::MetricsSystem;
use crate::worker::{BlockStore, WorkerContext, WorkerId, WorkerNetAddress};

/// State shared across web handlers.
pub struct WebState {
    pub context: Arc<WorkerContext>,
    pub blocks: Arc<BlockStore>,
}

/// Build the web router. The metrics handler is mounted before anything else.
pub fn build_router(metrics: &Arc<MetricsSystem>, state: Arc<WebState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/api/v1/worker", get(worker_info))
        .with_state(state);
    metrics.handler().merge(api)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkerInfoResponse {
    pub worker_id: Option<WorkerId>,
    pub address: Option<WorkerNetAddress>,
    pub start_time_ms: u64,
    pub uptime_secs: u64,
    pub block_count: usize,
    pub block_bytes: u64,
}

async fn health(State(state): State<Arc<WebState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.context.uptime().as_secs(),
    })
}

async fn worker_info(State(state): State<Arc<WebState>>) -> Json<WorkerInfoResponse> {
    Json(WorkerInfoResponse {
        worker_id: state.context.worker_id(),
        address: state.context.net_address().cloned(),
        start_time_ms: state.context.start_time_ms(),
        uptime_secs: state.context.uptime().as_secs(),
        block_count: state.blocks.len(),
        block_bytes: state.blocks.total_bytes(),
    })
}
