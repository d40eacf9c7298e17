//! Master HTTP API.
//!
//! - POST /api/v1/workers/register
//! - GET /api/v1/workers
//! - GET /health

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::master::{RegisterWorkerRequest, RegisterWorkerResponse, WorkerRegistry};
use crate::worker::WorkerDescriptor;

pub fn build_router(registry: Arc<WorkerRegistry>) -> Router {
    Router::new()
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers", get(list_workers))
        .route("/health", get(health))
        .with_state(registry)
}

async fn register_worker(
    State(registry): State<Arc<WorkerRegistry>>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Json<RegisterWorkerResponse> {
    let worker_id = registry.register(request);
    Json(RegisterWorkerResponse { worker_id })
}

async fn list_workers(State(registry): State<Arc<WorkerRegistry>>) -> Json<Vec<WorkerDescriptor>> {
    Json(registry.workers())
}

async fn health(State(registry): State<Arc<WorkerRegistry>>) -> Json<Value> {
    Json(json!({ "status": "ok", "workers": registry.workers().len() }))
}
