//! Routes RPC calls to services by name.
//!
//! Every subsystem contributes a service map; names must be unique across all of
//! them. The resulting router exposes `POST /rpc/{service}/{method}` and bounds
//! the number of calls in flight across every route.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::IntCounterVec;
use serde_json::Value;
use thiserror::Error;
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::rpc::service::{RpcError, RpcService, RpcServiceMap};

#[derive(Error, Debug)]
pub enum MultiplexError {
    #[error("RPC service {name} registered by {owner} is already registered by {existing}")]
    DuplicateService {
        name: String,
        owner: String,
        existing: String,
    },
}

struct Registered {
    owner: String,
    service: Arc<dyn RpcService>,
}

struct MuxState {
    services: std::collections::BTreeMap<String, Registered>,
    requests: Option<IntCounterVec>,
}

/// Collects service maps and builds the RPC router.
#[derive(Default)]
pub struct RpcMultiplexer {
    services: std::collections::BTreeMap<String, Registered>,
}

impl RpcMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every service in `services`, owned by the subsystem `owner`.
    ///
    /// Nothing is added if any name collides.
    pub fn register(&mut self, owner: &str, services: RpcServiceMap) -> Result<(), MultiplexError> {
        if let Some(name) = services.keys().find(|name| self.services.contains_key(*name)) {
            return Err(MultiplexError::DuplicateService {
                name: name.clone(),
                owner: owner.to_string(),
                existing: self.services[name].owner.clone(),
            });
        }
        for (name, service) in services {
            debug!(service = %name, owner, "Registered RPC service");
            self.services.insert(
                name,
                Registered {
                    owner: owner.to_string(),
                    service,
                },
            );
        }
        Ok(())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Build the router. At most `max_concurrency` calls run at once.
    pub fn into_router(self, max_concurrency: usize, requests: Option<IntCounterVec>) -> Router {
        info!(services = ?self.service_names(), max_concurrency, "RPC multiplexer ready");
        let state = Arc::new(MuxState {
            services: self.services,
            requests,
        });
        Router::new()
            .route("/rpc", get(list_services))
            .route("/rpc/{service}/{method}", post(dispatch))
            .layer(GlobalConcurrencyLimitLayer::new(max_concurrency.max(1)))
            .with_state(state)
    }
}

async fn list_services(State(state): State<Arc<MuxState>>) -> Json<Vec<String>> {
    Json(state.services.keys().cloned().collect())
}

async fn dispatch(
    State(state): State<Arc<MuxState>>,
    Path((service, method)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, RpcError> {
    let request_id = Uuid::new_v4();
    let registered = state
        .services
        .get(&service)
        .ok_or_else(|| RpcError::UnknownService(service.clone()))?;
    if let Some(requests) = &state.requests {
        requests.with_label_values(&[service.as_str()]).inc();
    }

    debug!(%request_id, service, method, "RPC call");
    let result = registered.service.call(&method, payload).await;
    if let Err(e) = &result {
        debug!(%request_id, service, method, error = %e, "RPC call failed");
    }
    result.map(Json)
}
