//! The real service behind an HA-managed port.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::ha::listener::SharedListener;
use crate::server::ShutdownSignal;

/// Paths a standby still answers: liveness and metrics scraping.
const STANDBY_PATHS: &[&str] = &["/health", "/metrics"];

/// Whether the node currently answers as primary for a service.
#[derive(Debug, Clone, Default)]
pub struct ServiceRole(Arc<AtomicBool>);

impl ServiceRole {
    pub fn is_primary(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set_primary(&self, primary: bool) {
        self.0.store(primary, Ordering::Release);
    }
}

/// Something that serves connections accepted on a listener until told to stop.
#[async_trait]
pub trait ServiceEndpoint: Send + Sync + 'static {
    /// Serve on `listener` until `shutdown` fires. Must not close the listener.
    async fn serve(
        &self,
        listener: SharedListener,
        role: ServiceRole,
        shutdown: ShutdownSignal,
    ) -> io::Result<()>;
}

/// Serves an axum router; requests other than health and metrics get `503` while
/// the role is standby.
pub struct RouterEndpoint {
    name: String,
    router: Router,
}

impl RouterEndpoint {
    pub fn new(name: impl Into<String>, router: Router) -> Self {
        Self {
            name: name.into(),
            router,
        }
    }
}

#[async_trait]
impl ServiceEndpoint for RouterEndpoint {
    async fn serve(
        &self,
        listener: SharedListener,
        role: ServiceRole,
        shutdown: ShutdownSignal,
    ) -> io::Result<()> {
        let app = self
            .router
            .clone()
            .layer(middleware::from_fn_with_state(role, role_gate))
            .layer(TraceLayer::new_for_http());

        info!(service = %self.name, addr = ?listener.local_addr().ok(), "Serving");
        let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
        info!(service = %self.name, "Server loop exited");
        result
    }
}

async fn role_gate(State(role): State<ServiceRole>, request: Request, next: Next) -> Response {
    if role.is_primary() || STANDBY_PATHS.contains(&request.uri().path()) {
        next.run(request).await
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "standby").into_response()
    }
}
