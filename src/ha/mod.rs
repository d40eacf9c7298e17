//! High-availability exposure of cluster-facing network services.
//!
//! A service is either primary-only (standby holds the port with a listener that
//! rejects every connection) or always-on (the real service stays bound and only
//! its role flips). Both share the same state machine:
//!
//! ```text
//! STOPPED --start--> BOUND_STANDBY --promote--> SERVING
//!    ^                 |      ^                    |
//!    +------stop-------+      +------demote--------+
//! ```
//!
//! - [`state`]: `ServiceState` and its lock-free snapshot
//! - [`listener`]: a shared TCP listener that outlives the loops accepting on it
//! - [`endpoint`]: the real service behind a port, and the role flag it reads
//! - [`primary_only`] / [`always_on`]: the two variants

pub mod always_on;
pub mod endpoint;
pub mod listener;
pub mod primary_only;
pub mod state;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::HaMode;
use crate::server::ShutdownHandle;

pub use always_on::AlwaysOnService;
pub use endpoint::{RouterEndpoint, ServiceEndpoint, ServiceRole};
pub use listener::SharedListener;
pub use primary_only::PrimaryOnlyService;
pub use state::ServiceState;

#[derive(Error, Debug)]
pub enum HaError {
    /// A transition was requested from a state that does not allow it.
    #[error("{service}: invalid state for {operation}: {reason}")]
    InvalidState {
        service: String,
        operation: &'static str,
        reason: &'static str,
    },

    #[error("{service}: failed to bind {addr}: {source}")]
    Bind {
        service: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl HaError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, HaError::InvalidState { .. })
    }
}

/// A network service whose exposure follows the node's primary/standby role.
///
/// Transitions on one instance are serialised; the observers below only ever see
/// the state left by a completed transition.
#[async_trait]
pub trait HaService: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> HaMode;

    fn state(&self) -> ServiceState;

    /// The bound address while started, resolving port 0 to the assigned port.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_serving(&self) -> bool {
        self.state() == ServiceState::Serving
    }

    fn is_bound(&self) -> bool {
        self.state() != ServiceState::Stopped
    }

    /// Bind the port. Fails with `InvalidState` if already started.
    async fn start(&self) -> Result<(), HaError>;

    /// Begin serving as primary. A no-op when already serving.
    async fn promote(&self) -> Result<(), HaError>;

    /// Fall back to standby. A no-op when already standby.
    async fn demote(&self) -> Result<(), HaError>;

    /// Release the port. A no-op when already stopped.
    async fn stop(&self) -> Result<(), HaError>;
}

/// Build the variant selected by `mode`.
pub fn create(
    mode: HaMode,
    name: impl Into<String>,
    addr: SocketAddr,
    endpoint: Arc<dyn ServiceEndpoint>,
    stop_grace: Duration,
) -> Arc<dyn HaService> {
    match mode {
        HaMode::PrimaryOnly => Arc::new(PrimaryOnlyService::new(name, addr, endpoint, stop_grace)),
        HaMode::AlwaysOn => Arc::new(AlwaysOnService::new(name, addr, endpoint, stop_grace)),
    }
}

/// A loop spawned on a listener together with the handle that stops it.
pub(crate) struct RunningLoop {
    shutdown: ShutdownHandle,
    handle: JoinHandle<()>,
}

impl RunningLoop {
    pub(crate) fn new(shutdown: ShutdownHandle, handle: JoinHandle<()>) -> Self {
        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to exit, aborting it after `grace`.
    ///
    /// On return the loop has dropped its clone of the listener.
    pub(crate) async fn stop(self, service: &str, grace: Duration) {
        let RunningLoop { shutdown, mut handle } = self;
        shutdown.trigger();
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(
                service,
                grace_ms = grace.as_millis() as u64,
                "Loop did not drain in time, aborting"
            );
            handle.abort();
            let _ = handle.await;
        }
    }
}
