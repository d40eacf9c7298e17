//! Always-on exposure: the real service stays bound while standby.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::HaMode;
use crate::ha::endpoint::{ServiceEndpoint, ServiceRole};
use crate::ha::listener::SharedListener;
use crate::ha::state::{ServiceState, StateCell};
use crate::ha::{HaError, HaService, RunningLoop};
use crate::server::shutdown_signal;

#[derive(Default)]
struct Bound {
    listener: Option<SharedListener>,
    running: Option<RunningLoop>,
}

/// Binds and serves from `start` to `stop`. Promotion only flips the role the
/// endpoint reads; the socket is untouched until `stop`.
pub struct AlwaysOnService {
    name: String,
    addr: SocketAddr,
    endpoint: Arc<dyn ServiceEndpoint>,
    stop_grace: Duration,
    role: ServiceRole,
    state: StateCell,
    bound_addr: StdMutex<Option<SocketAddr>>,
    transition: Mutex<Bound>,
}

impl AlwaysOnService {
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        endpoint: Arc<dyn ServiceEndpoint>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            endpoint,
            stop_grace,
            role: ServiceRole::default(),
            state: StateCell::new(),
            bound_addr: StdMutex::new(None),
            transition: Mutex::new(Bound::default()),
        }
    }

    fn invalid(&self, operation: &'static str, reason: &'static str) -> HaError {
        HaError::InvalidState {
            service: self.name.clone(),
            operation,
            reason,
        }
    }

    fn set_bound_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut bound) = self.bound_addr.lock() {
            *bound = addr;
        }
    }
}

#[async_trait]
impl HaService for AlwaysOnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> HaMode {
        HaMode::AlwaysOn
    }

    fn state(&self) -> ServiceState {
        self.state.get()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.lock().ok().and_then(|bound| *bound)
    }

    async fn start(&self) -> Result<(), HaError> {
        let mut bound = self.transition.lock().await;
        if bound.listener.is_some() {
            return Err(self.invalid("start", "server must not already exist"));
        }

        let listener = SharedListener::bind(self.addr).await.map_err(|source| HaError::Bind {
            service: self.name.clone(),
            addr: self.addr,
            source,
        })?;
        let local = listener.local_addr().ok();

        let (handle, signal) = shutdown_signal();
        let endpoint = self.endpoint.clone();
        let role = self.role.clone();
        let name = self.name.clone();
        let serve_on = listener.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = endpoint.serve(serve_on, role, signal).await {
                tracing::error!(service = %name, error = %e, "Endpoint failed");
            }
        });

        bound.running = Some(RunningLoop::new(handle, task));
        bound.listener = Some(listener);
        self.set_bound_addr(local);
        self.state.set(ServiceState::BoundStandby);
        info!(service = %self.name, addr = ?local, "Bound standby (serving as standby)");
        Ok(())
    }

    async fn promote(&self) -> Result<(), HaError> {
        let _bound = self.transition.lock().await;
        match self.state.get() {
            ServiceState::Stopped => Err(self.invalid("promote", "service is not started")),
            ServiceState::Serving => Ok(()),
            ServiceState::BoundStandby => {
                self.role.set_primary(true);
                self.state.set(ServiceState::Serving);
                info!(service = %self.name, "Promoted to primary");
                Ok(())
            }
        }
    }

    async fn demote(&self) -> Result<(), HaError> {
        let _bound = self.transition.lock().await;
        match self.state.get() {
            ServiceState::Stopped => Err(self.invalid("demote", "service is not started")),
            ServiceState::BoundStandby => Ok(()),
            ServiceState::Serving => {
                self.role.set_primary(false);
                self.state.set(ServiceState::BoundStandby);
                info!(service = %self.name, "Demoted to standby");
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<(), HaError> {
        let mut bound = self.transition.lock().await;
        self.role.set_primary(false);
        if let Some(running) = bound.running.take() {
            running.stop(&self.name, self.stop_grace).await;
        }
        if bound.listener.take().is_some() {
            info!(service = %self.name, "Released port");
        }
        self.set_bound_addr(None);
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}
