//! Primary-only exposure: only the primary serves, standby rejects.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::HaMode;
use crate::ha::endpoint::{ServiceEndpoint, ServiceRole};
use crate::ha::listener::{spawn_rejecting, SharedListener};
use crate::ha::state::{ServiceState, StateCell};
use crate::ha::{HaError, HaService, RunningLoop};
use crate::server::shutdown_signal;

#[derive(Default)]
struct Bound {
    listener: Option<SharedListener>,
    running: Option<RunningLoop>,
}

/// Holds its port from `start` to `stop`; a rejecting loop answers while standby
/// and the real endpoint answers while promoted. The listener itself is never
/// dropped between the two, so the port cannot be lost mid-swap.
pub struct PrimaryOnlyService {
    name: String,
    addr: SocketAddr,
    endpoint: Arc<dyn ServiceEndpoint>,
    stop_grace: Duration,
    role: ServiceRole,
    state: StateCell,
    bound_addr: StdMutex<Option<SocketAddr>>,
    transition: Mutex<Bound>,
}

impl PrimaryOnlyService {
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

    fn spawn_rejecting(&self, listener: SharedListener) -> RunningLoop {
        let (handle, signal) = shutdown_signal();
        RunningLoop::new(handle, spawn_rejecting(self.name.clone(), listener, signal))
    }

    fn spawn_endpoint(&self, listener: SharedListener) -> RunningLoop {
        let (handle, signal) = shutdown_signal();
        let endpoint = self.endpoint.clone();
        let role = self.role.clone();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = endpoint.serve(listener, role, signal).await {
                tracing::error!(service = %name, error = %e, "Endpoint failed");
            }
        });
        RunningLoop::new(handle, task)
    }

    fn set_bound_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut bound) = self.bound_addr.lock() {
            *bound = addr;
        }
    }
}

#[async_trait]
impl HaService for PrimaryOnlyService {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> HaMode {
        HaMode::PrimaryOnly
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
            return Err(self.invalid("start", "rejecting server must not be running"));
        }

        let listener = SharedListener::bind(self.addr).await.map_err(|source| HaError::Bind {
            service: self.name.clone(),
            addr: self.addr,
            source,
        })?;
        let local = listener.local_addr().ok();
        bound.running = Some(self.spawn_rejecting(listener.clone()));
        bound.listener = Some(listener);
        self.set_bound_addr(local);
        self.state.set(ServiceState::BoundStandby);
        info!(service = %self.name, addr = ?local, "Bound standby (rejecting)");
        Ok(())
    }

    async fn promote(&self) -> Result<(), HaError> {
        let mut bound = self.transition.lock().await;
        match self.state.get() {
            ServiceState::Serving => return Ok(()),
            ServiceState::Stopped => return Err(self.invalid("promote", "service is not started")),
            ServiceState::BoundStandby => {}
        }
        let Some(listener) = bound.listener.clone() else {
            return Err(self.invalid("promote", "service is not started"));
        };

        if let Some(rejecting) = bound.running.take() {
            rejecting.stop(&self.name, self.stop_grace).await;
        }
        self.role.set_primary(true);
        bound.running = Some(self.spawn_endpoint(listener));
        self.state.set(ServiceState::Serving);
        info!(service = %self.name, "Promoted to primary");
        Ok(())
    }

    async fn demote(&self) -> Result<(), HaError> {
        let mut bound = self.transition.lock().await;
        match self.state.get() {
            ServiceState::BoundStandby => return Ok(()),
            ServiceState::Stopped => return Err(self.invalid("demote", "service is not started")),
            ServiceState::Serving => {}
        }
        let Some(listener) = bound.listener.clone() else {
            return Err(self.invalid("demote", "service is not started"));
        };

        self.role.set_primary(false);
        if let Some(serving) = bound.running.take() {
            serving.stop(&self.name, self.stop_grace).await;
        }
        bound.running = Some(self.spawn_rejecting(listener));
        self.state.set(ServiceState::BoundStandby);
        info!(service = %self.name, "Demoted to standby");
        Ok(())
    }

    async fn stop(&self) -> Result<(), HaError> {
        let mut bound = self.transition.lock().await;
        if let Some(running) = bound.running.take() {
            running.stop(&self.name, self.stop_grace).await;
        }
        if bound.listener.take().is_some() {
            info!(service = %self.name, "Released port");
        }
        self.role.set_primary(false);
        self.set_bound_addr(None);
        self.state.set(ServiceState::Stopped);
        Ok(())
    }
}
