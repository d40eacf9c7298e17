//! The worker process: builds every subsystem, then starts and stops them in a
//! fixed order.
//!
//! Start order: metrics, web endpoint (metrics handler mounted first), net
//! address publication, block worker, file system worker, plugins in configured
//! order, then the RPC endpoint. `start` then parks until `stop`.
//!
//! Stop order: RPC endpoint, data server, plugins in reverse, file system
//! worker, block worker, web endpoint, metrics. Each step is best-effort; a
//! failure is logged and the rest still runs.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::ha::{self, HaService, RouterEndpoint, ServiceState};
use crate::master::{HttpMasterClient, MasterClient, MasterRegistrationClient};
use crate::metrics::MetricsSystem;
use crate::retry::RetryPolicy;
use crate::rpc::RpcMultiplexer;
use crate::server::web::{self, WebState};
use crate::transfer::DataServer;
use crate::ufs::UfsRegistry;
use crate::worker::{
    BlockStore, BlockWorker, FileSystemWorker, PluginContext, PluginRegistry, Worker,
    WorkerContext, WorkerError, WorkerNetAddress,
};

const MASTER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WorkerProcess {
    /// Configuration with every port resolved.
    config: Config,
    context: Arc<WorkerContext>,
    metrics: Arc<MetricsSystem>,
    blocks: Arc<BlockStore>,
    web: Arc<dyn HaService>,
    data_server: DataServer,
    block_worker: Arc<BlockWorker>,
    fs_worker: Arc<FileSystemWorker>,
    plugins: Vec<Arc<dyn Worker>>,
    rpc: Mutex<Option<Arc<dyn HaService>>>,
    shutdown: watch::Sender<bool>,
    /// Held by `start` until every subsystem is up; `stop` waits for it.
    starting: Mutex<()>,
    stopped: Mutex<bool>,
}

impl WorkerProcess {
    /// Build a worker that registers over HTTP and uses the built-in UFS
    /// connectors and plugins.
    pub async fn from_config(config: Config) -> Result<Self, WorkerError> {
        let master = Arc::new(HttpMasterClient::new(
            &config.master.address,
            MASTER_REQUEST_TIMEOUT,
        )?);
        Self::new(
            config,
            master,
            &UfsRegistry::with_builtin(),
            &PluginRegistry::with_builtin(),
        )
        .await
    }

    /// Build every subsystem. Ports configured as 0 are resolved here and
    /// written back into the configuration.
    ///
    /// Any failure drops everything built so far; nothing is left serving.
    pub async fn new(
        mut config: Config,
        master: Arc<dyn MasterClient>,
        ufs: &UfsRegistry,
        plugin_registry: &PluginRegistry,
    ) -> Result<Self, WorkerError> {
        let host = config.worker.host.clone();
        let metrics = Arc::new(MetricsSystem::new("worker")?);
        let context = Arc::new(WorkerContext::new());
        let blocks = Arc::new(BlockStore::new());

        let data_server = DataServer::bind(
            socket_addr(&host, config.worker.data_port)?,
            blocks.clone(),
            config.client.chunk_size_bytes,
            Some(metrics.data_bytes_served.clone()),
        )
        .await?;
        config.worker.data_port = data_server.port();
        let [rpc_port, web_port] =
            resolve_ports(&host, [config.worker.rpc_port, config.worker.web_port])?;
        config.worker.rpc_port = rpc_port;
        config.worker.web_port = web_port;
        info!(
            host = %host,
            rpc_port = config.worker.rpc_port,
            data_port = config.worker.data_port,
            web_port = config.worker.web_port,
            "Resolved worker ports"
        );

        let web_router = web::build_router(
            &metrics,
            Arc::new(WebState {
                context: context.clone(),
                blocks: blocks.clone(),
            }),
        );
        let web = ha::create(
            config.ha.web_mode,
            "web",
            socket_addr(&host, config.worker.web_port)?,
            Arc::new(RouterEndpoint::new("web", web_router)),
            config.ha.stop_grace(),
        );

        let registration = Arc::new(MasterRegistrationClient::new(
            master,
            RetryPolicy::from(&config.master),
        ));
        let block_worker = Arc::new(BlockWorker::new(
            context.clone(),
            blocks.clone(),
            registration,
        ));
        let fs_worker = Arc::new(FileSystemWorker::new(
            ufs.create(&config.ufs.root)?,
            &config.ufs,
            metrics.clone(),
        ));

        let core: Vec<Arc<dyn Worker>> = vec![block_worker.clone(), fs_worker.clone()];
        let plugin_context = PluginContext::new(
            context.clone(),
            metrics.clone(),
            blocks.clone(),
            &config.plugins,
        );
        let plugins = plugin_registry.instantiate(&config.plugins.enabled, &core, &plugin_context)?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            context,
            metrics,
            blocks,
            web,
            data_server,
            block_worker,
            fs_worker,
            plugins,
            rpc: Mutex::new(None),
            shutdown,
            starting: Mutex::new(()),
            stopped: Mutex::new(false),
        })
    }

    /// Start every subsystem, then block until [`stop`](Self::stop) is called.
    ///
    /// A `stop` that arrives mid-startup makes this return
    /// [`WorkerError::Stopped`] once the step in progress finishes; `stop` then
    /// tears down whatever had already started.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut shutdown = self.shutdown.subscribe();
        {
            let _starting = self.starting.lock().await;
            if let Err(e) = self.start_subsystems().await {
                if self.is_stopping() {
                    debug!(error = %e, "Startup interrupted by stop");
                    return Err(WorkerError::Stopped);
                }
                return Err(e);
            }
        }

        info!(
            worker_id = ?self.context.worker_id(),
            address = %self.net_address(),
            plugins = self.plugins.len(),
            "Worker started"
        );
        let _ = shutdown.wait_for(|stopped| *stopped).await;
        debug!("Worker start returning after stop");
        Ok(())
    }

    async fn start_subsystems(&self) -> Result<(), WorkerError> {
        self.ensure_running()?;
        self.metrics.start();
        self.web.start().await?;
        self.ensure_running()?;
        self.web.promote().await?;
        self.ensure_running()?;

        self.context.publish_net_address(self.net_address())?;
        self.block_worker.start().await?;
        self.ensure_running()?;
        self.fs_worker.start().await?;
        for plugin in &self.plugins {
            self.ensure_running()?;
            plugin.start().await?;
        }
        self.ensure_running()?;

        let rpc = self.build_rpc()?;
        *self.rpc.lock().await = Some(rpc.clone());
        rpc.start().await?;
        rpc.promote().await?;
        Ok(())
    }

    /// Stop every subsystem. Safe to call repeatedly and concurrently; only the
    /// first call does any work and later calls wait for it. A startup in
    /// progress is interrupted at its next step and waited for.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(());
        }
        *stopped = true;
        self.shutdown.send_replace(true);
        info!("Stopping worker");
        let _starting = self.starting.lock().await;

        if let Some(rpc) = self.rpc.lock().await.take() {
            if let Err(e) = rpc.stop().await {
                error!(error = %e, "Failed to stop RPC endpoint");
            }
        }
        self.close_data_server().await;

        for plugin in self.plugins.iter().rev() {
            if let Err(e) = plugin.stop().await {
                error!(plugin = plugin.name(), error = %e, "Failed to stop plugin");
            }
        }
        if let Err(e) = self.fs_worker.stop().await {
            error!(error = %e, "Failed to stop file system worker");
        }
        if let Err(e) = self.block_worker.stop().await {
            error!(error = %e, "Failed to stop block worker");
        }
        if let Err(e) = self.web.stop().await {
            error!(error = %e, "Failed to stop web endpoint");
        }
        self.metrics.stop();

        info!("Worker stopped");
        Ok(())
    }

    async fn close_data_server(&self) {
        let max_attempts = self.config.worker.data_close_max_attempts;
        let closed = close_until_closed(
            || self.data_server.close(),
            || self.data_server.is_closed(),
            max_attempts,
            self.config.worker.data_close_retry_interval(),
        )
        .await;
        match closed {
            Some(attempt) => debug!(attempt, "Data server closed"),
            None => error!(
                attempts = max_attempts,
                "Data server did not close, continuing shutdown"
            ),
        }
    }

    fn build_rpc(&self) -> Result<Arc<dyn HaService>, WorkerError> {
        let mut mux = RpcMultiplexer::new();
        let core: [Arc<dyn Worker>; 2] = [self.block_worker.clone(), self.fs_worker.clone()];
        for worker in core.iter().chain(self.plugins.iter()) {
            mux.register(worker.name(), worker.services()?)?;
        }
        let router = mux.into_router(
            self.config.worker.rpc_max_concurrency,
            Some(self.metrics.rpc_requests.clone()),
        );
        Ok(ha::create(
            self.config.ha.rpc_mode,
            "rpc",
            socket_addr(&self.config.worker.host, self.config.worker.rpc_port)?,
            Arc::new(RouterEndpoint::new("rpc", router)),
            self.config.ha.stop_grace(),
        ))
    }

    fn ensure_running(&self) -> Result<(), WorkerError> {
        if self.is_stopping() {
            return Err(WorkerError::Stopped);
        }
        Ok(())
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Host and resolved ports, as advertised to the master.
    pub fn net_address(&self) -> WorkerNetAddress {
        WorkerNetAddress::new(
            self.config.worker.host.clone(),
            self.config.worker.rpc_port,
            self.config.worker.data_port,
            self.config.worker.web_port,
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    pub fn metrics(&self) -> &Arc<MetricsSystem> {
        &self.metrics
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    pub fn block_worker(&self) -> &Arc<BlockWorker> {
        &self.block_worker
    }

    pub fn file_system(&self) -> &Arc<FileSystemWorker> {
        &self.fs_worker
    }

    pub fn plugins(&self) -> &[Arc<dyn Worker>] {
        &self.plugins
    }

    pub fn web_state(&self) -> ServiceState {
        self.web.state()
    }

    pub async fn rpc_state(&self) -> ServiceState {
        match self.rpc.lock().await.as_ref() {
            Some(rpc) => rpc.state(),
            None => ServiceState::Stopped,
        }
    }

    pub fn is_data_server_closed(&self) -> bool {
        self.data_server.is_closed()
    }
}

fn socket_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))
}

/// Turn each port 0 into a distinct free port. Every temporary listener stays open
/// until all ports are chosen, so no two resolve to the same port.
fn resolve_ports<const N: usize>(host: &str, ports: [u16; N]) -> io::Result<[u16; N]> {
    let mut held = Vec::new();
    let mut resolved = ports;
    for port in resolved.iter_mut().filter(|port| **port == 0) {
        let listener = std::net::TcpListener::bind(socket_addr(host, 0)?)?;
        *port = listener.local_addr()?.port();
        held.push(listener);
    }
    Ok(resolved)
}

/// Call `close` until `is_closed` confirms it, at most `max_attempts` times
/// with `interval` between tries. Returns the attempt that confirmed the
/// close, or `None` if it never did.
async fn close_until_closed(
    close: impl Fn(),
    is_closed: impl Fn() -> bool,
    max_attempts: u32,
    interval: Duration,
) -> Option<u32> {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        close();
        if is_closed() {
            return Some(attempt);
        }
        tokio::time::sleep(interval).await;
    }
    is_closed().then_some(max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_resolve_ports_keeps_fixed_and_assigns_distinct() {
        let [fixed, a, b] = resolve_ports("127.0.0.1", [4321, 0, 0]).unwrap();
        assert_eq!(fixed, 4321);
        assert!(a != 0 && b != 0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_close_loop_retries_until_confirmed() {
        let closes = AtomicU32::new(0);
        let closed = close_until_closed(
            || {
                closes.fetch_add(1, Ordering::SeqCst);
            },
            || closes.load(Ordering::SeqCst) >= 3,
            10,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(closed, Some(3));
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_loop_gives_up_after_max_attempts() {
        let closes = AtomicU32::new(0);
        let closed = close_until_closed(
            || {
                closes.fetch_add(1, Ordering::SeqCst);
            },
            || false,
            4,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(closed, None);
        assert_eq!(closes.load(Ordering::SeqCst), 4);
    }
}
