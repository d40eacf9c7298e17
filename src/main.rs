//! tiercache binary: runs a worker or the membership master.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use tiercache::config::{Cli, Config, HaMode, Role};
use tiercache::ha::{self, RouterEndpoint};
use tiercache::master::{self, WorkerRegistry};
use tiercache::worker::{WorkerError, WorkerProcess};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "tiercache=debug,tower_http=debug"
    } else {
        "tiercache=info,tower_http=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("tiercache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    match cli.role {
        Role::Worker => run_worker(config).await,
        Role::Master => run_master(config).await,
    }
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    info!(
        host = %config.worker.host,
        ufs_root = %config.ufs.root,
        master = %config.master.address,
        "Configuration loaded"
    );

    // Construction failures are fatal: nothing has started serving yet.
    let worker = Arc::new(
        WorkerProcess::from_config(config)
            .await
            .context("failed to construct worker")?,
    );

    let stopper = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            if let Err(e) = stopper.stop().await {
                error!(error = %e, "Worker stop failed");
            }
        }
    });

    match worker.start().await {
        Ok(()) | Err(WorkerError::Stopped) => Ok(()),
        Err(e) => {
            error!(error = %e, "Worker failed to start");
            let _ = worker.stop().await;
            Err(e).context("worker startup aborted")
        }
    }
}

async fn run_master(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .master
        .listen
        .parse()
        .with_context(|| format!("invalid master listen address {}", config.master.listen))?;

    let registry = Arc::new(WorkerRegistry::new());
    let endpoint = Arc::new(RouterEndpoint::new("master", master::build_router(registry)));
    let service = ha::create(HaMode::PrimaryOnly, "master", addr, endpoint, config.ha.stop_grace());

    service.start().await?;
    service.promote().await?;
    info!(addr = ?service.local_addr(), "Master serving");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    service.stop().await?;
    Ok(())
}
