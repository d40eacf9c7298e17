//! The worker process and the subsystems it runs.
//!
//! - [`address`]: net address, descriptor and the write-once worker context
//! - [`block`]: in-memory block store and the block worker
//! - [`file`]: filesystem worker fronting the UFS through the absent-path cache
//! - [`plugin`]: identifier-keyed registry of optional worker factories
//! - [`block_report`]: built-in plugin sampling the block store
//! - [`process`]: `WorkerProcess`, which starts and stops all of the above in order

pub mod address;
pub mod block;
pub mod block_report;
pub mod file;
pub mod plugin;
pub mod process;

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::ha::HaError;
use crate::master::RegistrationError;
use crate::rpc::{MultiplexError, RpcServiceMap};
use crate::transfer::TransferError;

pub use address::{WorkerContext, WorkerDescriptor, WorkerId, WorkerNetAddress};
pub use block::{BlockStore, BlockWorker};
pub use file::FileSystemWorker;
pub use plugin::{PluginContext, PluginError, PluginRegistry, WorkerFactory};
pub use process::WorkerProcess;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("net address has not been published")]
    NetAddressUnpublished,

    #[error("net address is already published")]
    NetAddressAlreadyPublished,

    #[error("worker id {existing} already assigned, refusing {id}")]
    WorkerIdAlreadyAssigned { existing: WorkerId, id: WorkerId },

    #[error("{0} has not been started")]
    NotStarted(String),

    #[error("worker process has been stopped")]
    Stopped,

    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Ha(#[from] HaError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Multiplex(#[from] MultiplexError),

    #[error("data server: {0}")]
    Transfer(#[from] TransferError),

    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A subsystem run by the worker process.
///
/// `start` and `stop` may each be called more than once; repeats are no-ops.
/// `services` may only be relied on after `start` has returned.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), WorkerError>;

    async fn stop(&self) -> Result<(), WorkerError>;

    /// RPC services this worker contributes, keyed by service name.
    fn services(&self) -> Result<RpcServiceMap, WorkerError>;
}
