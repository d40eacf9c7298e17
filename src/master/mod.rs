//! Worker membership on the master and the worker's registration client.
//!
//! - [`client`]: `MasterClient` transport, its HTTP implementation, and the
//!   retrying once-per-process `MasterRegistrationClient`
//! - [`registry`]: the master's table of registered workers
//! - [`http`]: the master's HTTP routes

pub mod client;
pub mod http;
pub mod registry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::{WorkerId, WorkerNetAddress};

pub use client::{HttpMasterClient, MasterClient, MasterRegistrationClient};
pub use http::build_router;
pub use registry::WorkerRegistry;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("master unreachable: {0}")]
    Unreachable(String),

    #[error("master rejected registration ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl RegistrationError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistrationError::Unreachable(_) => true,
            RegistrationError::Rejected { status, .. } => *status >= 500,
            RegistrationError::Exhausted { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    #[serde(flatten)]
    pub address: WorkerNetAddress,
    pub start_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: WorkerId,
}
