//! Worker identity: network address, descriptor and the process-wide context.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::worker::WorkerError;

/// Identity assigned by the master at registration.
pub type WorkerId = u64;

/// Where a worker can be reached. Built once, after every port is final.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerNetAddress {
    host: String,
    rpc_port: u16,
    data_port: u16,
    web_port: u16,
}

impl WorkerNetAddress {
    pub fn new(host: impl Into<String>, rpc_port: u16, data_port: u16, web_port: u16) -> Self {
        Self {
            host: host.into(),
            rpc_port,
            data_port,
            web_port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn web_port(&self) -> u16 {
        self.web_port
    }

    /// Resolve the data-transfer endpoint.
    pub fn data_socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.data_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve {}", self.host),
                )
            })
    }
}

impl fmt::Display for WorkerNetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(rpc={}, data={}, web={})",
            self.host, self.rpc_port, self.data_port, self.web_port
        )
    }
}

/// A registered worker as the master knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    #[serde(flatten)]
    pub address: WorkerNetAddress,
    pub start_time_ms: u64,
}

/// Facts about the running worker that subsystems read but never change.
///
/// The net address and worker id are each written exactly once; a second write
/// is an error rather than an overwrite.
#[derive(Debug)]
pub struct WorkerContext {
    started: Instant,
    start_time_ms: u64,
    net_address: OnceLock<WorkerNetAddress>,
    worker_id: OnceLock<WorkerId>,
}

impl WorkerContext {
    pub fn new() -> Self {
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            started: Instant::now(),
            start_time_ms,
            net_address: OnceLock::new(),
            worker_id: OnceLock::new(),
        }
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn publish_net_address(&self, address: WorkerNetAddress) -> Result<(), WorkerError> {
        self.net_address
            .set(address)
            .map_err(|_| WorkerError::NetAddressAlreadyPublished)
    }

    pub fn net_address(&self) -> Option<&WorkerNetAddress> {
        self.net_address.get()
    }

    /// The published net address, or `NetAddressUnpublished`.
    pub fn require_net_address(&self) -> Result<&WorkerNetAddress, WorkerError> {
        self.net_address.get().ok_or(WorkerError::NetAddressUnpublished)
    }

    pub fn assign_worker_id(&self, id: WorkerId) -> Result<(), WorkerError> {
        if let Some(existing) = self.worker_id.get() {
            if *existing == id {
                return Ok(());
            }
            return Err(WorkerError::WorkerIdAlreadyAssigned { existing: *existing, id });
        }
        self.worker_id
            .set(id)
            .map_err(|_| WorkerError::WorkerIdAlreadyAssigned { existing: id, id })
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id.get().copied()
    }

    /// Full descriptor once both the address and the id are known.
    pub fn descriptor(&self) -> Option<WorkerDescriptor> {
        Some(WorkerDescriptor {
            id: self.worker_id()?,
            address: self.net_address()?.clone(),
            start_time_ms: self.start_time_ms,
        })
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_address_published_once() {
        let context = WorkerContext::new();
        assert!(matches!(context.require_net_address(), Err(WorkerError::NetAddressUnpublished)));

        context
            .publish_net_address(WorkerNetAddress::new("localhost", 1, 2, 3))
            .unwrap();
        let again = context.publish_net_address(WorkerNetAddress::new("other", 4, 5, 6));
        assert!(matches!(again, Err(WorkerError::NetAddressAlreadyPublished)));
        assert_eq!(context.require_net_address().unwrap().host(), "localhost");
    }

    #[test]
    fn test_worker_id_assigned_once() {
        let context = WorkerContext::new();
        assert!(context.descriptor().is_none());

        context.assign_worker_id(11).unwrap();
        context.assign_worker_id(11).unwrap();
        assert!(context.assign_worker_id(12).is_err());
        assert_eq!(context.worker_id(), Some(11));
    }

    #[test]
    fn test_descriptor_serializes_flat() {
        let descriptor = WorkerDescriptor {
            id: 3,
            address: WorkerNetAddress::new("h", 10, 11, 12),
            start_time_ms: 99,
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["host"], "h");
        assert_eq!(json["data_port"], 11);
        assert_eq!(json["id"], 3);
    }
}
