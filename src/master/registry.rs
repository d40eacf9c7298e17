//! Registered workers, as tracked by the master.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::info;

use crate::master::RegisterWorkerRequest;
use crate::worker::{WorkerDescriptor, WorkerId, WorkerNetAddress};

#[derive(Debug, Default)]
struct Members {
    next_id: WorkerId,
    by_address: HashMap<WorkerNetAddress, WorkerId>,
    workers: BTreeMap<WorkerId, WorkerDescriptor>,
}

/// Assigns worker ids. Ids grow monotonically from 1; a worker re-registering
/// with an identical address keeps its id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    members: Mutex<Members>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request: RegisterWorkerRequest) -> WorkerId {
        let mut guard = self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let members = &mut *guard;

        let id = match members.by_address.get(&request.address) {
            Some(id) => *id,
            None => {
                members.next_id += 1;
                members.by_address.insert(request.address.clone(), members.next_id);
                members.next_id
            }
        };
        info!(worker_id = id, address = %request.address, "Worker registered");
        members.workers.insert(
            id,
            WorkerDescriptor {
                id,
                address: request.address,
                start_time_ms: request.start_time_ms,
            },
        );
        id
    }

    /// Registered workers in id order.
    pub fn workers(&self) -> Vec<WorkerDescriptor> {
        self.members
            .lock()
            .map(|members| members.workers.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: &str, start: u64) -> RegisterWorkerRequest {
        RegisterWorkerRequest {
            address: WorkerNetAddress::new(host, 1, 2, 3),
            start_time_ms: start,
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_stable_per_address() {
        let registry = WorkerRegistry::new();
        let a = registry.register(request("a", 1));
        let b = registry.register(request("b", 1));
        assert_eq!((a, b), (1, 2));

        // Restarted worker on the same address keeps its id.
        assert_eq!(registry.register(request("a", 50)), 1);

        let workers = registry.workers();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].start_time_ms, 50);
    }
}
