//! In-memory block store and the block worker that advertises it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::master::MasterRegistrationClient;
use crate::rpc::{decode, encode, RpcError, RpcService, RpcServiceMap};
use crate::worker::{Worker, WorkerContext, WorkerError};

/// Blocks held by this worker, keyed by block id.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: RwLock<HashMap<u64, Bytes>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a block.
    pub fn put_block(&self, block_id: u64, data: Bytes) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(block_id, data);
        }
    }

    /// A cheap handle to the block's bytes.
    pub fn get_block(&self, block_id: u64) -> Option<Bytes> {
        self.blocks.read().ok()?.get(&block_id).cloned()
    }

    pub fn remove_block(&self, block_id: u64) -> Option<Bytes> {
        self.blocks.write().ok()?.remove(&block_id)
    }

    /// Block ids in ascending order.
    pub fn block_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .blocks
            .read()
            .map(|blocks| blocks.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|blocks| blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.blocks
            .read()
            .map(|blocks| blocks.values().map(|b| b.len() as u64).sum())
            .unwrap_or(0)
    }
}

/// Owns the block store and registers the worker with the master on start.
pub struct BlockWorker {
    context: Arc<WorkerContext>,
    store: Arc<BlockStore>,
    registration: Arc<MasterRegistrationClient>,
    started: AtomicBool,
}

impl BlockWorker {
    pub fn new(
        context: Arc<WorkerContext>,
        store: Arc<BlockStore>,
        registration: Arc<MasterRegistrationClient>,
    ) -> Self {
        Self {
            context,
            store,
            registration,
            started: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Worker for BlockWorker {
    fn name(&self) -> &str {
        "block"
    }

    async fn start(&self) -> Result<(), WorkerError> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let address = self.context.require_net_address()?;
        let id = self
            .registration
            .register(address, self.context.start_time_ms())
            .await?;
        self.context.assign_worker_id(id)?;
        self.started.store(true, Ordering::Release);
        info!(worker_id = id, %address, blocks = self.store.len(), "Block worker started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        if self.started.swap(false, Ordering::AcqRel) {
            info!("Block worker stopped");
        }
        Ok(())
    }

    fn services(&self) -> Result<RpcServiceMap, WorkerError> {
        let mut services = RpcServiceMap::new();
        services.insert(
            "block".to_string(),
            Arc::new(BlockService {
                store: self.store.clone(),
            }),
        );
        Ok(services)
    }
}

#[derive(Debug, Deserialize)]
struct BlockIdArg {
    block_id: u64,
}

#[derive(Debug, Serialize)]
struct BlockInfo {
    block_id: u64,
    length: u64,
}

/// RPC service `block`: `list`, `info`, `remove`.
struct BlockService {
    store: Arc<BlockStore>,
}

#[async_trait]
impl RpcService for BlockService {
    async fn call(&self, method: &str, payload: Value) -> Result<Value, RpcError> {
        match method {
            "list" => encode(&self.store.block_ids()),
            "info" => {
                let BlockIdArg { block_id } = decode(payload)?;
                let block = self
                    .store
                    .get_block(block_id)
                    .ok_or_else(|| RpcError::NotFound(format!("block {block_id}")))?;
                encode(&BlockInfo {
                    block_id,
                    length: block.len() as u64,
                })
            }
            "remove" => {
                let BlockIdArg { block_id } = decode(payload)?;
                let removed = self.store.remove_block(block_id).is_some();
                Ok(json!({ "removed": removed }))
            }
            other => Err(RpcError::unknown_method("block", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{MasterClient, RegisterWorkerRequest, RegistrationError};
    use crate::retry::RetryPolicy;
    use crate::worker::WorkerNetAddress;
    use std::time::Duration;

    struct FixedMaster(u64);

    #[async_trait]
    impl MasterClient for FixedMaster {
        async fn register_worker(
            &self,
            _request: &RegisterWorkerRequest,
        ) -> Result<u64, RegistrationError> {
            Ok(self.0)
        }
    }

    fn block_worker(context: Arc<WorkerContext>) -> BlockWorker {
        let registration = Arc::new(MasterRegistrationClient::new(
            Arc::new(FixedMaster(5)),
            RetryPolicy::new(1, Duration::ZERO, Duration::ZERO),
        ));
        BlockWorker::new(context, Arc::new(BlockStore::new()), registration)
    }

    #[test]
    fn test_store_basics() {
        let store = BlockStore::new();
        store.put_block(2, Bytes::from_static(b"bb"));
        store.put_block(1, Bytes::from_static(b"a"));
        assert_eq!(store.block_ids(), vec![1, 2]);
        assert_eq!(store.total_bytes(), 3);
        assert_eq!(store.remove_block(1).unwrap(), Bytes::from_static(b"a"));
        assert!(store.get_block(1).is_none());
    }

    #[tokio::test]
    async fn test_start_requires_published_address() {
        let context = Arc::new(WorkerContext::new());
        let worker = block_worker(context.clone());

        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, WorkerError::NetAddressUnpublished));

        context
            .publish_net_address(WorkerNetAddress::new("127.0.0.1", 1, 2, 3))
            .unwrap();
        worker.start().await.unwrap();
        assert_eq!(context.worker_id(), Some(5));
    }

    #[tokio::test]
    async fn test_block_service_methods() {
        let worker = block_worker(Arc::new(WorkerContext::new()));
        worker.store().put_block(9, Bytes::from_static(b"nine"));
        let service = worker.services().unwrap().remove("block").unwrap();

        assert_eq!(service.call("list", Value::Null).await.unwrap(), json!([9]));
        let info = service.call("info", json!({"block_id": 9})).await.unwrap();
        assert_eq!(info["length"], 4);
        assert!(matches!(
            service.call("info", json!({"block_id": 1})).await,
            Err(RpcError::NotFound(_))
        ));
        let removed = service.call("remove", json!({"block_id": 9})).await.unwrap();
        assert_eq!(removed["removed"], true);
        assert!(matches!(
            service.call("compact", Value::Null).await,
            Err(RpcError::UnknownMethod { .. })
        ));
    }
}
