//! Built-in `block-report` plugin: samples the block store on an interval.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::rpc::{encode, RpcError, RpcService, RpcServiceMap};
use crate::server::{shutdown_signal, ShutdownHandle};
use crate::worker::plugin::{PluginContext, PluginError, WorkerFactory};
use crate::worker::{BlockStore, Worker, WorkerError};

/// One sample of the block store.
#[derive(Debug, Clone, Serialize)]
pub struct BlockReport {
    pub block_count: usize,
    pub total_bytes: u64,
    pub sampled_at_ms: u64,
}

impl BlockReport {
    fn sample(store: &BlockStore) -> Self {
        Self {
            block_count: store.len(),
            total_bytes: store.total_bytes(),
            sampled_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

type LastReport = Arc<Mutex<Option<BlockReport>>>;

pub struct BlockReportFactory;

impl WorkerFactory for BlockReportFactory {
    fn identifier(&self) -> &'static str {
        "block-report"
    }

    fn create(
        &self,
        _core: &[Arc<dyn Worker>],
        context: &PluginContext,
    ) -> Result<Option<Arc<dyn Worker>>, PluginError> {
        Ok(Some(Arc::new(BlockReportWorker::new(context.clone()))))
    }
}

pub struct BlockReportWorker {
    context: PluginContext,
    last: LastReport,
    running: Mutex<Option<(ShutdownHandle, JoinHandle<()>)>>,
}

impl BlockReportWorker {
    pub fn new(context: PluginContext) -> Self {
        Self {
            context,
            last: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn last_report(&self) -> Option<BlockReport> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    fn is_started(&self) -> bool {
        self.running.lock().map(|running| running.is_some()).unwrap_or(false)
    }
}

#[async_trait]
impl Worker for BlockReportWorker {
    fn name(&self) -> &str {
        "block-report"
    }

    async fn start(&self) -> Result<(), WorkerError> {
        let Ok(mut running) = self.running.lock() else {
            return Ok(());
        };
        if running.is_some() {
            return Ok(());
        }

        let (handle, mut shutdown) = shutdown_signal();
        let blocks = self.context.blocks.clone();
        let gauge = self.context.metrics.blocks_cached.clone();
        let last = self.last.clone();
        let mut ticker = tokio::time::interval(self.context.report_interval);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticker.tick() => {
                        let report = BlockReport::sample(&blocks);
                        gauge.set(report.block_count as i64);
                        debug!(
                            blocks = report.block_count,
                            bytes = report.total_bytes,
                            "Block report"
                        );
                        if let Ok(mut last) = last.lock() {
                            *last = Some(report);
                        }
                    }
                }
            }
        });
        *running = Some((handle, task));
        info!(
            interval_ms = self.context.report_interval.as_millis() as u64,
            "Block report plugin started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        let running = self.running.lock().ok().and_then(|mut running| running.take());
        if let Some((handle, task)) = running {
            handle.trigger();
            let _ = task.await;
            info!("Block report plugin stopped");
        }
        Ok(())
    }

    fn services(&self) -> Result<RpcServiceMap, WorkerError> {
        if !self.is_started() {
            return Err(WorkerError::NotStarted(self.name().to_string()));
        }
        let mut services = RpcServiceMap::new();
        services.insert(
            "block_report".to_string(),
            Arc::new(BlockReportService {
                last: self.last.clone(),
            }),
        );
        Ok(services)
    }
}

/// RPC service `block_report`: `last`.
struct BlockReportService {
    last: LastReport,
}

#[async_trait]
impl RpcService for BlockReportService {
    async fn call(&self, method: &str, _payload: Value) -> Result<Value, RpcError> {
        match method {
            "last" => {
                let last = self.last.lock().ok().and_then(|last| last.clone());
                encode(&last)
            }
            other => Err(RpcError::unknown_method("block_report", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::metrics::MetricsSystem;
    use crate::worker::WorkerContext;
    use bytes::Bytes;
    use std::time::Duration;

    fn plugin() -> (BlockReportWorker, Arc<BlockStore>) {
        let blocks = Arc::new(BlockStore::new());
        let config = PluginConfig {
            block_report_interval_ms: 10,
            ..PluginConfig::default()
        };
        let context = PluginContext::new(
            Arc::new(WorkerContext::new()),
            Arc::new(MetricsSystem::new("worker").unwrap()),
            blocks.clone(),
            &config,
        );
        (BlockReportWorker::new(context), blocks)
    }

    #[tokio::test]
    async fn test_services_unavailable_before_start() {
        let (worker, _) = plugin();
        assert!(matches!(worker.services(), Err(WorkerError::NotStarted(_))));
    }

    #[tokio::test]
    async fn test_reports_block_store_after_start() {
        let (worker, blocks) = plugin();
        blocks.put_block(1, Bytes::from_static(b"12345"));
        worker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = worker.last_report().unwrap();
        assert_eq!(report.block_count, 1);
        assert_eq!(report.total_bytes, 5);

        let service = worker.services().unwrap().remove("block_report").unwrap();
        let last = service.call("last", Value::Null).await.unwrap();
        assert_eq!(last["block_count"], 1);

        worker.stop().await.unwrap();
        worker.stop().await.unwrap();
        assert!(worker.services().is_err());
    }
}
