//! Filesystem worker: existence checks against the UFS, short-circuited by the
//! absent-path cache.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cache::{self, AbsentCacheOptions, AbsentPathCache};
use crate::config::UfsConfig;
use crate::metrics::MetricsSystem;
use crate::rpc::{decode, RpcError, RpcService, RpcServiceMap};
use crate::ufs::{normalize, UnderFileSystem};
use crate::worker::{Worker, WorkerError};

/// The UFS plus the absent-path cache in front of it, shared with the RPC service.
struct Existence {
    ufs: Arc<dyn UnderFileSystem>,
    absent: Arc<dyn AbsentPathCache>,
    metrics: Arc<MetricsSystem>,
}

impl Existence {
    async fn exists(&self, path: &str) -> io::Result<bool> {
        // The check below answers a miss, so no background verification is queued.
        if self.absent.is_known_absent(path) {
            self.metrics.absent_cache_hits.inc();
            debug!(path, "Absent-path cache hit");
            return Ok(false);
        }
        self.check(path).await
    }

    async fn check(&self, path: &str) -> io::Result<bool> {
        let path = normalize(path);
        self.metrics.ufs_existence_checks.inc();
        let token = self.absent.begin_observation();
        let exists = self.ufs.exists(&path).await?;
        if exists {
            self.absent.process_existence(&path);
        } else {
            self.absent.add_single_path_since(&path, token);
        }
        Ok(exists)
    }
}

pub struct FileSystemWorker {
    existence: Arc<Existence>,
    started: AtomicBool,
}

impl FileSystemWorker {
    /// Build the worker and its absent-path cache. Must run inside a Tokio runtime
    /// when the cache is enabled.
    pub fn new(
        ufs: Arc<dyn UnderFileSystem>,
        config: &UfsConfig,
        metrics: Arc<MetricsSystem>,
    ) -> Self {
        let options = AbsentCacheOptions::from(config);
        let absent = cache::create(config.absent_cache_threads, ufs.clone(), options);
        Self {
            existence: Arc::new(Existence { ufs, absent, metrics }),
            started: AtomicBool::new(false),
        }
    }

    pub fn absent_cache(&self) -> &Arc<dyn AbsentPathCache> {
        &self.existence.absent
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether `path` exists, answering "no" straight from the absent-path cache
    /// when it can.
    pub async fn exists(&self, path: &str) -> io::Result<bool> {
        self.existence.exists(path).await
    }

    /// Ask the UFS directly, bypassing the cache, and record what it says.
    pub async fn check(&self, path: &str) -> io::Result<bool> {
        self.existence.check(path).await
    }

    /// Record an existence observation made elsewhere, e.g. a completed write.
    pub fn mark_exists(&self, path: &str) {
        self.existence.absent.process_existence(path);
    }
}

#[async_trait]
impl Worker for FileSystemWorker {
    fn name(&self) -> &str {
        "file_system"
    }

    async fn start(&self) -> Result<(), WorkerError> {
        if !self.started.swap(true, Ordering::AcqRel) {
            info!(absent_cache = ?self.existence.absent.kind(), "File system worker started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkerError> {
        if self.started.swap(false, Ordering::AcqRel) {
            self.existence.absent.invalidate_all();
            info!("File system worker stopped");
        }
        Ok(())
    }

    fn services(&self) -> Result<RpcServiceMap, WorkerError> {
        let mut services = RpcServiceMap::new();
        services.insert(
            "file_system".to_string(),
            Arc::new(FileSystemService {
                existence: self.existence.clone(),
            }),
        );
        Ok(services)
    }
}

#[derive(Debug, Deserialize)]
struct PathArg {
    path: String,
}

/// RPC service `file_system`: `exists`, `check`, `mark_exists`.
struct FileSystemService {
    existence: Arc<Existence>,
}

#[async_trait]
impl RpcService for FileSystemService {
    async fn call(&self, method: &str, payload: Value) -> Result<Value, RpcError> {
        let unavailable = |e: io::Error| RpcError::Unavailable(e.to_string());
        match method {
            "exists" => {
                let PathArg { path } = decode(payload)?;
                let exists = self.existence.exists(&path).await.map_err(unavailable)?;
                Ok(json!({ "path": path, "exists": exists }))
            }
            "check" => {
                let PathArg { path } = decode(payload)?;
                let exists = self.existence.check(&path).await.map_err(unavailable)?;
                Ok(json!({ "path": path, "exists": exists }))
            }
            "mark_exists" => {
                let PathArg { path } = decode(payload)?;
                self.existence.absent.process_existence(&path);
                Ok(json!({}))
            }
            other => Err(RpcError::unknown_method("file_system", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::cache::AbsentCacheKind;
    use crate::ufs::local::LocalUnderFileSystem;

    fn worker(root: &std::path::Path, threads: i32) -> FileSystemWorker {
        worker_over(Arc::new(LocalUnderFileSystem::new(root)), threads)
    }

    fn worker_over(ufs: Arc<dyn UnderFileSystem>, threads: i32) -> FileSystemWorker {
        let config = UfsConfig {
            absent_cache_threads: threads,
            ..UfsConfig::default()
        };
        let metrics = Arc::new(MetricsSystem::new("worker").unwrap());
        FileSystemWorker::new(ufs, &config, metrics)
    }

    /// Reports every path missing after `delay`, counting calls per path.
    struct SlowMissingUfs {
        delay: Duration,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl SlowMissingUfs {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: Mutex::new(HashMap::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl UnderFileSystem for SlowMissingUfs {
        async fn exists(&self, path: &str) -> io::Result<bool> {
            *self.calls.lock().unwrap().entry(path.to_string()).or_default() += 1;
            tokio::time::sleep(self.delay).await;
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_missing_path_answered_from_cache_afterwards() {
        let dir = tempfile::tempdir().unwrap();
        let fs = worker(dir.path(), 1);
        assert_eq!(fs.absent_cache().kind(), AbsentCacheKind::Async);

        assert!(!fs.exists("/data/file").await.unwrap());
        assert!(fs.absent_cache().is_absent("/data/file"));

        // Once created, a forced check clears the stale negative.
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/file"), b"x").unwrap();
        assert!(fs.check("/data/file").await.unwrap());
        assert!(!fs.absent_cache().is_absent("/data/file"));
        assert!(fs.exists("/data/file").await.unwrap());
    }

    #[tokio::test]
    async fn test_rpc_service_methods() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present"), b"x").unwrap();
        let fs = worker(dir.path(), 0);
        let service = fs.services().unwrap().remove("file_system").unwrap();

        let present = service.call("exists", json!({"path": "/present"})).await.unwrap();
        assert_eq!(present["exists"], true);
        let missing = service.call("check", json!({"path": "/missing"})).await.unwrap();
        assert_eq!(missing["exists"], false);
        service.call("mark_exists", json!({"path": "/missing"})).await.unwrap();
        assert!(matches!(
            service.call("exists", json!({})).await,
            Err(RpcError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_existence_seen_during_check_outlives_its_negative() {
        let ufs = SlowMissingUfs::new(Duration::from_millis(100));
        let fs = Arc::new(worker_over(ufs, 1));

        let checking = {
            let fs = fs.clone();
            tokio::spawn(async move { fs.check("/p").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        fs.mark_exists("/p");

        assert!(!checking.await.unwrap().unwrap());
        assert!(!fs.absent_cache().is_known_absent("/p"));
    }

    #[tokio::test]
    async fn test_cache_miss_costs_one_storage_check() {
        let ufs = SlowMissingUfs::new(Duration::from_millis(1));
        let fs = worker_over(ufs.clone(), 2);

        assert!(!fs.exists("/q/r").await.unwrap());
        // Give a stray background verification time to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ufs.calls(), 1);

        // The recorded negative answers the next lookup from memory.
        assert!(!fs.exists("/q/r").await.unwrap());
        assert_eq!(ufs.calls(), 1);
    }

    #[tokio::test]
    async fn test_dot_dot_stays_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(dir.path().join("outside"), b"x").unwrap();
        let fs = worker(&root, 0);

        assert!(!fs.exists("/../outside").await.unwrap());
        assert!(!fs.check("/a/../../outside").await.unwrap());
    }
}
