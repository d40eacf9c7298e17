//! Asynchronous absent-path cache.
//!
//! Lookups are answered from two concurrent in-memory tables: paths recorded
//! absent, and paths recently verified to exist. A lookup that hits neither
//! queues the path for verification and returns `false` straight away. A fixed
//! pool of tasks drains the queue, walking the path from the root down and
//! recording the first missing component as absent.
//!
//! Freshness: every positive observation bumps an epoch. A verification only
//! keeps an absent entry if no positive observation happened since it began,
//! so a slow verification can never overwrite a newer "exists".

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use moka::sync::Cache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::absent_path::{
    AbsentCacheKind, AbsentCacheOptions, AbsentPathCache, AbsentPathEntry,
};
use crate::ufs::{normalize, path_lineage, UnderFileSystem};

/// State shared between lookup callers and the verification pool.
struct Shared {
    ufs: Arc<dyn UnderFileSystem>,
    absent: Cache<String, AbsentPathEntry>,
    present: Cache<String, ()>,
    in_flight: Mutex<HashSet<String>>,
    existence_epoch: AtomicU64,
    verifications: AtomicU64,
}

impl Shared {
    /// The recorded absent ancestor of `path` (or `path` itself), if any.
    fn absent_ancestor(&self, path: &str) -> Option<String> {
        path_lineage(path)
            .into_iter()
            .find(|candidate| self.absent.contains_key(candidate))
    }

    fn mark_existing(&self, path: &str) {
        self.existence_epoch.fetch_add(1, Ordering::SeqCst);
        for ancestor in path_lineage(path) {
            self.absent.invalidate(&ancestor);
        }
        self.present.insert(path.to_string(), ());
    }

    fn mark_absent(&self, path: &str, epoch: u64) {
        self.present.invalidate(path);
        self.absent.insert(
            path.to_string(),
            AbsentPathEntry {
                inserted_at: Instant::now(),
            },
        );
        // A positive observation raced with this verification; its answer wins.
        if self.existence_epoch.load(Ordering::SeqCst) != epoch {
            self.absent.invalidate(path);
        }
    }

    async fn verify(&self, path: &str) {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        let epoch = self.existence_epoch.load(Ordering::SeqCst);

        // The UFS root itself is assumed to exist.
        for ancestor in path_lineage(path).into_iter().skip(1) {
            if self.absent.contains_key(&ancestor) {
                return;
            }
            match self.ufs.exists(&ancestor).await {
                Ok(true) => continue,
                Ok(false) => {
                    debug!(path, absent = %ancestor, "Recorded absent path");
                    self.mark_absent(&ancestor, epoch);
                    return;
                }
                Err(e) => {
                    warn!(path, error = %e, "Absent-path verification failed");
                    return;
                }
            }
        }

        if self.existence_epoch.load(Ordering::SeqCst) == epoch {
            self.present.insert(path.to_string(), ());
        }
    }

    fn finish(&self, path: &str) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(path);
        }
    }
}

/// Absent-path cache verified off the caller's task by a fixed pool.
pub struct AsyncAbsentPathCache {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<String>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncAbsentPathCache {
    /// Spawn `threads` verification tasks on the current Tokio runtime.
    pub fn new(ufs: Arc<dyn UnderFileSystem>, threads: usize, options: AbsentCacheOptions) -> Self {
        let shared = Arc::new(Shared {
            ufs,
            absent: Cache::builder()
                .max_capacity(options.capacity)
                .time_to_live(options.ttl)
                .build(),
            present: Cache::builder()
                .max_capacity(options.capacity)
                .time_to_live(options.ttl)
                .build(),
            in_flight: Mutex::new(HashSet::new()),
            existence_epoch: AtomicU64::new(0),
            verifications: AtomicU64::new(0),
        });

        let (queue, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|_| {
                let rx = rx.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(path) = next else { break };
                        shared.verify(&path).await;
                        shared.finish(&path);
                    }
                })
            })
            .collect();

        Self {
            shared,
            queue,
            workers,
        }
    }

    /// Queue `path` for verification unless one is already in flight.
    fn schedule(&self, path: String) {
        let newly_queued = match self.shared.in_flight.lock() {
            Ok(mut in_flight) => in_flight.insert(path.clone()),
            Err(_) => false,
        };
        if !newly_queued {
            return;
        }
        if let Err(mpsc::error::SendError(path)) = self.queue.send(path) {
            self.shared.finish(&path);
        }
    }

    /// Verifications started since creation.
    pub fn verifications(&self) -> u64 {
        self.shared.verifications.load(Ordering::Relaxed)
    }

    /// Verifications queued or running right now.
    pub fn pending_verifications(&self) -> usize {
        self.shared.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// When `path` (or the ancestor that makes it absent) was recorded absent.
    pub fn absent_since(&self, path: &str) -> Option<Instant> {
        let path = normalize(path);
        self.shared
            .absent_ancestor(&path)
            .and_then(|ancestor| self.shared.absent.get(&ancestor))
            .map(|entry| entry.inserted_at)
    }
}

impl AbsentPathCache for AsyncAbsentPathCache {
    fn kind(&self) -> AbsentCacheKind {
        AbsentCacheKind::Async
    }

    fn is_absent(&self, path: &str) -> bool {
        let path = normalize(path);
        if self.shared.absent_ancestor(&path).is_some() {
            return true;
        }
        if !self.shared.present.contains_key(&path) {
            self.schedule(path);
        }
        false
    }

    fn is_known_absent(&self, path: &str) -> bool {
        self.shared.absent_ancestor(&normalize(path)).is_some()
    }

    fn process_existence(&self, path: &str) {
        self.shared.mark_existing(&normalize(path));
    }

    fn begin_observation(&self) -> u64 {
        self.shared.existence_epoch.load(Ordering::SeqCst)
    }

    fn add_single_path_since(&self, path: &str, token: u64) {
        self.shared.mark_absent(&normalize(path), token);
    }

    fn invalidate_all(&self) {
        self.shared.absent.invalidate_all();
        self.shared.present.invalidate_all();
    }
}

impl Drop for AsyncAbsentPathCache {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    /// In-memory UFS that counts existence checks per path.
    #[derive(Default)]
    struct CountingUfs {
        existing: Mutex<HashSet<String>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl UnderFileSystem for CountingUfs {
        async fn exists(&self, path: &str) -> io::Result<bool> {
            *self.calls.lock().unwrap().entry(path.to_string()).or_default() += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.existing.lock().unwrap().contains(path))
        }
    }

    async fn settle(cache: &AsyncAbsentPathCache) {
        for _ in 0..200 {
            if cache.pending_verifications() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("verifications did not settle");
    }

    #[tokio::test]
    async fn test_miss_schedules_verification_and_records_first_missing() {
        let ufs = Arc::new(CountingUfs::default());
        ufs.existing.lock().unwrap().insert("/a".to_string());
        let cache = AsyncAbsentPathCache::new(ufs.clone(), 2, AbsentCacheOptions::default());

        assert!(!cache.is_absent("/a/b/c"));
        settle(&cache).await;

        assert!(cache.is_absent("/a/b"));
        assert!(cache.is_absent("/a/b/c"));
        assert!(!cache.is_absent("/a"));
        // Nothing below the first missing component is checked.
        assert!(!ufs.calls.lock().unwrap().contains_key("/a/b/c"));
    }

    #[tokio::test]
    async fn test_existence_clears_path_and_ancestors() {
        let ufs = Arc::new(CountingUfs::default());
        let cache = AsyncAbsentPathCache::new(ufs, 1, AbsentCacheOptions::default());

        cache.add_single_path("/x");
        cache.add_single_path("/x/y");
        assert!(cache.is_absent("/x/y/z"));

        cache.process_existence("/x/y/z");
        assert!(!cache.is_absent("/x"));
        assert!(!cache.is_absent("/x/y"));
        assert!(!cache.is_absent("/x/y/z"));
    }

    #[tokio::test]
    async fn test_absent_since_tracks_the_recording_ancestor() {
        let ufs = Arc::new(CountingUfs::default());
        let cache = AsyncAbsentPathCache::new(ufs, 1, AbsentCacheOptions::default());
        let before = Instant::now();

        cache.add_single_path("/gone");
        let since = cache.absent_since("/gone/deeper").unwrap();
        assert!(since >= before);
        assert!(cache.absent_since("/elsewhere").is_none());
    }

    #[tokio::test]
    async fn test_ttl_expires_absent_entries() {
        let ufs = Arc::new(CountingUfs::default());
        let options = AbsentCacheOptions {
            ttl: Duration::from_millis(50),
            capacity: 16,
        };
        let cache = AsyncAbsentPathCache::new(ufs, 1, options);

        cache.add_single_path("/short-lived");
        assert!(cache.is_absent("/short-lived"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.absent_since("/short-lived").is_none());
    }

    #[tokio::test]
    async fn test_negative_older_than_an_existence_is_dropped() {
        let ufs = Arc::new(CountingUfs::default());
        let cache = AsyncAbsentPathCache::new(ufs.clone(), 1, AbsentCacheOptions::default());

        let token = cache.begin_observation();
        cache.process_existence("/p");
        cache.add_single_path_since("/p", token);
        assert!(!cache.is_known_absent("/p"));

        let token = cache.begin_observation();
        cache.add_single_path_since("/p", token);
        assert!(cache.is_known_absent("/p"));
    }

    #[tokio::test]
    async fn test_known_absent_lookup_never_schedules() {
        let ufs = Arc::new(CountingUfs::default());
        let cache = AsyncAbsentPathCache::new(ufs.clone(), 1, AbsentCacheOptions::default());

        assert!(!cache.is_known_absent("/never/checked"));
        assert_eq!(cache.pending_verifications(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ufs.calls.lock().unwrap().is_empty());
    }
}
