//! The absent-path cache contract.
//!
//! An absent-path cache remembers paths confirmed not to exist in the underlying
//! storage, so metadata resolution can skip a round-trip for them. A path is
//! reported absent when it, or any of its ancestors, is recorded absent.
//!
//! Which implementation is used is decided purely by configuration: a positive
//! thread count yields [`AsyncAbsentPathCache`], anything else yields
//! [`NoopAbsentPathCache`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::cache::async_absent::AsyncAbsentPathCache;
use crate::config::UfsConfig;
use crate::ufs::UnderFileSystem;

/// Which implementation a cache instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentCacheKind {
    Async,
    Noop,
}

/// A recorded absence.
#[derive(Debug, Clone, Copy)]
pub struct AbsentPathEntry {
    pub inserted_at: Instant,
}

/// Tuning for the asynchronous cache.
#[derive(Debug, Clone, Copy)]
pub struct AbsentCacheOptions {
    /// Staleness window: an entry older than this is dropped and re-verified.
    pub ttl: Duration,

    /// Maximum number of absent entries.
    pub capacity: u64,
}

impl Default for AbsentCacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            capacity: 100_000,
        }
    }
}

impl From<&UfsConfig> for AbsentCacheOptions {
    fn from(config: &UfsConfig) -> Self {
        Self {
            ttl: config.absent_cache_ttl(),
            capacity: config.absent_cache_capacity,
        }
    }
}

/// Cache of paths known not to exist in the underlying storage.
///
/// Lookups never block on the underlying storage. Callers that need an
/// authoritative answer check the storage directly and report what they saw
/// through [`process_existence`](Self::process_existence) or
/// [`add_single_path`](Self::add_single_path).
pub trait AbsentPathCache: Send + Sync {
    fn kind(&self) -> AbsentCacheKind;

    /// Best-effort answer from memory. `false` means "not known absent"; a miss
    /// may queue a background verification.
    fn is_absent(&self, path: &str) -> bool;

    /// Like [`is_absent`](Self::is_absent) but never queues work. For callers
    /// about to check the storage themselves.
    fn is_known_absent(&self, path: &str) -> bool;

    /// Record that `path` exists. Clears any absent entry for it and its ancestors.
    fn process_existence(&self, path: &str);

    /// Token to take before asking the storage about a path, and hand back to
    /// [`add_single_path_since`](Self::add_single_path_since) with the answer.
    fn begin_observation(&self) -> u64;

    /// Record that `path` was missing when observed under `token`. Dropped if
    /// any existence was recorded after the token was taken.
    fn add_single_path_since(&self, path: &str, token: u64);

    /// Record that `path` was directly observed to be missing, just now.
    fn add_single_path(&self, path: &str) {
        self.add_single_path_since(path, self.begin_observation());
    }

    /// Drop every recorded absence.
    fn invalidate_all(&self);
}

/// Build the cache selected by `threads`.
///
/// `threads > 0` spawns that many verification tasks on the current Tokio
/// runtime, so this must be called from within one.
pub fn create(
    threads: i32,
    ufs: Arc<dyn UnderFileSystem>,
    options: AbsentCacheOptions,
) -> Arc<dyn AbsentPathCache> {
    if threads > 0 {
        info!(threads, ttl_secs = options.ttl.as_secs(), "Using asynchronous absent-path cache");
        Arc::new(AsyncAbsentPathCache::new(ufs, threads as usize, options))
    } else {
        info!(threads, "Absent-path cache disabled");
        Arc::new(NoopAbsentPathCache)
    }
}

/// A cache that never knows anything, so every caller checks the storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAbsentPathCache;

impl AbsentPathCache for NoopAbsentPathCache {
    fn kind(&self) -> AbsentCacheKind {
        AbsentCacheKind::Noop
    }

    fn is_absent(&self, _path: &str) -> bool {
        false
    }

    fn is_known_absent(&self, _path: &str) -> bool {
        false
    }

    fn process_existence(&self, _path: &str) {}

    fn begin_observation(&self) -> u64 {
        0
    }

    fn add_single_path_since(&self, _path: &str, _token: u64) {}

    fn invalidate_all(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ufs::local::LocalUnderFileSystem;

    fn ufs() -> Arc<dyn UnderFileSystem> {
        Arc::new(LocalUnderFileSystem::new("/nonexistent-tiercache-root"))
    }

    #[tokio::test]
    async fn test_factory_selects_by_thread_count() {
        for threads in [1, 4, 64] {
            let cache = create(threads, ufs(), AbsentCacheOptions::default());
            assert_eq!(cache.kind(), AbsentCacheKind::Async, "threads = {threads}");
        }
        for threads in [0, -1, i32::MIN] {
            let cache = create(threads, ufs(), AbsentCacheOptions::default());
            assert_eq!(cache.kind(), AbsentCacheKind::Noop, "threads = {threads}");
        }
    }

    #[test]
    fn test_noop_never_reports_absent() {
        let cache = NoopAbsentPathCache;
        cache.add_single_path("/missing");
        assert!(!cache.is_absent("/missing"));
        assert!(!cache.is_absent("/missing/child"));
    }
}
