//! Absent-path caching in front of the underlying storage.
//!
//! - [`absent_path`]: the `AbsentPathCache` contract, the factory and the no-op cache
//! - [`async_absent`]: the asynchronous cache verified by a background task pool

pub mod absent_path;
pub mod async_absent;

pub use absent_path::{
    create, AbsentCacheKind, AbsentCacheOptions, AbsentPathCache, NoopAbsentPathCache,
};
pub use async_absent::AsyncAbsentPathCache;
