//! Server plumbing shared by the worker's network endpoints.
//!
//! - [`shutdown`]: one-shot signal pair used to stop every server loop
//! - [`web`]: the worker's web routes (health, descriptor, metrics)

pub mod shutdown;
pub mod web;

pub use shutdown::{shutdown_signal, ShutdownHandle, ShutdownSignal};
