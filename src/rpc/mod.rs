//! RPC services and the multiplexer routing calls to them by service name.
//!
//! - [`service`]: the `RpcService` handler trait, its error type and payload helpers
//! - [`multiplexer`]: collision-checked registration and the HTTP router

pub mod multiplexer;
pub mod service;

pub use multiplexer::{MultiplexError, RpcMultiplexer};
pub use service::{decode, encode, RpcError, RpcService, RpcServiceMap};
