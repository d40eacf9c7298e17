//! tiercache: the control plane of a tiered block cache.
//!
//! Workers cache blocks in front of slower underlying storage (UFS), register
//! with a master, expose RPC, web and data-transfer endpoints under HA control,
//! and answer existence checks through an absent-path cache. Clients read
//! blocks through workers and fail over between replicas mid-transfer.

pub mod cache;
pub mod client;
pub mod config;
pub mod ha;
pub mod master;
pub mod metrics;
pub mod retry;
pub mod rpc;
pub mod server;
pub mod transfer;
pub mod ufs;
pub mod worker;
