//! Block data transfer between workers and clients.
//!
//! - [`protocol`]: request and response frames of the data-transfer endpoint
//! - [`data_server`]: the worker's TCP endpoint streaming block ranges

pub mod data_server;
pub mod protocol;

use std::io;

use thiserror::Error;

pub use data_server::DataServer;
pub use protocol::{ReadRequest, ResponseHeader, ResponseStatus};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("block {0} not found")]
    BlockNotFound(u64),

    #[error("range {offset}+{length} outside block {block_id} of {block_length} bytes")]
    OutOfRange {
        block_id: u64,
        offset: u64,
        length: u64,
        block_length: u64,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}
