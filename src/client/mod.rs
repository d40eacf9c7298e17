//! Client-side block read path.
//!
//! - [`block_reader`]: sequential and positioned reads over a block's replicas,
//!   failing over between workers within a wall-clock retry budget

pub mod block_reader;

pub use block_reader::{BlockLocation, BlockReadError, FaultTolerantBlockReader, ReadOptions};
