//! Fault-tolerant block reads.
//!
//! A reader owns one read session over one block: the cursor, the workers that
//! have failed during the session, and the retry deadline. When a worker dies
//! mid-transfer the reader reconnects to a replica it has not tried yet and
//! resumes at the exact byte it stopped at, so callers see one uninterrupted
//! stream.
//!
//! The retry deadline starts at the first failure and is cleared as soon as any
//! byte is delivered again. A read fails for good when the deadline passes or
//! when no untried replica is left; the error reports how many bytes the failing
//! call had already written into the caller's buffer.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::retry::RetryBudget;
use crate::transfer::protocol::{ReadRequest, ResponseHeader, ResponseStatus};
use crate::transfer::TransferError;
use crate::worker::WorkerNetAddress;

/// One replica of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    pub block_id: u64,
    pub worker: WorkerNetAddress,
    pub length: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Wall-clock budget for recovering from worker failures.
    pub retry_max_duration: Duration,

    /// A worker silent for this long is treated as dead.
    pub read_timeout: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ReadOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            retry_max_duration: Duration::from_millis(config.block_read_retry_max_duration_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }
}

#[derive(Error, Debug)]
pub enum BlockReadError {
    #[error(
        "block {block_id}: no replica left to try after {bytes_delivered} bytes \
         (last error: {last_error})"
    )]
    NoReplicas {
        block_id: u64,
        bytes_delivered: u64,
        last_error: String,
    },

    #[error(
        "block {block_id}: retry budget of {budget:?} exhausted after {bytes_delivered} bytes \
         (last error: {last_error})"
    )]
    RetryBudgetExhausted {
        block_id: u64,
        budget: Duration,
        bytes_delivered: u64,
        last_error: String,
    },

    #[error("block {block_id}: range {offset}+{length} outside block of {block_length} bytes")]
    OutOfRange {
        block_id: u64,
        offset: u64,
        length: u64,
        block_length: u64,
    },
}

impl BlockReadError {
    /// Bytes the failing call wrote into the caller's buffer before giving up.
    pub fn bytes_delivered(&self) -> u64 {
        match self {
            BlockReadError::NoReplicas { bytes_delivered, .. }
            | BlockReadError::RetryBudgetExhausted { bytes_delivered, .. } => *bytes_delivered,
            BlockReadError::OutOfRange { .. } => 0,
        }
    }

    fn add_delivered(mut self, more: u64) -> Self {
        match &mut self {
            BlockReadError::NoReplicas { bytes_delivered, .. }
            | BlockReadError::RetryBudgetExhausted {
                bytes_delivered, ..
            } => *bytes_delivered += more,
            BlockReadError::OutOfRange { .. } => {}
        }
        self
    }
}

impl From<BlockReadError> for io::Error {
    fn from(e: BlockReadError) -> Self {
        let kind = match e {
            BlockReadError::OutOfRange { .. } => io::ErrorKind::InvalidInput,
            BlockReadError::RetryBudgetExhausted { .. } => io::ErrorKind::TimedOut,
            BlockReadError::NoReplicas { .. } => io::ErrorKind::NotConnected,
        };
        io::Error::new(kind, e)
    }
}

/// An open response stream from one worker for one byte range.
struct RemoteRange {
    worker: WorkerNetAddress,
    stream: TcpStream,
    remaining: u64,
}

impl RemoteRange {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransferError> {
        let want = buf.len().min(self.remaining as usize);
        let n = tokio::time::timeout(timeout, self.stream.read(&mut buf[..want]))
            .await
            .map_err(|_| TransferError::Timeout(timeout))??;
        if n == 0 {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("worker closed the stream with {} bytes outstanding", self.remaining),
            )));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Reads one block, failing over between its replicas.
pub struct FaultTolerantBlockReader {
    block_id: u64,
    length: u64,
    locations: Vec<BlockLocation>,
    options: ReadOptions,
    cursor: u64,
    failed: HashSet<WorkerNetAddress>,
    retry: Option<RetryBudget>,
    current: Option<RemoteRange>,
}

impl FaultTolerantBlockReader {
    /// `locations` are tried in order. Replicas of other blocks, and replicas
    /// whose recorded length disagrees with `length`, are ignored.
    pub fn new(
        block_id: u64,
        length: u64,
        locations: Vec<BlockLocation>,
        options: ReadOptions,
    ) -> Self {
        let locations = locations
            .into_iter()
            .filter(|location| location.block_id == block_id)
            .filter(|location| {
                let agrees = location.length == length;
                if !agrees {
                    warn!(
                        block_id,
                        worker = %location.worker,
                        expected = length,
                        recorded = location.length,
                        "Ignoring replica with mismatched length"
                    );
                }
                agrees
            })
            .collect();
        Self {
            block_id,
            length,
            locations,
            options,
            cursor: 0,
            failed: HashSet::new(),
            retry: None,
            current: None,
        }
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.length - self.cursor
    }

    /// Workers excluded from this session after failing.
    pub fn failed_workers(&self) -> &HashSet<WorkerNetAddress> {
        &self.failed
    }

    /// Move the cursor. Any open stream is dropped and reopened at the new
    /// position on the next read.
    pub fn seek(&mut self, position: u64) -> Result<(), BlockReadError> {
        if position > self.length {
            return Err(self.out_of_range(position, 0));
        }
        if position != self.cursor {
            self.current = None;
            self.cursor = position;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns 0 at the end of the block.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BlockReadError> {
        if buf.is_empty() || self.remaining() == 0 {
            return Ok(0);
        }
        loop {
            let mut remote = match self.current.take() {
                Some(remote) => remote,
                None => {
                    let worker = self.next_worker()?;
                    match self.open(&worker, self.cursor, self.remaining()).await {
                        Ok(remote) => remote,
                        Err(e) => {
                            self.fail_over(worker, e)?;
                            continue;
                        }
                    }
                }
            };

            match remote.read(buf, self.attempt_timeout()).await {
                Ok(n) => {
                    self.cursor += n as u64;
                    self.retry = None;
                    if remote.remaining > 0 {
                        self.current = Some(remote);
                    }
                    return Ok(n);
                }
                Err(e) => self.fail_over(remote.worker, e)?,
            }
        }
    }

    /// Fill `buf` completely from the cursor.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BlockReadError> {
        if buf.len() as u64 > self.remaining() {
            return Err(self.out_of_range(self.cursor, buf.len() as u64));
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await {
                Ok(n) => filled += n,
                Err(e) => return Err(e.add_delivered(filled as u64)),
            }
        }
        Ok(())
    }

    /// Read at `position` without moving the cursor or disturbing the
    /// sequential stream. Fills `buf` up to the end of the block and returns the
    /// number of bytes read.
    pub async fn positioned_read(
        &mut self,
        position: u64,
        buf: &mut [u8],
    ) -> Result<usize, BlockReadError> {
        if position > self.length {
            return Err(self.out_of_range(position, buf.len() as u64));
        }
        let total = buf.len().min((self.length - position) as usize);
        let mut filled = 0;
        while filled < total {
            let worker = self.next_worker().map_err(|e| e.add_delivered(filled as u64))?;
            let offset = position + filled as u64;
            let mut remote = match self.open(&worker, offset, (total - filled) as u64).await {
                Ok(remote) => remote,
                Err(e) => {
                    self.fail_over(worker, e).map_err(|e| e.add_delivered(filled as u64))?;
                    continue;
                }
            };
            while filled < total {
                match remote.read(&mut buf[filled..total], self.attempt_timeout()).await {
                    Ok(n) => {
                        filled += n;
                        self.retry = None;
                    }
                    Err(e) => {
                        self.fail_over(remote.worker.clone(), e)
                            .map_err(|e| e.add_delivered(filled as u64))?;
                        break;
                    }
                }
            }
        }
        Ok(total)
    }

    /// First replica that has not failed in this session.
    fn next_worker(&self) -> Result<WorkerNetAddress, BlockReadError> {
        self.locations
            .iter()
            .map(|location| &location.worker)
            .find(|worker| !self.failed.contains(*worker))
            .cloned()
            .ok_or_else(|| BlockReadError::NoReplicas {
                block_id: self.block_id,
                bytes_delivered: 0,
                last_error: "no usable replica".to_string(),
            })
    }

    /// Record a failed attempt. `Ok` means another attempt may be made.
    fn fail_over(
        &mut self,
        worker: WorkerNetAddress,
        error: TransferError,
    ) -> Result<(), BlockReadError> {
        warn!(
            block_id = self.block_id,
            worker = %worker,
            cursor = self.cursor,
            error = %error,
            "Block read from worker failed"
        );
        self.current = None;
        self.failed.insert(worker);
        let window = self.options.retry_max_duration;
        let budget = *self.retry.get_or_insert_with(|| RetryBudget::start(window));

        if self.next_worker().is_err() {
            return Err(BlockReadError::NoReplicas {
                block_id: self.block_id,
                bytes_delivered: 0,
                last_error: error.to_string(),
            });
        }
        if budget.is_exhausted() {
            return Err(BlockReadError::RetryBudgetExhausted {
                block_id: self.block_id,
                budget: self.options.retry_max_duration,
                bytes_delivered: 0,
                last_error: error.to_string(),
            });
        }
        Ok(())
    }

    /// Timeout for one network step: the read timeout, shortened to what is
    /// left of the retry budget while recovering.
    fn attempt_timeout(&self) -> Duration {
        match &self.retry {
            Some(budget) => self
                .options
                .read_timeout
                .min(budget.remaining())
                .max(Duration::from_millis(1)),
            None => self.options.read_timeout,
        }
    }

    async fn open(
        &self,
        worker: &WorkerNetAddress,
        offset: u64,
        length: u64,
    ) -> Result<RemoteRange, TransferError> {
        let timeout = self.attempt_timeout();
        let request = ReadRequest {
            block_id: self.block_id,
            offset,
            length,
        };
        let connect = async {
            let mut stream = TcpStream::connect(worker.data_socket_addr()?).await?;
            stream.set_nodelay(true)?;
            request.write_to(&mut stream).await?;
            let header = ResponseHeader::read_from(&mut stream).await?;
            Ok::<_, TransferError>((stream, header))
        };
        let (stream, header) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransferError::Timeout(timeout))??;

        match header.status {
            ResponseStatus::Ok if header.length == length => {}
            ResponseStatus::Ok => {
                return Err(TransferError::Protocol(format!(
                    "asked for {length} bytes, worker offered {}",
                    header.length
                )))
            }
            ResponseStatus::NotFound => return Err(TransferError::BlockNotFound(self.block_id)),
            ResponseStatus::OutOfRange => {
                return Err(TransferError::OutOfRange {
                    block_id: self.block_id,
                    offset,
                    length,
                    block_length: self.length,
                })
            }
        }
        debug!(block_id = self.block_id, worker = %worker, offset, length, "Opened block stream");
        Ok(RemoteRange {
            worker: worker.clone(),
            stream,
            remaining: length,
        })
    }

    fn out_of_range(&self, offset: u64, length: u64) -> BlockReadError {
        BlockReadError::OutOfRange {
            block_id: self.block_id,
            offset,
            length,
            block_length: self.length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(port: u16) -> BlockLocation {
        BlockLocation {
            block_id: 1,
            worker: WorkerNetAddress::new("127.0.0.1", 0, port, 0),
            length: 10,
        }
    }

    /// Distinct ports nothing listens on.
    fn dead_ports(count: usize) -> Vec<u16> {
        let listeners: Vec<_> = (0..count)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap().port()).collect()
    }

    #[tokio::test]
    async fn test_no_replicas_fails_immediately() {
        let mut reader = FaultTolerantBlockReader::new(1, 10, vec![], ReadOptions::default());
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, BlockReadError::NoReplicas { .. }));
        assert_eq!(err.bytes_delivered(), 0);
    }

    #[tokio::test]
    async fn test_single_dead_replica_fails_without_waiting_for_budget() {
        let options = ReadOptions {
            retry_max_duration: Duration::from_secs(60),
            ..ReadOptions::default()
        };
        let locations = vec![location(dead_ports(1)[0])];
        let mut reader = FaultTolerantBlockReader::new(1, 10, locations, options);
        let started = std::time::Instant::now();
        let err = reader.read(&mut [0u8; 4]).await.unwrap_err();
        assert!(matches!(err, BlockReadError::NoReplicas { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(reader.failed_workers().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_stops_after_first_failure() {
        let options = ReadOptions {
            retry_max_duration: Duration::ZERO,
            ..ReadOptions::default()
        };
        let locations = dead_ports(3).into_iter().map(location).collect();
        let mut reader = FaultTolerantBlockReader::new(1, 10, locations, options);
        let err = reader.read(&mut [0u8; 4]).await.unwrap_err();
        assert!(matches!(err, BlockReadError::RetryBudgetExhausted { .. }));
        assert_eq!(reader.failed_workers().len(), 1);

        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_seek_and_range_checks() {
        let mut reader = FaultTolerantBlockReader::new(1, 10, vec![], ReadOptions::default());
        reader.seek(10).unwrap();
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.read(&mut [0u8; 4]).await.unwrap(), 0);
        assert!(matches!(reader.seek(11), Err(BlockReadError::OutOfRange { .. })));

        reader.seek(8).unwrap();
        let err = reader.read_exact(&mut [0u8; 4]).await.unwrap_err();
        assert!(matches!(err, BlockReadError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_replicas_with_other_length_are_ignored() {
        let mut stale = location(dead_ports(1)[0]);
        stale.length = 4;
        let mut reader = FaultTolerantBlockReader::new(1, 10, vec![stale], ReadOptions::default());
        let err = reader.read(&mut [0u8; 4]).await.unwrap_err();
        assert!(matches!(err, BlockReadError::NoReplicas { .. }));
        // Never contacted, so never marked failed.
        assert!(reader.failed_workers().is_empty());
    }
}
