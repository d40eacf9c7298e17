//! The worker's data-transfer endpoint.
//!
//! Binds at construction and accepts until closed. Each connection runs in its
//! own task; closing the server aborts every live transfer, so clients in the
//! middle of a block see their connection drop and fail over.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use prometheus::IntCounter;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::server::{shutdown_signal, ShutdownHandle, ShutdownSignal};
use crate::transfer::protocol::{ReadRequest, ResponseHeader, ResponseStatus};
use crate::transfer::TransferError;
use crate::worker::block::BlockStore;

/// Streams block ranges out of a [`BlockStore`].
pub struct DataServer {
    local_addr: SocketAddr,
    shutdown: Mutex<Option<ShutdownHandle>>,
    accept_loop: JoinHandle<()>,
}

impl DataServer {
    /// Bind `addr` and start accepting. Port 0 resolves to an OS-assigned port.
    pub async fn bind(
        addr: SocketAddr,
        store: Arc<BlockStore>,
        chunk_size: usize,
        bytes_served: Option<IntCounter>,
    ) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (handle, signal) = shutdown_signal();

        let conn = Connection {
            store,
            chunk_size: chunk_size.max(1),
            bytes_served,
        };
        let accept_loop = tokio::spawn(accept_loop(listener, conn, signal));
        info!(%local_addr, "Data server listening");

        Ok(Self {
            local_addr,
            shutdown: Mutex::new(Some(handle)),
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and abort every live transfer.
    ///
    /// Returns once the request is issued; [`is_closed`](Self::is_closed) reports
    /// when the accept loop and all transfers have actually ended.
    pub fn close(&self) {
        let handle = self.shutdown.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            debug!(addr = %self.local_addr, "Closing data server");
            handle.trigger();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.accept_loop.is_finished()
    }
}

impl Drop for DataServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

#[derive(Clone)]
struct Connection {
    store: Arc<BlockStore>,
    chunk_size: usize,
    bytes_served: Option<IntCounter>,
}

async fn accept_loop(listener: TcpListener, conn: Connection, mut shutdown: ShutdownSignal) {
    let mut transfers = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = conn.clone();
                    transfers.spawn(async move {
                        if let Err(e) = conn.serve(stream).await {
                            debug!(%peer, error = %e, "Data connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Data server accept failed"),
            },
            // Reap finished transfers so the set does not grow without bound.
            Some(_) = transfers.join_next(), if !transfers.is_empty() => {}
        }
    }

    let live = transfers.len();
    transfers.shutdown().await;
    drop(listener);
    info!(aborted_transfers = live, "Data server closed");
}

impl Connection {
    async fn serve(&self, stream: TcpStream) -> Result<(), TransferError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        while let Some(request) = ReadRequest::read_from(&mut reader).await? {
            let Some(block) = self.store.get_block(request.block_id) else {
                ResponseHeader::error(ResponseStatus::NotFound).write_to(&mut writer).await?;
                writer.flush().await?;
                continue;
            };

            let block_length = block.len() as u64;
            let in_range = request
                .offset
                .checked_add(request.length)
                .is_some_and(|end| end <= block_length);
            if !in_range {
                ResponseHeader::error(ResponseStatus::OutOfRange).write_to(&mut writer).await?;
                writer.flush().await?;
                continue;
            }

            ResponseHeader::ok(request.length).write_to(&mut writer).await?;
            let start = request.offset as usize;
            let range = block.slice(start..start + request.length as usize);
            for chunk in range.chunks(self.chunk_size) {
                writer.write_all(chunk).await?;
                if let Some(counter) = &self.bytes_served {
                    counter.inc_by(chunk.len() as u64);
                }
            }
            writer.flush().await?;
            debug!(
                block_id = request.block_id,
                offset = request.offset,
                length = request.length,
                "Served block range"
            );
        }
        Ok(())
    }
}
