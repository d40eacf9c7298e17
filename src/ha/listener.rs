//! A TCP listener shared between the loops that take turns accepting on it.
//!
//! Holding the listener here, rather than inside whichever loop is running, is
//! what keeps a port bound while a primary-only service swaps its rejecting loop
//! for the real server and back.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct SharedListener(Arc<TcpListener>);

impl SharedListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self(Arc::new(TcpListener::bind(addr).await?)))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.0.accept().await
    }
}

impl axum::serve::Listener for SharedListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.0.accept().await {
                Ok(accepted) => return accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.0.local_addr()
    }
}

/// Accept and immediately close every connection until `shutdown` fires.
///
/// Clients of a standby see an explicit close instead of "connection refused".
pub fn spawn_rejecting(
    service: String,
    listener: SharedListener,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(service = %service, %peer, "Rejected connection on standby port");
                        drop(stream);
                    }
                    Err(e) => {
                        warn!(service = %service, error = %e, "Rejecting listener accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::shutdown_signal;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_rejecting_loop_closes_connections() {
        let listener = SharedListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, signal) = shutdown_signal();
        let task = spawn_rejecting("test".into(), listener, signal);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // Closed by the server: EOF or reset, never data.
        let read = stream.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));

        handle.trigger();
        task.await.unwrap();
    }
}
