//! One-shot shutdown signal shared by every long-running server loop.
//!
//! The handle side triggers shutdown either explicitly or by being dropped, so a
//! loop can never outlive the component that owns it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

pub fn shutdown_signal() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: oneshot::Sender<()>,
}

impl ShutdownHandle {
    pub fn trigger(self) {
        // The loop may already be gone; that is the state we want anyway.
        let _ = self.tx.send(());
    }
}

#[derive(Debug)]
pub struct ShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);

        match rx.poll(cx) {
            Poll::Pending => Poll::Pending,
            // We don't care if the handle sent a value or was dropped
            Poll::Ready(_) => Poll::Ready(()),
        }
    }
}
