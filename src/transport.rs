//! The binary message transport seam.
//!
//! The E2EE layer and everything above it speak to the outside world through
//! `MessageTransport` only. The WebSocket adapter in [`crate::ws`] is the
//! production implementation; [`memory`] provides an in-process pair for
//! tests and demos.
//!
//! Cancellation is structural: callers drop or `select!` away the returned
//! futures rather than passing a context argument.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FsResult;

/// One ordered, reliable, message-oriented byte pipe.
///
/// Implementations take `&self` so a send half and a receive half can be
/// driven from different tasks through one `Arc`.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Receive the next binary message. `Ok(None)` means the peer closed the
    /// transport cleanly.
    async fn recv_binary(&self) -> FsResult<Option<Bytes>>;

    /// Send one binary message.
    async fn send_binary(&self, payload: Bytes) -> FsResult<()>;

    /// Close the transport. Idempotent; best-effort.
    async fn close(&self);
}

/// In-memory transport pair over bounded channels. Mirrors the message
/// semantics of a WebSocket closely enough for full-stack tests.
pub mod memory {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    pub struct MemoryTransport {
        tx: Mutex<Option<mpsc::Sender<Bytes>>>,
        rx: Mutex<mpsc::Receiver<Bytes>>,
    }

    /// Build a connected pair. Messages sent on one side arrive on the other
    /// in order. Dropping or closing either side EOFs the peer.
    pub fn pair(capacity: usize) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let a = Arc::new(MemoryTransport {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
        });
        let b = Arc::new(MemoryTransport {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
        });
        (a, b)
    }

    #[async_trait]
    impl MessageTransport for MemoryTransport {
        async fn recv_binary(&self) -> FsResult<Option<Bytes>> {
            Ok(self.rx.lock().await.recv().await)
        }

        async fn send_binary(&self, payload: Bytes) -> FsResult<()> {
            use crate::error::{ErrorCode, FsError, Stage};
            let closed = || {
                FsError::new(Stage::Connect, ErrorCode::SendFailed)
                    .with_message("peer transport closed")
            };
            let tx = self.tx.lock().await.clone().ok_or_else(closed)?;
            tx.send(payload).await.map_err(|_| closed())
        }

        async fn close(&self) {
            // Dropping the sender EOFs the peer's receive loop.
            self.tx.lock().await.take();
            self.rx.lock().await.close();
        }
    }
}
