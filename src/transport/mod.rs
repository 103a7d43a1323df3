//! Transport seam between the executor and the wire.
//!
//! The core never talks to sockets directly; it drives a [`Transport`] that
//! opens connections and a [`Connection`] that exchanges raw bytes. Every
//! connection carries a first-class [`CancelHandle`] so a supervisor can
//! force-close it from outside the caller's own call stack.

pub mod tcp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::pool::Route;

pub use tcp::TcpTransport;

/// Error types for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The armed byte-gap timer elapsed before the next chunk arrived.
    #[error("timed out waiting for data")]
    TimedOut,

    /// The connection's [`CancelHandle`] was tripped mid-operation.
    #[error("exchange cancelled")]
    Cancelled,

    /// The transport cannot serve this route at all.
    #[error("unsupported route: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One slice of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Response bytes; more may follow.
    Data(Bytes),

    /// The current response is complete. Whether the connection can carry
    /// another exchange afterwards is reported by [`Connection::is_reusable`].
    End,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Handle that force-terminates a connection's pending and future I/O.
///
/// Cancellation is sticky: once tripped, every in-flight and subsequent
/// operation on the connection fails with [`TransportError::Cancelled`], and
/// the pool retires the connection on release. Cloning shares the underlying
/// flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the handle, waking every task currently parked in [`cancelled`].
    ///
    /// [`cancelled`]: CancelHandle::cancelled
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the handle has been tripped.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A single reusable transport-level connection bound to one route.
#[async_trait]
pub trait Connection: Send {
    /// Handle that aborts this connection's I/O when tripped.
    fn cancel_handle(&self) -> CancelHandle;

    /// Whether the connection can carry another exchange after the current
    /// response ended. An EOF-delimited response leaves nothing to reuse.
    fn is_reusable(&self) -> bool;

    /// Write a complete request. Starting a write begins a new exchange.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Read the next slice of the response.
    ///
    /// `timeout` bounds the gap until the next bytes arrive, not the total
    /// read; `None` may block indefinitely.
    async fn read_chunk(&mut self, timeout: Option<Duration>) -> Result<Chunk, TransportError>;

    /// Close the connection. Dropping has the same effect; this variant
    /// flushes the shutdown.
    async fn close(&mut self);
}

/// Factory for outbound connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection + Send + 'static;

    /// Establish a new connection to `route`, bounded by `connect_timeout`.
    async fn open(
        &self,
        route: &Route,
        connect_timeout: Duration,
    ) -> Result<Self::Conn, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_handle_is_sticky() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());

        handle.cancel();
        assert!(handle.is_cancelled());

        // already-cancelled handles resolve immediately
        handle.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();

        let task = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.cancel();
        task.await.unwrap();
    }
}
