//! Scriptable in-memory transport used by the integration tests.
//!
//! Each opened connection gets a process-unique id, and each exchange is
//! produced by a script closure given `(connection_id, exchange_index)`.
//! Embedding the connection id in the response lets tests assert which
//! physical connection served a request, the way a real peer cannot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use wirepool::pool::Route;
use wirepool::transport::{CancelHandle, Chunk, Connection, Transport, TransportError};

/// One scripted response: chunks with the gap preceding each, then whether
/// the connection survives for another exchange.
#[derive(Debug, Clone)]
pub struct MockExchange {
    pub chunks: Vec<(Duration, Bytes)>,
    pub reusable: bool,
}

impl MockExchange {
    /// Immediate single-chunk response naming the connection that served it.
    pub fn instant(conn_id: usize) -> Self {
        Self {
            chunks: vec![(Duration::ZERO, Bytes::from(format!("conn-{conn_id}")))],
            reusable: true,
        }
    }

    /// `count` chunks spaced `gap` apart.
    pub fn trickle(conn_id: usize, count: usize, gap: Duration) -> Self {
        Self {
            chunks: (0..count)
                .map(|i| (gap, Bytes::from(format!("conn-{conn_id}-chunk-{i}"))))
                .collect(),
            reusable: true,
        }
    }

    /// Single response delayed by `delay`.
    pub fn delayed(conn_id: usize, delay: Duration) -> Self {
        Self {
            chunks: vec![(delay, Bytes::from(format!("conn-{conn_id}")))],
            reusable: true,
        }
    }
}

type Script = dyn Fn(usize, usize) -> MockExchange + Send + Sync;

/// Transport whose connections replay scripted exchanges.
#[derive(Clone)]
pub struct MockTransport {
    opened: Arc<AtomicUsize>,
    connect_delay: Duration,
    script: Arc<Script>,
}

impl MockTransport {
    pub fn new(script: impl Fn(usize, usize) -> MockExchange + Send + Sync + 'static) -> Self {
        Self {
            opened: Arc::new(AtomicUsize::new(0)),
            connect_delay: Duration::ZERO,
            script: Arc::new(script),
        }
    }

    /// Transport answering every request immediately.
    pub fn instant() -> Self {
        Self::new(|conn_id, _| MockExchange::instant(conn_id))
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// How many connections have been opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Conn = MockConnection;

    async fn open(
        &self,
        _route: &Route,
        connect_timeout: Duration,
    ) -> Result<Self::Conn, TransportError> {
        if self.connect_delay > connect_timeout {
            tokio::time::sleep(connect_timeout).await;
            return Err(TransportError::TimedOut);
        }
        tokio::time::sleep(self.connect_delay).await;
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id,
            exchanges: 0,
            cancel: CancelHandle::new(),
            pending: VecDeque::new(),
            reusable: true,
            script: Arc::clone(&self.script),
        })
    }
}

pub struct MockConnection {
    id: usize,
    exchanges: usize,
    cancel: CancelHandle,
    pending: VecDeque<(Duration, Bytes)>,
    reusable: bool,
    script: Arc<Script>,
}

#[async_trait]
impl Connection for MockConnection {
    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn is_reusable(&self) -> bool {
        self.reusable
    }

    async fn write_all(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let exchange = (self.script)(self.id, self.exchanges);
        self.exchanges += 1;
        self.pending = exchange.chunks.into();
        self.reusable = exchange.reusable;
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Option<Duration>) -> Result<Chunk, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let Some((gap, bytes)) = self.pending.pop_front() else {
            return Ok(Chunk::End);
        };

        // the byte-gap timer loses when it is shorter than the gap
        let wait = match timeout {
            Some(t) if t < gap => {
                self.pending.push_front((gap, bytes));
                self.sleep_or_cancel(t).await?;
                return Err(TransportError::TimedOut);
            }
            _ => gap,
        };
        self.sleep_or_cancel(wait).await?;
        Ok(Chunk::Data(bytes))
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.reusable = false;
    }
}

impl MockConnection {
    async fn sleep_or_cancel(&self, duration: Duration) -> Result<(), TransportError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Extract the `conn-N` prefix a [`MockExchange`] response starts with.
pub fn served_by(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.split("-chunk-").next().unwrap_or(&text).to_string()
}
