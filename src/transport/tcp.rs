//! Plain-TCP transport.
//!
//! Speaks raw bytes over a tokio [`TcpStream`] with the connector tuning the
//! rest of the crate expects: connect timeout, `TCP_NODELAY`, and TCP
//! keepalive. Responses are delimited by `Content-Length` when the peer
//! supplies one, ending the exchange without closing the socket so the
//! connection can be pooled again; otherwise the response ends at EOF and the
//! connection is not reusable. TLS negotiation is out of scope: `https`
//! routes are refused.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::pool::{Route, Scheme};

use super::{CancelHandle, Chunk, Connection, Transport, TransportError};

/// Header block larger than this is treated as a transport error.
const MAX_HEADER_BYTES: usize = 64 * 1024;

const READ_BUF_BYTES: usize = 8 * 1024;

/// TCP connection factory with tuned socket defaults.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(90)),
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Conn = TcpConnection;

    async fn open(
        &self,
        route: &Route,
        connect_timeout: Duration,
    ) -> Result<Self::Conn, TransportError> {
        if route.scheme() == Scheme::Https {
            return Err(TransportError::Unsupported(format!(
                "{route}: TLS is not handled by the TCP transport"
            )));
        }

        let addr = route.authority();
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::TimedOut)??;

        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        if let Some(interval) = self.keepalive {
            let sock = socket2::SockRef::from(&stream);
            sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(interval))?;
        }

        debug!(route = %route, addr = %addr, "opened TCP connection");

        Ok(TcpConnection {
            stream,
            cancel: CancelHandle::new(),
            framing: Framing::Idle,
            reusable: false,
        })
    }
}

/// Response delimiting state for the exchange in progress.
#[derive(Debug)]
enum Framing {
    /// No exchange in progress.
    Idle,
    /// Accumulating header bytes until the blank line.
    Headers { scanned: Vec<u8> },
    /// Counting body bytes down to the end of the response.
    Body { remaining: Option<u64>, keep_alive: bool },
    /// Current response fully delivered.
    Done,
}

/// One pooled TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    cancel: CancelHandle,
    framing: Framing,
    reusable: bool,
}

#[async_trait]
impl Connection for TcpConnection {
    fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn is_reusable(&self) -> bool {
        self.reusable
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.framing = Framing::Headers {
            scanned: Vec::new(),
        };
        self.reusable = false;

        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            res = self.stream.write_all(buf) => {
                res?;
                Ok(())
            }
        }
    }

    async fn read_chunk(&mut self, timeout: Option<Duration>) -> Result<Chunk, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if matches!(self.framing, Framing::Done) {
            return Ok(Chunk::End);
        }

        let mut buf = BytesMut::with_capacity(READ_BUF_BYTES);
        let cancel = self.cancel.clone();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            res = read_with_timeout(&mut self.stream, &mut buf, timeout) => res?,
        };

        if n == 0 {
            return self.handle_eof();
        }

        let bytes = buf.freeze();
        self.consume(&bytes)?;
        Ok(Chunk::Data(bytes))
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl TcpConnection {
    /// Advance the framing state over newly received bytes.
    fn consume(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match &mut self.framing {
            Framing::Headers { scanned } => {
                // resume the terminator scan just before the previous tail
                let scan_from = scanned.len().saturating_sub(3);
                scanned.extend_from_slice(bytes);
                if scanned.len() > MAX_HEADER_BYTES {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response header block too large",
                    )));
                }
                if let Some(pos) = find_header_end(&scanned[scan_from..]) {
                    let header_end = scan_from + pos + 4;
                    let header = &scanned[..header_end];
                    let content_length = header_value(header, "content-length")
                        .and_then(|v| v.parse::<u64>().ok());
                    let keep_alive = !header_value(header, "connection")
                        .map(|v| v.eq_ignore_ascii_case("close"))
                        .unwrap_or(false);
                    let body_seen = (scanned.len() - header_end) as u64;
                    self.framing = match content_length {
                        Some(len) => Framing::Body {
                            remaining: Some(len.saturating_sub(body_seen)),
                            keep_alive,
                        },
                        // no length header: the response runs to EOF
                        None => Framing::Body {
                            remaining: None,
                            keep_alive: false,
                        },
                    };
                    self.check_body_complete();
                }
                Ok(())
            }
            Framing::Body { remaining, .. } => {
                if let Some(rem) = remaining {
                    *rem = rem.saturating_sub(bytes.len() as u64);
                }
                self.check_body_complete();
                Ok(())
            }
            Framing::Idle | Framing::Done => Ok(()),
        }
    }

    fn check_body_complete(&mut self) {
        if let Framing::Body {
            remaining: Some(0),
            keep_alive,
        } = self.framing
        {
            self.framing = Framing::Done;
            self.reusable = keep_alive;
        }
    }

    fn handle_eof(&mut self) -> Result<Chunk, TransportError> {
        match &self.framing {
            // EOF is the legitimate end of a length-less response
            Framing::Body {
                remaining: None, ..
            } => {
                self.framing = Framing::Done;
                self.reusable = false;
                Ok(Chunk::End)
            }
            Framing::Body {
                remaining: Some(_), ..
            }
            | Framing::Headers { .. } => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before the response completed",
            ))),
            Framing::Idle | Framing::Done => {
                self.reusable = false;
                Ok(Chunk::End)
            }
        }
    }
}

async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    timeout: Option<Duration>,
) -> Result<usize, TransportError> {
    match timeout {
        Some(t) => tokio::time::timeout(t, stream.read_buf(buf))
            .await
            .map_err(|_| TransportError::TimedOut)?
            .map_err(TransportError::Io),
        None => stream.read_buf(buf).await.map_err(TransportError::Io),
    }
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Pull one header value out of a raw header block, case-insensitively.
fn header_value<'a>(header: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(header).ok()?;
    for line in text.split("\r\n").skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Build a minimal GET request for `route` suitable for this transport.
pub fn get_request(route: &Route, path: &str) -> Bytes {
    Bytes::from(format!(
        "GET {path} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
        route.authority()
    ))
}
