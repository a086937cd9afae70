//! Transport layer abstraction for MQTT connections.
//!
//! The engine only needs an ordered duplex byte stream. [`Transport`] wraps
//! the supported stream kinds:
//! - TCP (plain)
//! - in-memory duplex pipes (tests, embedding)
//! - any caller-supplied `AsyncRead + AsyncWrite` stream
//!
//! A [`Connector`] opens a fresh transport for every (re)connection.
//! Encryption is left to caller-supplied streams.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Any stream usable as a transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A unified transport that wraps different connection types.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// In-memory pipe.
    Memory(DuplexStream),
    /// Caller-supplied stream.
    Custom(Box<dyn AsyncStream>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp(stream) => f.debug_tuple("Tcp").field(&stream.peer_addr().ok()).finish(),
            Transport::Memory(_) => f.write_str("Memory"),
            Transport::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Custom(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Custom(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Memory(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Custom(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Custom(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to the broker.
    async fn connect(&self) -> io::Result<Transport>;
}

/// Connects over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Create a connector for `host:port`, `tcp://host:port` or
    /// `mqtt://host:port`. The port defaults to 1883.
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self {
            addr: parse_addr(addr.as_ref()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

fn parse_addr(addr: &str) -> String {
    let host = addr
        .strip_prefix("tcp://")
        .or_else(|| addr.strip_prefix("mqtt://"))
        .unwrap_or(addr);
    let has_port = match host.rsplit_once(':') {
        // bracketed IPv6 without a port ends in ']'
        Some((_, port)) => !port.ends_with(']') && port.parse::<u16>().is_ok(),
        None => false,
    };
    if has_port {
        host.to_string()
    } else {
        format!("{host}:1883")
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Transport> {
        debug!("connecting to {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Tcp(stream))
    }
}

/// Hands out pre-built in-memory streams, one per connection attempt.
///
/// When no stream is queued, connecting fails with `ConnectionRefused`.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a client-side stream for the next connection attempt.
    pub fn push(&self, stream: DuplexStream) {
        self.streams.lock().push_back(stream);
    }

    /// Queue a new pipe and return its broker end.
    pub fn connection(&self, max_buf_size: usize) -> DuplexStream {
        let (client, broker) = tokio::io::duplex(max_buf_size);
        self.push(client);
        broker
    }

    /// Streams not yet handed out.
    pub fn pending(&self) -> usize {
        self.streams.lock().len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> io::Result<Transport> {
        self.streams
            .lock()
            .pop_front()
            .map(Transport::Memory)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no stream queued"))
    }
}
