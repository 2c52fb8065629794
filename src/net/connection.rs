//! Accepted connections and their lifetime tracking.
//!
//! # Responsibilities
//! - Wrap plain and TLS streams behind one duplex type (`SocketLike`)
//! - Generate unique connection IDs for tracing
//! - Count live connections for introspection and metrics

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::server::TlsStream;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Byte streams a server can accept connections on.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

enum Transport<S> {
    Plain(S),
    Secure(Box<TlsStream<S>>),
}

/// An accepted connection, plain or TLS.
///
/// Reads and writes go straight to the underlying stream. `close` is
/// idempotent: only the first call shuts the stream down.
pub struct SocketLike<S> {
    transport: Transport<S>,
    id: ConnectionId,
    peer_addr: SocketAddr,
    closed: bool,
}

impl<S: IoStream> SocketLike<S> {
    /// Wrap a raw stream.
    pub fn plain(stream: S, peer_addr: SocketAddr) -> Self {
        Self::with_transport(Transport::Plain(stream), peer_addr)
    }

    /// Wrap a stream that completed a server-side TLS handshake.
    pub fn secure(stream: TlsStream<S>, peer_addr: SocketAddr) -> Self {
        Self::with_transport(Transport::Secure(Box::new(stream)), peer_addr)
    }

    fn with_transport(transport: Transport<S>, peer_addr: SocketAddr) -> Self {
        Self {
            transport,
            id: ConnectionId::new(),
            peer_addr,
            closed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the stream is TLS-wrapped.
    pub fn is_secure(&self) -> bool {
        matches!(self.transport, Transport::Secure(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The raw stream underneath any TLS layer.
    pub fn get_ref(&self) -> &S {
        match &self.transport {
            Transport::Plain(stream) => stream,
            Transport::Secure(stream) => stream.get_ref().0,
        }
    }

    /// Shut the stream down. Later calls are no-ops.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.transport {
            Transport::Plain(stream) => stream.shutdown().await,
            Transport::Secure(stream) => stream.shutdown().await,
        }
    }
}

impl<S> std::fmt::Debug for SocketLike<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLike")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("secure", &matches!(self.transport, Transport::Secure(_)))
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S: IoStream> AsyncRead for SocketLike<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Secure(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: IoStream> AsyncWrite for SocketLike<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Secure(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Secure(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Secure(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Counts connections currently owned by a task.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped, including when the owning task is aborted.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}
