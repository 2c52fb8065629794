//! Listening transports.
//!
//! # Responsibilities
//! - Bind to the configured address with the configured reuse option
//! - Listen with the configured backlog
//! - Accept incoming connections until closed
//! - Make a pending accept fail promptly when the transport is closed

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

use crate::net::connection::IoStream;

/// The listening side of a stream transport.
///
/// `bind`, `listen` and `close` never suspend; `accept` is the only
/// suspension point and must return an error once `close` has been called.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream produced for every accepted connection.
    type Stream: IoStream;

    /// Bind to `addr`. Fails if the transport is already bound.
    fn bind(&self, addr: SocketAddr, reuse_address: bool) -> io::Result<()>;

    /// Start listening with the given backlog. Requires a prior `bind`.
    fn listen(&self, backlog: u32) -> io::Result<()>;

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Close the listening endpoint. Idempotent.
    fn close(&self);

    /// Address actually bound, if any.
    fn local_addr(&self) -> Option<SocketAddr>;
}

enum State {
    Unbound,
    Bound(TcpSocket),
    Listening {
        listener: Arc<TcpListener>,
        // Dropped on close, which wakes every pending accept.
        closed: watch::Sender<()>,
    },
}

/// TCP transport backed by tokio sockets.
pub struct TcpTransport {
    state: Mutex<State>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Unbound),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn bind(&self, addr: SocketAddr, reuse_address: bool) -> io::Result<()> {
        let mut state = self.state();
        if !matches!(*state, State::Unbound) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "transport is already bound",
            ));
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(reuse_address)?;
        socket.bind(addr)?;

        tracing::debug!(address = %addr, reuse_address, "Transport bound");
        *state = State::Bound(socket);
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        let mut state = self.state();
        let socket = match std::mem::replace(&mut *state, State::Unbound) {
            State::Bound(socket) => socket,
            other => {
                *state = other;
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "transport must be bound before listening",
                ));
            }
        };

        let listener = socket.listen(backlog)?;
        let (closed, _) = watch::channel(());
        *state = State::Listening {
            listener: Arc::new(listener),
            closed,
        };
        Ok(())
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (listener, mut closed) = match &*self.state() {
            State::Listening { listener, closed } => (Arc::clone(listener), closed.subscribe()),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "transport is not listening",
                ))
            }
        };

        tokio::select! {
            accepted = listener.accept() => accepted,
            _ = closed.changed() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transport closed",
            )),
        }
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.state(), State::Unbound);
        if !matches!(previous, State::Unbound) {
            tracing::debug!("Transport closed");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state() {
            State::Unbound => None,
            State::Bound(socket) => socket.local_addr().ok(),
            State::Listening { listener, .. } => listener.local_addr().ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn accepts_connections() {
        let transport = TcpTransport::new();
        transport.bind(any_port(), true).unwrap();
        transport.listen(16).unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (_stream, peer) = transport.accept().await.unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn close_wakes_pending_accept() {
        let transport = Arc::new(TcpTransport::new());
        transport.bind(any_port(), true).unwrap();
        transport.listen(16).unwrap();

        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.accept().await })
        };
        tokio::task::yield_now().await;

        transport.close();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept should return after close")
            .unwrap();
        assert!(result.is_err());
        assert!(transport.local_addr().is_none());

        // Closing twice is fine.
        transport.close();
    }

    #[tokio::test]
    async fn double_bind_fails() {
        let transport = TcpTransport::new();
        transport.bind(any_port(), true).unwrap();
        assert!(transport.bind(any_port(), true).is_err());
    }

    #[tokio::test]
    async fn listen_requires_bind() {
        let transport = TcpTransport::new();
        assert!(transport.listen(16).is_err());
        assert!(transport.accept().await.is_err());
    }

    #[tokio::test]
    async fn rebinds_after_close() {
        let transport = TcpTransport::new();
        transport.bind(any_port(), true).unwrap();
        transport.listen(16).unwrap();
        transport.close();

        transport.bind(any_port(), true).unwrap();
        transport.listen(16).unwrap();
        assert!(transport.local_addr().is_some());
    }
}
