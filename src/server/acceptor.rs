//! Connection acquisition.
//!
//! The accept loop asks an [`Acceptor`] for the next usable connection.
//! `PlainAcceptor` hands out raw streams; the TLS variant lives in
//! [`crate::server::secure`].

use async_trait::async_trait;

use crate::net::{SocketLike, Transport};

/// Produces the next connection for the accept loop.
#[async_trait]
pub trait Acceptor<T: Transport>: Send + Sync + 'static {
    /// Wait for the next connection. `None` means the transport is gone and
    /// the accept loop should end.
    async fn get_request(&self, transport: &T) -> Option<SocketLike<T::Stream>>;

    /// Whether produced connections are TLS-wrapped.
    fn is_secure(&self) -> bool {
        false
    }
}

/// Accepts raw connections as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAcceptor;

#[async_trait]
impl<T: Transport> Acceptor<T> for PlainAcceptor {
    async fn get_request(&self, transport: &T) -> Option<SocketLike<T::Stream>> {
        match transport.accept().await {
            Ok((stream, peer_addr)) => Some(SocketLike::plain(stream, peer_addr)),
            Err(e) => {
                tracing::debug!(error = %e, "Accept failed, ending accept loop");
                None
            }
        }
    }
}
