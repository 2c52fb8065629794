//! Server and request error types.

use std::any::Any;
use std::io;
use std::net::SocketAddr;

use crate::sync::Cancelled;

/// Failure to bring a server up.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server cannot bind to {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("server cannot listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    #[error("server is already running")]
    AlreadyRunning,
}

/// Failure while processing a single connection.
///
/// `Cancelled` is kept apart from the other variants: the server runs the
/// shutdown and close hooks for it and then ends the task as cancelled
/// instead of reporting an error.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl RequestError {
    /// Wrap an arbitrary handler error.
    pub fn failed(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        RequestError::Failed(error.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        RequestError::Panicked(message)
    }
}

impl From<Cancelled> for RequestError {
    fn from(_: Cancelled) -> Self {
        RequestError::Cancelled
    }
}
