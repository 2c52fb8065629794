//! Per-connection override points.
//!
//! A concrete server implements [`StreamHandler`] and overrides only the
//! hooks it needs. Every hook has a default:
//!
//! | hook               | default                     |
//! |--------------------|-----------------------------|
//! | `verify_request`   | admit                       |
//! | `process_request`  | do nothing                  |
//! | `handle_error`     | do nothing                  |
//! | `shutdown_request` | do nothing                  |
//! | `close_request`    | close the connection        |
//! | `service_actions`  | keep serving                |

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::net::{IoStream, SocketLike};
use crate::server::error::RequestError;
use crate::server::state::{Lifecycle, ServerState};

/// Read-only view of the server a connection was accepted by.
#[derive(Debug, Clone)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
    local_addr: Option<SocketAddr>,
    secure: bool,
    lifecycle: Lifecycle,
}

impl ServerContext {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        local_addr: Option<SocketAddr>,
        secure: bool,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            config,
            local_addr,
            secure,
            lifecycle,
        }
    }

    /// Configuration the listening endpoint was bound with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server_address(&self) -> IpAddr {
        self.config.bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.config.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

/// Hooks the accept loop and connection tasks call into.
#[async_trait]
pub trait StreamHandler<S: IoStream>: Send + Sync + 'static {
    /// Admission control. A rejected connection is shut down and closed
    /// without spawning a task.
    fn verify_request(&self, _request: &SocketLike<S>) -> bool {
        true
    }

    /// Serve one connection. Runs in its own task.
    ///
    /// The server closes the connection afterwards, whatever the result.
    async fn process_request(
        &self,
        _request: &mut SocketLike<S>,
        _server: &ServerContext,
    ) -> Result<(), RequestError> {
        Ok(())
    }

    /// Called when `process_request` failed or panicked. Not called on cancellation.
    async fn handle_error(&self, _request: &mut SocketLike<S>, _error: &RequestError) {}

    /// Half-close hook, called before `close_request` on every abnormal path.
    async fn shutdown_request(&self, _request: &mut SocketLike<S>) {}

    /// Release the connection. Called exactly once per accepted connection.
    async fn close_request(&self, request: &mut SocketLike<S>) {
        if let Err(e) = request.close().await {
            tracing::debug!(
                connection_id = %request.id(),
                error = %e,
                "Error while closing connection"
            );
        }
    }

    /// Checked after every accept loop iteration; `false` stops the loop.
    fn service_actions(&self) -> bool {
        true
    }
}
