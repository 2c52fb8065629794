//! The accept/dispatch engine.
//!
//! # Responsibilities
//! - Bind and listen on the configured endpoint
//! - Run the accept loop as the single task named `"serve"`
//! - Spawn one task per admitted connection and never wait for it
//! - Contain every handler failure inside its connection task
//! - Publish lifecycle state (`started` / `stopped`, `ServerState`)
//!
//! # Shutdown ordering
//! ```text
//! stop()      → transport closed → accept fails → loop exits
//!             → transport closed (again, idempotent) → started cleared → stopped set
//! shutdown()  → stop() → wait for stopped → cancel connection tasks
//!             → each task: shutdown_request → close_request → Err(Cancelled)
//! last handle dropped → cancel every task (the accept loop included)
//! ```
//!
//! The accept loop closes the transport and publishes `Closed` however it
//! ends: clean exit, cancellation, abort or a panicking hook.

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::net::{ConnectionTracker, SocketLike, TcpTransport, Transport};
use crate::observability::metrics::{self, Outcome};
use crate::server::acceptor::{Acceptor, PlainAcceptor};
use crate::server::error::{RequestError, ServerError};
use crate::server::hooks::{ServerContext, StreamHandler};
use crate::server::secure::TlsAcceptor;
use crate::server::state::{Lifecycle, ServerState};
use crate::sync::{Cancelled, Event, GroupStats, TaskGroup, TaskResult};

/// Name of the accept loop task.
pub const SERVE_TASK: &str = "serve";

/// A plain TCP server.
pub type TcpServer<H> = StreamServer<TcpTransport, PlainAcceptor, H>;

/// A TLS server over TCP.
pub type SecureTcpServer<H> = StreamServer<TcpTransport, TlsAcceptor, H>;

/// A stream server: a transport, an acceptor and a set of hooks.
///
/// Cloning yields another handle to the same server. Dropping the last
/// handle cancels the accept loop and every connection task.
pub struct StreamServer<T, A, H> {
    inner: Arc<Inner<T, A, H>>,
    owner: Arc<Owner>,
}

/// Shared by user handles only; tasks hold `Inner` but never this.
struct Owner {
    operations: Arc<TaskGroup>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if !self.operations.is_empty() {
            tracing::debug!("Last server handle dropped, cancelling tasks");
        }
        self.operations.cancel();
    }
}

struct Inner<T, A, H> {
    /// Configuration used by the next bind.
    config: ArcSwap<ServerConfig>,
    /// Configuration the current endpoint was bound with.
    active: ArcSwap<ServerConfig>,
    transport: T,
    acceptor: A,
    handler: H,
    lifecycle: Lifecycle,
    operations: Arc<TaskGroup>,
    connections: ConnectionTracker,
}

impl<T, A, H> Clone for StreamServer<T, A, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: Arc::clone(&self.owner),
        }
    }
}

impl<H> StreamServer<TcpTransport, PlainAcceptor, H>
where
    H: StreamHandler<tokio::net::TcpStream>,
{
    /// A plain TCP server.
    pub fn tcp(config: ServerConfig, handler: H) -> Self {
        Self::new(config, TcpTransport::new(), PlainAcceptor, handler)
    }
}

impl<H> StreamServer<TcpTransport, TlsAcceptor, H>
where
    H: StreamHandler<tokio::net::TcpStream>,
{
    /// A TLS server over TCP. Handshake limits come from `config.handshake`.
    pub fn secure(config: ServerConfig, tls: Arc<RustlsConfig>, handler: H) -> Self {
        let acceptor = TlsAcceptor::new(tls).with_handshake_config(config.handshake.clone());
        Self::new(config, TcpTransport::new(), acceptor, handler)
    }

    /// Replace the TLS configuration for connections accepted from now on.
    pub fn set_tls_config(&self, tls: Arc<RustlsConfig>) {
        self.inner.acceptor.set_tls_config(tls);
    }

    pub fn tls_config(&self) -> Arc<RustlsConfig> {
        self.inner.acceptor.tls_config()
    }
}

impl<T, A, H> StreamServer<T, A, H>
where
    T: Transport,
    A: Acceptor<T>,
    H: StreamHandler<T::Stream>,
{
    pub fn new(config: ServerConfig, transport: T, acceptor: A, handler: H) -> Self {
        let config = Arc::new(config);
        let operations = Arc::new(TaskGroup::new());
        Self {
            owner: Arc::new(Owner {
                operations: Arc::clone(&operations),
            }),
            inner: Arc::new(Inner {
                active: ArcSwap::new(Arc::clone(&config)),
                config: ArcSwap::new(config),
                transport,
                acceptor,
                handler,
                lifecycle: Lifecycle::new(),
                operations,
                connections: ConnectionTracker::new(),
            }),
        }
    }

    /// Bind the listening endpoint.
    ///
    /// Lifecycle state is left alone; `start` and `run` publish it. A server
    /// driven through `bind`/`activate`/`get_request` directly stays `Idle`.
    pub fn bind(&self) -> Result<(), ServerError> {
        let config = self.inner.config.load_full();
        let addr = config.socket_addr();
        self.inner
            .transport
            .bind(addr, config.allow_reuse_address)
            .map_err(|source| {
                tracing::warn!(address = %addr, error = %source, "Server cannot bind");
                ServerError::Bind { addr, source }
            })?;
        self.inner.active.store(config);
        Ok(())
    }

    /// Start listening on the bound endpoint. Like `bind`, does not change the state.
    pub fn activate(&self) -> Result<(), ServerError> {
        let config = self.inner.active.load();
        let addr = config.socket_addr();
        self.inner
            .transport
            .listen(config.request_queue_size)
            .map_err(|source| {
                tracing::warn!(address = %addr, error = %source, "Server cannot listen");
                ServerError::Listen { addr, source }
            })
    }

    /// Close the listening endpoint. Idempotent.
    pub fn close(&self) {
        self.inner.transport.close();
    }

    /// Bind, listen and run the accept loop on the calling task until it ends.
    pub async fn run(&self) -> Result<(), ServerError> {
        if !self.inner.lifecycle.begin_binding() {
            return Err(ServerError::AlreadyRunning);
        }
        self.open()?;

        let cancel = self.inner.operations.cancellation_token();
        // Cancellation here came from `shutdown`, which already reports it.
        let _ = Arc::clone(&self.inner).serve_forever(cancel).await;
        Ok(())
    }

    /// Bind, listen and spawn the accept loop as the `"serve"` task.
    ///
    /// Returns immediately. Calling `start` on a running server is a no-op.
    pub fn start(&self) -> Result<(), ServerError> {
        let inner = &self.inner;
        if inner.lifecycle.started().is_set() || inner.operations.has(SERVE_TASK) {
            return Ok(());
        }
        if !inner.lifecycle.begin_binding() {
            return Ok(());
        }
        self.open()?;

        let serving = Arc::clone(inner);
        inner
            .operations
            .spawn_with_name(SERVE_TASK, move |cancel| serving.serve_forever(cancel));
        Ok(())
    }

    /// Close the listening endpoint so the accept loop exits.
    ///
    /// Connection tasks already spawned keep running.
    pub fn stop(&self) {
        tracing::debug!("Stop requested");
        self.close();
    }

    /// Stop accepting, then cancel every connection task.
    ///
    /// `grace` bounds the whole call: whatever the accept loop does not use
    /// of it is left for connection cleanup, and tasks still running at the
    /// deadline are aborted.
    pub async fn shutdown(&self, grace: Duration) -> GroupStats {
        let deadline = Instant::now() + grace;
        self.stop();
        if tokio::time::timeout_at(deadline, self.inner.lifecycle.stopped().wait())
            .await
            .is_err()
        {
            tracing::warn!("Accept loop still running after stop");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let stats = self.inner.operations.shutdown(remaining).await;
        tracing::info!(
            completed = stats.completed,
            cancelled = stats.cancelled,
            aborted = stats.aborted,
            panicked = stats.panicked,
            "Server shut down"
        );
        stats
    }

    /// The next connection from the acceptor, as the accept loop would see it.
    pub async fn get_request(&self) -> Option<SocketLike<T::Stream>> {
        self.inner.acceptor.get_request(&self.inner.transport).await
    }

    pub fn server_address(&self) -> IpAddr {
        self.inner.config.load().bind_address
    }

    pub fn server_port(&self) -> u16 {
        self.inner.config.load().port
    }

    /// Address actually bound, which differs from the configured one for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn request_queue_size(&self) -> u32 {
        self.inner.config.load().request_queue_size
    }

    /// Takes effect on the next start.
    pub fn set_request_queue_size(&self, size: u32) {
        self.update_config(|config| config.request_queue_size = size);
    }

    pub fn allow_reuse_address(&self) -> bool {
        self.inner.config.load().allow_reuse_address
    }

    /// Takes effect on the next start.
    pub fn set_allow_reuse_address(&self, allow: bool) {
        self.update_config(|config| config.allow_reuse_address = allow);
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.inner.config.load_full()
    }

    pub fn is_secure(&self) -> bool {
        self.inner.acceptor.is_secure()
    }

    pub fn state(&self) -> ServerState {
        self.inner.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    pub fn started(&self) -> &Event {
        self.inner.lifecycle.started()
    }

    pub fn stopped(&self) -> &Event {
        self.inner.lifecycle.stopped()
    }

    /// Connections currently owned by a connection task.
    pub fn active_connections(&self) -> u64 {
        self.inner.connections.active_count()
    }

    pub fn tasks(&self) -> &TaskGroup {
        &self.inner.operations
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    pub fn acceptor(&self) -> &A {
        &self.inner.acceptor
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    fn update_config(&self, apply: impl Fn(&mut ServerConfig)) {
        self.inner.config.rcu(|current| {
            let mut next = ServerConfig::clone(current);
            apply(&mut next);
            next
        });
        if self.inner.lifecycle.started().is_set() {
            tracing::debug!("Server configuration changed while running, applies on next start");
        }
    }

    /// Bind and listen, or close and report why not.
    fn open(&self) -> Result<(), ServerError> {
        match self.bind().and_then(|()| self.activate()) {
            Ok(()) => {
                self.inner.lifecycle.set_state(ServerState::Listening);
                Ok(())
            }
            Err(e) => {
                self.close();
                self.inner.lifecycle.set_state(ServerState::Closed);
                Err(e)
            }
        }
    }
}

impl<T, A, H> Inner<T, A, H>
where
    T: Transport,
    A: Acceptor<T>,
    H: StreamHandler<T::Stream>,
{
    async fn serve_forever(self: Arc<Self>, cancel: CancellationToken) -> TaskResult {
        self.lifecycle.enter_running();
        let _exit = LoopExit {
            transport: &self.transport,
            lifecycle: &self.lifecycle,
        };
        tracing::info!(
            address = ?self.transport.local_addr(),
            secure = self.acceptor.is_secure(),
            "Server running"
        );

        let mut result = Ok(());
        loop {
            let request = tokio::select! {
                request = self.acceptor.get_request(&self.transport) => request,
                _ = cancel.cancelled() => {
                    result = Err(Cancelled);
                    None
                }
            };
            let Some(request) = request else {
                break;
            };

            self.dispatch(request).await;

            if !self.handler.service_actions() {
                tracing::debug!("Service actions requested stop");
                break;
            }
        }

        result
    }

    async fn dispatch(self: &Arc<Self>, mut request: SocketLike<T::Stream>) {
        metrics::record_accepted(request.is_secure());

        if self.handler.verify_request(&request) {
            tracing::debug!(
                connection_id = %request.id(),
                peer_addr = %request.peer_addr(),
                "Connection accepted"
            );
            let inner = Arc::clone(self);
            self.operations
                .spawn(move |cancel| inner.handle_request(request, cancel));
        } else {
            tracing::debug!(
                connection_id = %request.id(),
                peer_addr = %request.peer_addr(),
                "Connection rejected"
            );
            metrics::record_rejected();
            self.handler.shutdown_request(&mut request).await;
            self.handler.close_request(&mut request).await;
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        mut request: SocketLike<T::Stream>,
        cancel: CancellationToken,
    ) -> TaskResult {
        let _guard = self.connections.track(request.id());
        let context = self.context();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
            processed = AssertUnwindSafe(self.handler.process_request(&mut request, &context)).catch_unwind() => {
                processed.unwrap_or_else(|panic| Err(RequestError::from_panic(panic)))
            }
        };

        match outcome {
            Ok(()) => {
                metrics::record_outcome(Outcome::Completed);
                self.handler.close_request(&mut request).await;
                Ok(())
            }
            Err(RequestError::Cancelled) => {
                tracing::debug!(connection_id = %request.id(), "Connection task cancelled");
                metrics::record_outcome(Outcome::Cancelled);
                self.handler.shutdown_request(&mut request).await;
                self.handler.close_request(&mut request).await;
                Err(Cancelled)
            }
            Err(error) => {
                tracing::error!(
                    connection_id = %request.id(),
                    peer_addr = %request.peer_addr(),
                    error = %error,
                    "Request processing failed"
                );
                metrics::record_outcome(Outcome::Failed);
                self.handler.handle_error(&mut request, &error).await;
                self.handler.shutdown_request(&mut request).await;
                self.handler.close_request(&mut request).await;
                Ok(())
            }
        }
    }

    fn context(&self) -> ServerContext {
        ServerContext::new(
            self.active.load_full(),
            self.transport.local_addr(),
            self.acceptor.is_secure(),
            self.lifecycle.clone(),
        )
    }
}

/// Tears the accept loop down when `serve_forever` ends, including by panic or abort.
struct LoopExit<'a, T: Transport> {
    transport: &'a T,
    lifecycle: &'a Lifecycle,
}

impl<T: Transport> Drop for LoopExit<'_, T> {
    fn drop(&mut self) {
        self.lifecycle.set_state(ServerState::Stopping);
        self.transport.close();
        self.lifecycle.enter_closed();
        if std::thread::panicking() {
            tracing::error!("Accept loop panicked, server stopped");
        } else {
            tracing::info!("Server stopped");
        }
    }
}
