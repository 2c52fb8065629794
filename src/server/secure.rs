//! TLS connection acquisition.
//!
//! # Responsibilities
//! - Accept raw connections and run the server side of the TLS handshake
//! - Drop connections whose handshake fails or times out, then accept the next one
//! - Back off when handshakes keep failing
//! - Allow the TLS configuration to be swapped while serving
//!
//! # Design Decisions
//! - A handshake failure is never reported to the accept loop; only a
//!   failing accept ends it
//! - The configuration is read once per connection, so a swap affects the
//!   next accepted connection and never one mid-handshake

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_rustls::rustls::ServerConfig as RustlsConfig;

use crate::config::HandshakeConfig;
use crate::net::tls::{self, TlsError};
use crate::net::{SocketLike, Transport};
use crate::observability::metrics;
use crate::resilience::FailureBackoff;
use crate::server::acceptor::Acceptor;

/// Accepts connections and completes a TLS handshake on each.
pub struct TlsAcceptor {
    config: ArcSwap<RustlsConfig>,
    handshake: HandshakeConfig,
}

impl TlsAcceptor {
    pub fn new(config: Arc<RustlsConfig>) -> Self {
        Self {
            config: ArcSwap::new(config),
            handshake: HandshakeConfig::default(),
        }
    }

    /// An acceptor with a freshly generated self-signed certificate for `localhost`.
    pub fn self_signed() -> Result<Self, TlsError> {
        Ok(Self::new(tls::self_signed(&["localhost"])?.config))
    }

    pub fn with_handshake_config(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Replace the TLS configuration used for subsequent handshakes.
    pub fn set_tls_config(&self, config: Arc<RustlsConfig>) {
        self.config.store(config);
        tracing::info!("TLS configuration replaced");
    }

    pub fn tls_config(&self) -> Arc<RustlsConfig> {
        self.config.load_full()
    }

    pub fn handshake_config(&self) -> &HandshakeConfig {
        &self.handshake
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Transport> Acceptor<T> for TlsAcceptor {
    async fn get_request(&self, transport: &T) -> Option<SocketLike<T::Stream>> {
        let mut backoff = FailureBackoff::from_config(&self.handshake);
        loop {
            let (raw, peer_addr) = match transport.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "Accept failed, ending accept loop");
                    return None;
                }
            };

            let acceptor = tokio_rustls::TlsAcceptor::from(self.config.load_full());
            let reason = match tokio::time::timeout(self.handshake.timeout(), acceptor.accept(raw)).await {
                Ok(Ok(stream)) => return Some(SocketLike::secure(stream, peer_addr)),
                Ok(Err(e)) => {
                    tracing::debug!(peer_addr = %peer_addr, error = %e, "TLS handshake failed");
                    "error"
                }
                Err(_) => {
                    tracing::debug!(
                        peer_addr = %peer_addr,
                        timeout_secs = self.handshake.timeout_secs,
                        "TLS handshake timed out"
                    );
                    "timeout"
                }
            };
            metrics::record_handshake_failure(reason);

            if let Some(delay) = backoff.record_failure() {
                tracing::warn!(
                    consecutive_failures = backoff.consecutive_failures(),
                    delay_ms = delay.as_millis() as u64,
                    "Repeated TLS handshake failures, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn is_secure(&self) -> bool {
        true
    }
}
