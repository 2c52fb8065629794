//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listening endpoint and accept loop settings.
    pub server: ServerConfig,

    /// Optional TLS configuration. When absent the server speaks plain TCP.
    pub tls: Option<TlsConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listening endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: IpAddr,

    /// Port to bind. `0` picks an ephemeral port.
    pub port: u16,

    /// Listen backlog.
    pub request_queue_size: u32,

    /// Set `SO_REUSEADDR` before binding.
    pub allow_reuse_address: bool,

    /// TLS handshake pacing (secure servers only).
    pub handshake: HandshakeConfig,
}

impl ServerConfig {
    pub fn new(bind_address: IpAddr, port: u16) -> Self {
        Self {
            bind_address,
            port,
            ..Self::default()
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            request_queue_size: 100,
            allow_reuse_address: true,
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Limits applied to server-side TLS handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Handshake timeout in seconds. A timed out handshake counts as failed.
    pub timeout_secs: u64,

    /// Consecutive failures tolerated before the accept loop backs off.
    pub failures_before_backoff: u32,

    /// Base backoff delay in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum backoff delay in milliseconds.
    pub backoff_max_ms: u64,
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            failures_before_backoff: 16,
            backoff_base_ms: 10,
            backoff_max_ms: 1000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
