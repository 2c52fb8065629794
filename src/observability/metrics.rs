//! Metrics collection and exposition.
//!
//! # Metrics
//! - `stream_server_connections_accepted_total` (counter): by `secure`
//! - `stream_server_connections_rejected_total` (counter): refused by admission
//! - `stream_server_handshake_failures_total` (counter): by `reason`
//! - `stream_server_requests_total` (counter): by `outcome`
//! - `stream_server_active_connections` (gauge): connections owned by a task
//!
//! Recording is a no-op until a recorder is installed.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// How a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_accepted(secure: bool) {
    metrics::counter!(
        "stream_server_connections_accepted_total",
        "secure" => if secure { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_rejected() {
    metrics::counter!("stream_server_connections_rejected_total").increment(1);
}

pub fn record_handshake_failure(reason: &'static str) {
    metrics::counter!("stream_server_handshake_failures_total", "reason" => reason).increment(1);
}

pub fn record_outcome(outcome: Outcome) {
    metrics::counter!("stream_server_requests_total", "outcome" => outcome.as_str()).increment(1);
}

pub fn connection_opened() {
    metrics::gauge!("stream_server_active_connections").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("stream_server_active_connections").decrement(1.0);
}
