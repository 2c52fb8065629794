//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Server core, acceptors, connection tasks produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and the active connection gauge)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
