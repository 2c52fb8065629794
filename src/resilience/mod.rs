//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! TLS handshake attempt in the accept loop:
//!     → handshake timeout (acceptor)
//!     → On failure: backoff.rs (count consecutive failures, pace the next accept)
//!     → On success: connection handed out, next acquisition starts from zero
//! ```

pub mod backoff;

pub use backoff::{calculate_backoff, FailureBackoff};
