//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! SIGTERM/SIGINT → signals.rs → binary calls server.shutdown(grace) → exit
//! ```

pub mod signals;

pub use signals::shutdown_signal;
