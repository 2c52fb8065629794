//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → Config (validated)
//!     → ServerConfig handed to StreamServer, held in an ArcSwap
//!
//! Setters on a live server:
//!     → swap in a modified ServerConfig
//!     → picked up by the next bind cycle only
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{Config, HandshakeConfig, ObservabilityConfig, ServerConfig, TlsConfig};
