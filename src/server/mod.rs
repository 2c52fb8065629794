//! Stream server engine.
//!
//! # Data Flow
//! ```text
//! start()
//!     → core.rs (bind, listen, spawn the "serve" task)
//!     → acceptor.rs / secure.rs (next connection, TLS handshake if secure)
//!     → hooks.rs (verify_request, then process_request in its own task)
//!     → request_handler.rs (optional setup → handle → finish per connection)
//!     → close_request
//! ```
//!
//! # Design Decisions
//! - Hooks and acquisition are separate traits; the TLS server only swaps the acceptor
//! - The accept loop never waits for a connection task
//! - Connection failures stay inside their task

pub mod acceptor;
pub mod core;
pub mod error;
pub mod hooks;
pub mod request_handler;
pub mod secure;
pub mod state;

pub use acceptor::{Acceptor, PlainAcceptor};
pub use core::{SecureTcpServer, StreamServer, TcpServer, SERVE_TASK};
pub use error::{RequestError, ServerError};
pub use hooks::{ServerContext, StreamHandler};
pub use request_handler::RequestHandler;
pub use secure::TlsAcceptor;
pub use state::{Lifecycle, ServerState};
