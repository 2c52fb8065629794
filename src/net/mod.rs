//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → transport.rs (bind, listen, accept until closed)
//!     → tls.rs (server configuration for the optional handshake)
//!     → connection.rs (SocketLike wrapper, IDs, live connection count)
//!     → Hand off to the server core
//! ```
//!
//! # Design Decisions
//! - Unbounded accept; the kernel backlog is the only queue
//! - Closing the transport is how the accept loop is told to stop
//! - TLS is optional and hidden behind `SocketLike`

pub mod connection;
pub mod tls;
pub mod transport;

pub use connection::{ConnectionId, ConnectionTracker, IoStream, SocketLike};
pub use transport::{TcpTransport, Transport};
