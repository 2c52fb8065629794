//! Generic stream server engine.
//!
//! Binds a listening endpoint, runs an accept loop as a supervised task and
//! serves every connection in its own task. Plain TCP and TLS are provided;
//! per-connection behavior comes from a [`StreamHandler`].

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod server;
pub mod sync;

pub use config::Config;
pub use net::SocketLike;
pub use server::{
    RequestError, RequestHandler, SecureTcpServer, ServerContext, ServerError, ServerState,
    StreamHandler, StreamServer, TcpServer,
};
pub use sync::{Event, TaskGroup};
