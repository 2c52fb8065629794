//! Object-per-connection request handling.
//!
//! Instead of putting all logic in [`StreamHandler::process_request`], a
//! server can build a [`RequestHandler`] for each connection and call
//! [`RequestHandler::run`]:
//!
//! ```ignore
//! async fn process_request(&self, request: &mut SocketLike<S>, server: &ServerContext)
//!     -> Result<(), RequestError>
//! {
//!     Echo { request, server }.run().await
//! }
//! ```
//!
//! [`StreamHandler::process_request`]: crate::server::StreamHandler::process_request

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;

use crate::net::{IoStream, SocketLike};
use crate::server::error::RequestError;
use crate::server::hooks::ServerContext;

/// Three-phase handling of one connection: `setup`, `handle`, `finish`.
#[async_trait]
pub trait RequestHandler<S: IoStream>: Send {
    /// The connection being handled.
    fn request(&mut self) -> &mut SocketLike<S>;

    /// The server that accepted the connection.
    fn server(&self) -> &ServerContext;

    async fn setup(&mut self) -> Result<(), RequestError> {
        Ok(())
    }

    async fn handle(&mut self) -> Result<(), RequestError> {
        Ok(())
    }

    /// Always runs after `handle`, even when it failed. Closes the connection by default.
    async fn finish(&mut self) -> Result<(), RequestError> {
        self.request().close().await?;
        Ok(())
    }

    /// Run the three phases.
    ///
    /// A failure or panic in `handle` is logged and swallowed once `finish`
    /// has run; only a `finish` failure is returned. Cancellation is the
    /// exception: `finish` runs and `Cancelled` is returned. A `setup`
    /// failure is returned as is, without `handle` or `finish`.
    async fn run(&mut self) -> Result<(), RequestError> {
        self.setup().await?;

        let handled = match AssertUnwindSafe(self.handle()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(RequestError::from_panic(panic)),
        };

        self.finish().await?;

        match handled {
            Ok(()) => Ok(()),
            Err(RequestError::Cancelled) => Err(RequestError::Cancelled),
            Err(error) => {
                let request = self.request();
                tracing::warn!(
                    connection_id = %request.id(),
                    error = %error,
                    "Request handler failed"
                );
                Ok(())
            }
        }
    }
}
