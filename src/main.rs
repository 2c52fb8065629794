//! stream-server: echo server on top of the stream server engine.
//!
//! ```text
//! stream-server [--config server.toml] [--address 0.0.0.0] [--port 8000]
//!               [--tls [--tls-cert cert.pem --tls-key key.pem]] [--log-level info]
//! ```
//!
//! Every connection gets back whatever it sends until it closes its side.
//! With `--tls` and no certificate, a self-signed one for `localhost` is generated.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stream_server::config::{load_config, validation::validate_config, Config, ConfigError, TlsConfig};
use stream_server::lifecycle::shutdown_signal;
use stream_server::net::{tls, IoStream, SocketLike, Transport};
use stream_server::observability::{logging::init_logging, metrics::init_metrics};
use stream_server::server::{
    Acceptor, RequestError, RequestHandler, ServerContext, ServerState, StreamHandler,
};
use stream_server::{SecureTcpServer, StreamServer, TcpServer};

/// How long connections get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "stream-server")]
#[command(about = "Echo server built on the stream server engine", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(short, long)]
    address: Option<IpAddr>,

    /// Port to bind (0 picks one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Serve TLS
    #[arg(long)]
    tls: bool,

    /// PEM certificate chain
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load the file configuration, if any, and apply command line overrides.
    fn into_config(self) -> Result<(Config, bool), ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };

        if let Some(address) = self.address {
            config.server.bind_address = address;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if let (Some(cert), Some(key)) = (self.tls_cert, self.tls_key) {
            config.tls = Some(TlsConfig {
                cert_path: cert.display().to_string(),
                key_path: key.display().to_string(),
            });
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        let secure = self.tls || config.tls.is_some();
        Ok((config, secure))
    }
}

/// Accepts every connection and echoes it.
struct EchoService;

#[async_trait::async_trait]
impl<S: IoStream> StreamHandler<S> for EchoService {
    async fn process_request(
        &self,
        request: &mut SocketLike<S>,
        server: &ServerContext,
    ) -> Result<(), RequestError> {
        Echo { request, server }.run().await
    }

    async fn handle_error(&self, request: &mut SocketLike<S>, error: &RequestError) {
        tracing::warn!(peer_addr = %request.peer_addr(), error = %error, "Echo failed");
    }
}

/// One echoed connection.
struct Echo<'a, S> {
    request: &'a mut SocketLike<S>,
    server: &'a ServerContext,
}

#[async_trait::async_trait]
impl<'a, S: IoStream> RequestHandler<S> for Echo<'a, S> {
    fn request(&mut self) -> &mut SocketLike<S> {
        self.request
    }

    fn server(&self) -> &ServerContext {
        self.server
    }

    async fn setup(&mut self) -> Result<(), RequestError> {
        tracing::debug!(
            connection_id = %self.request.id(),
            peer_addr = %self.request.peer_addr(),
            secure = self.server.is_secure(),
            "Echo session opened"
        );
        Ok(())
    }

    async fn handle(&mut self) -> Result<(), RequestError> {
        let mut buf = [0u8; 8192];
        let mut echoed = 0u64;
        loop {
            let n = self.request.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.request.write_all(&buf[..n]).await?;
            echoed += n as u64;
        }
        tracing::debug!(connection_id = %self.request.id(), bytes = echoed, "Echo session finished");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (config, secure) = cli.into_config()?;

    init_logging(&config.observability.log_level);
    tracing::info!("stream-server v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        bind_address = %config.server.bind_address,
        port = config.server.port,
        request_queue_size = config.server.request_queue_size,
        secure,
        "Configuration loaded"
    );

    if secure {
        let tls_config = match &config.tls {
            Some(files) => tls::load_tls_config(Path::new(&files.cert_path), Path::new(&files.key_path))?,
            None => tls::self_signed(&["localhost"])?.config,
        };
        serve(SecureTcpServer::secure(config.server, tls_config, EchoService)).await?;
    } else {
        serve(TcpServer::tcp(config.server, EchoService)).await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve<T, A, H>(server: StreamServer<T, A, H>) -> Result<(), Box<dyn std::error::Error>>
where
    T: Transport,
    A: Acceptor<T>,
    H: StreamHandler<T::Stream>,
{
    server.start()?;
    if let Some(addr) = server.local_addr() {
        tracing::info!(address = %addr, "Listening for connections");
    }

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server.lifecycle().wait_for(ServerState::Closed) => {
            tracing::warn!("Accept loop ended on its own");
        }
    }

    server.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
