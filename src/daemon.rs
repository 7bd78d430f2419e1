/// Daemon process: handshake with the parent, then serve
///
/// The parent process talks to the daemon over stdout/stdin before any RPC
/// traffic happens. The daemon asks for a secret, waits for it, then reports
/// where it is listening.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::endpoints::register_builtins;
use crate::router::{Router, RouterConfig};
use crate::server::{ServePolicy, Server};
use crate::storage::DbPool;
use crate::ServerError;

/// Transport the daemon serves RPC traffic on
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportKind {
    Tcp,
    Http,
    Stdio,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Http => "http",
            TransportKind::Stdio => "stdio",
        }
    }
}

/// Lines exchanged with the parent process during startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    #[serde(rename = "daemon/secret-request")]
    SecretRequest {
        #[serde(rename = "minLength")]
        min_length: usize,
    },

    #[serde(rename = "daemon/secret-result")]
    SecretResult { secret: String },

    #[serde(rename = "daemon/listen-notification")]
    ListenNotification { transport: String, address: String },
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub transport: TransportKind,
    /// Address to bind for the tcp and http transports
    pub address: String,
    /// Keep accepting TCP connections after the first one
    pub keep_alive: bool,
    /// SQLite database leased to handlers. No database when `None`.
    pub database: Option<PathBuf>,
    pub db_pool_size: usize,
    pub secret_timeout: Duration,
    pub min_secret_length: usize,
    pub shutdown_log_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            address: "127.0.0.1:0".to_string(),
            keep_alive: false,
            database: None,
            db_pool_size: 4,
            secret_timeout: Duration::from_secs(15),
            min_secret_length: 256,
            shutdown_log_interval: Duration::from_secs(5),
        }
    }
}

async fn send<W>(writer: &mut W, message: &DaemonMessage) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read lines until a secret result shows up
async fn read_secret<R>(reader: &mut R) -> Result<String, ServerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ServerError::Handshake(
                "input closed before a secret was received".to_string(),
            ));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<DaemonMessage>(trimmed) {
            Ok(DaemonMessage::SecretResult { secret }) => return Ok(secret),
            Ok(other) => warn!("Ignoring unexpected handshake message: {:?}", other),
            Err(e) => warn!("Ignoring handshake line ({}): {}", e, trimmed),
        }
    }
}

/// Ask the parent for the connection secret and wait for it
///
/// Lines that are not a secret result are logged and skipped. Fails if no
/// secret arrives within `timeout`, if the input ends first, or if the secret
/// is shorter than `min_length`.
pub async fn request_secret<R, W>(
    reader: &mut R,
    writer: &mut W,
    min_length: usize,
    timeout: Duration,
) -> Result<String, ServerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(writer, &DaemonMessage::SecretRequest { min_length }).await?;

    let secret = tokio::time::timeout(timeout, read_secret(reader))
        .await
        .map_err(|_| {
            ServerError::Handshake(format!("timed out after {:?} waiting for secret", timeout))
        })??;

    if secret.len() < min_length {
        return Err(ServerError::Handshake(format!(
            "secret is {} characters long, need at least {}",
            secret.len(),
            min_length
        )));
    }
    Ok(secret)
}

/// Tell the parent where RPC traffic should go
pub async fn announce_listen<W>(
    writer: &mut W,
    transport: TransportKind,
    address: &str,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let message = DaemonMessage::ListenNotification {
        transport: transport.as_str().to_string(),
        address: address.to_string(),
    };
    send(writer, &message).await
}

pub struct Daemon {
    config: DaemonConfig,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Router with the database pool, HTTP client and built-in methods
    pub fn build_router(&self) -> Result<Router, ServerError> {
        let db = match &self.config.database {
            Some(path) => Some(DbPool::open(path, self.config.db_pool_size)?),
            None => None,
        };

        let http_client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut router = Router::new(RouterConfig {
            db,
            http_client,
            shutdown_log_interval: self.config.shutdown_log_interval,
            ..RouterConfig::default()
        });
        register_builtins(&mut router);
        Ok(router)
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr), ServerError> {
        let address = &self.config.address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        Ok((listener, local))
    }

    /// Handshake over stdin/stdout, then serve until shutdown
    pub async fn run(self) -> Result<(), ServerError> {
        let mut stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();

        let secret = request_secret(
            &mut stdin,
            &mut stdout,
            self.config.min_secret_length,
            self.config.secret_timeout,
        )
        .await?;
        info!("Received secret, starting {} transport", self.config.transport.as_str());

        let router = Arc::new(self.build_router()?);
        let server = Server::new(router.clone(), secret);
        spawn_signal_handler(router.clone(), server.token().clone());

        match self.config.transport {
            TransportKind::Tcp => {
                let (listener, local) = self.bind().await?;
                announce_listen(&mut stdout, TransportKind::Tcp, &local.to_string()).await?;
                let policy = if self.config.keep_alive {
                    ServePolicy::KeepAlive
                } else {
                    ServePolicy::CloseAfterFirst
                };
                server.serve_tcp(listener, policy).await?;
            }
            TransportKind::Http => {
                let (listener, local) = self.bind().await?;
                announce_listen(&mut stdout, TransportKind::Http, &format!("http://{}", local))
                    .await?;
                server.serve_http(listener).await?;
            }
            TransportKind::Stdio => {
                announce_listen(&mut stdout, TransportKind::Stdio, "stdio").await?;
                drop(stdout);
                server.serve_stdio(stdin).await;
            }
        }

        info!("Daemon exiting");
        Ok(())
    }
}

/// First Ctrl-C starts a graceful shutdown, the second one tears down
/// every connection
fn spawn_signal_handler(router: Arc<Router>, token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupted, shutting down gracefully (interrupt again to force)");
        router.initiate_shutdown();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted again, closing all connections");
        token.cancel();
    });
}
