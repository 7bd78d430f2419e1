/// Listener accept loops
///
/// Every accepted connection is wired the same way: transport, then the
/// authentication gate, then a connection whose handler is the shared
/// router. The server only decides how many connections to accept and when
/// to stop.

use std::sync::Arc;
use tokio::io::{BufReader, Stdin};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::gate::AuthGate;
use crate::jsonrpc::Conn;
use crate::router::Router;
use crate::transport::{stream, HttpGateway, Transport};
use crate::ServerError;

/// How many TCP connections to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServePolicy {
    /// Serve the first connection, then stop
    CloseAfterFirst,
    /// Accept connections until shutdown
    KeepAlive,
}

pub struct Server {
    router: Arc<Router>,
    secret: String,
    /// Parent of every connection token; cancelling it tears everything down
    token: CancellationToken,
}

impl Server {
    pub fn new(router: Arc<Router>, secret: impl Into<String>) -> Self {
        Self {
            router,
            secret: secret.into(),
            token: CancellationToken::new(),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Serve a single transport until the peer goes away
    pub async fn serve_transport(&self, transport: Arc<dyn Transport>) -> Conn {
        let gate = Arc::new(AuthGate::new(self.secret.clone(), self.router.clone()));
        let conn = Conn::new(&self.token, transport, gate);
        conn.disconnected().await;
        conn
    }

    /// Serve newline-delimited JSON-RPC over TCP
    pub async fn serve_tcp(&self, listener: TcpListener, policy: ServePolicy) -> Result<(), ServerError> {
        match policy {
            ServePolicy::CloseAfterFirst => self.serve_tcp_close(listener).await,
            ServePolicy::KeepAlive => self.serve_tcp_keep_alive(listener).await,
        }
    }

    async fn serve_tcp_close(&self, listener: TcpListener) -> Result<(), ServerError> {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = self.token.cancelled() => return Ok(()),
        };
        drop(listener);

        info!("Accepted connection from {}", peer);
        self.serve_transport(Arc::new(stream::tcp(socket))).await;
        info!("Connection from {} closed", peer);
        Ok(())
    }

    async fn serve_tcp_keep_alive(&self, listener: TcpListener) -> Result<(), ServerError> {
        let tracker = TaskTracker::new();
        let shutdown = self.router.shutdown_signal();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let gate = Arc::new(AuthGate::new(self.secret.clone(), self.router.clone()));
                        let conn = Conn::new(&self.token, Arc::new(stream::tcp(socket)), gate);
                        tracker.spawn(async move {
                            conn.disconnected().await;
                            debug!("Connection from {} closed", peer);
                        });
                    }
                    Err(e) => warn!("While accepting connection: {}", e),
                },
                _ = shutdown.cancelled() => break,
                _ = self.token.cancelled() => break,
            }
        }

        info!("Closing TCP listener...");
        drop(listener);

        info!("Waiting for TCP connections to close...");
        tracker.close();
        tracker.wait().await;
        info!("All TCP connections closed");
        Ok(())
    }

    /// Serve one transport until the peer leaves or shutdown completes,
    /// whichever comes first
    pub async fn serve_session(&self, transport: Arc<dyn Transport>) {
        let gate = Arc::new(AuthGate::new(self.secret.clone(), self.router.clone()));
        let conn = Conn::new(&self.token, transport, gate);

        tokio::select! {
            _ = conn.disconnected() => debug!("Peer left the session"),
            _ = self.router.wait_for_shutdown() => conn.close().await,
        }
    }

    /// Serve over the process' own stdin/stdout
    pub async fn serve_stdio(&self, stdin: BufReader<Stdin>) {
        self.serve_session(Arc::new(stream::stdio(stdin))).await;
        info!("stdio session ended");
    }

    /// Serve the HTTP dual-channel transport
    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), ServerError> {
        let http_token = self.token.child_token();
        let gateway = HttpGateway::new(self.secret.clone(), self.router.clone(), &http_token);

        let shutdown = self.router.shutdown_signal();
        let signal = async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = http_token.cancelled() => {}
            }
            info!("Shutting down HTTP server gracefully...");
            // Ends the long-lived feeds so the server can drain
            http_token.cancel();
        };

        axum::serve(listener, gateway.router())
            .with_graceful_shutdown(signal)
            .await?;

        info!("HTTP server has shut down.");
        Ok(())
    }
}
