/// Public library interface for the game RPC daemon
///
/// A local JSON-RPC 2.0 daemon a GUI client drives over TCP, stdio or an
/// HTTP dual channel. This module exports the connection, router and server
/// layers so they can be embedded or tested on their own.

use thiserror::Error;

pub mod daemon;
pub mod endpoints;
pub mod gate;
pub mod jsonrpc;
pub mod router;
pub mod server;
pub mod storage;
pub mod transport;

pub use daemon::{Daemon, DaemonConfig, DaemonMessage, TransportKind};
pub use gate::{AuthGate, AuthOutcome};
pub use jsonrpc::{Conn, ConnError, Handler, Message, ReplyHold, RpcError};
pub use router::{Code, RequestContext, Router, RouterConfig, VersionInfo};
pub use server::{ServePolicy, Server};
pub use storage::{DbPool, StorageError};
pub use transport::{HttpGateway, StreamTransport, Transport, TransportError};

/// Errors that can stop the daemon
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
