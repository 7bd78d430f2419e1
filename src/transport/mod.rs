//! Transport adapters
//!
//! A transport turns some byte-oriented channel into the frame-level
//! `read`/`write`/`close` contract a [`Conn`](crate::jsonrpc::Conn) needs.
//! Two adapters are provided: newline-delimited streams (TCP, stdio) and the
//! HTTP dual-channel gateway (SSE feed + POST calls).

pub mod http;
pub mod stream;

pub use http::HttpGateway;
pub use stream::StreamTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    /// Only produced by the HTTP transport; the status is what the
    /// call stream answers with
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl TransportError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }
}

/// Frame-level duplex channel
///
/// `read` is only ever called from a connection's receive loop, while
/// `write` may be called from any task (the connection serializes writes).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Read the next frame, or `None` once the peer is gone
    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Write one complete frame
    async fn write(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Release the underlying channel. Must be idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
