//! A JSON-RPC connection over some [`Transport`]
//!
//! The connection owns the receive loop, correlates outgoing calls with
//! their replies, and hands incoming requests and notifications to a
//! [`Handler`], each on its own task so a slow handler never blocks
//! reception of subsequent frames.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::message::{Id, Message, MessageKind, Notification, Request, RpcError};
use super::{install_panic_hook, CaughtPanic};
use crate::transport::{Transport, TransportError};

/// Errors that can occur while talking to the peer
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("invalid response: no 'error' nor 'result' field")]
    InvalidResponse,
}

/// Keeps values alive until the reply to a request has been written
///
/// Whatever a handler hands to [`ReplyHold::keep`] is dropped right after
/// the reply frame went out, or after the write failed.
#[derive(Default)]
pub struct ReplyHold {
    held: Mutex<Vec<Box<dyn Send>>>,
}

impl ReplyHold {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep<T: Send + 'static>(&self, value: T) {
        self.held.lock().push(Box::new(value));
    }
}

/// Reacts to incoming requests and notifications
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle a request, returning either a result or a wire error
    async fn handle_request(
        &self,
        conn: &Conn,
        request: Request,
        hold: &ReplyHold,
    ) -> Result<Value, RpcError>;

    /// Handle a notification. Nothing is sent back.
    async fn handle_notification(&self, conn: &Conn, notification: Notification);
}

type PendingCall = oneshot::Sender<Result<Value, ConnError>>;

struct Inner {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn Handler>,
    /// Cancelled when the connection goes away; request contexts derive from it
    token: CancellationToken,
    /// Fired exactly once, after the transport has been closed
    disconnected: CancellationToken,
    closed: AtomicBool,
    id_seed: AtomicI64,
    outgoing_calls: Mutex<HashMap<Id, PendingCall>>,
    write_lock: tokio::sync::Mutex<()>,
}

/// Cheaply clonable handle to a running connection
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Conn {
    /// Start serving `transport`. The receive loop runs until the peer goes
    /// away or `parent` is cancelled, whichever comes first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        parent: &CancellationToken,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        install_panic_hook();
        let conn = Self {
            inner: Arc::new(Inner {
                transport,
                handler,
                token: parent.child_token(),
                disconnected: CancellationToken::new(),
                closed: AtomicBool::new(false),
                id_seed: AtomicI64::new(0),
                outgoing_calls: Mutex::new(HashMap::new()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        };

        tokio::spawn(conn.clone().receive_loop());
        conn
    }

    /// Cancellation token scoped to this connection
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been torn down
    pub async fn disconnected(&self) {
        self.inner.disconnected.cancelled().await
    }

    /// Send a notification to the peer
    pub async fn notify<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), ConnError> {
        let params = serde_json::to_value(params)?;
        self.send(Message::notification(method, Some(params))).await
    }

    /// Call a method on the peer and wait for its reply
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, ConnError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call_raw(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Untyped variant of [`Conn::call`]
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value, ConnError> {
        let id = self.generate_id();
        let (tx, rx) = oneshot::channel();

        // Register before sending so a fast reply can't beat us to the table
        self.inner.outgoing_calls.lock().insert(id, tx);

        if let Err(e) = self
            .send(Message::request(id, method, Some(params)))
            .await
        {
            self.inner.outgoing_calls.lock().remove(&id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => reply.unwrap_or(Err(ConnError::Closed)),
            _ = self.inner.token.cancelled() => {
                self.inner.outgoing_calls.lock().remove(&id);
                Err(ConnError::Closed)
            }
        }
    }

    /// Tear the connection down. Only the first call has any effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.token.cancel();
        if let Err(e) = self.inner.transport.close().await {
            debug!("While closing transport: {}", e);
        }

        // Dropping the senders wakes any caller still waiting
        self.inner.outgoing_calls.lock().clear();
        self.inner.disconnected.cancel();
    }

    fn generate_id(&self) -> Id {
        self.inner.id_seed.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, msg: Message) -> Result<(), ConnError> {
        let frame = msg.encode()?;

        let _guard = self.inner.write_lock.lock().await;
        self.inner.transport.write(frame).await?;
        Ok(())
    }

    async fn receive_loop(self) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.token.cancelled() => break,
                frame = self.inner.transport.read() => frame,
            };

            match frame {
                Ok(Some(frame)) => self.handle_frame(&frame),
                Ok(None) => {
                    debug!("Peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("While reading from transport: {}", e);
                    break;
                }
            }
        }

        self.close().await;
    }

    fn handle_frame(&self, frame: &[u8]) {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Skipping undecodable frame: {}, for input {:?}",
                    e,
                    String::from_utf8_lossy(frame)
                );
                return;
            }
        };

        if !msg.has_valid_version() {
            warn!("Received message lacking 'jsonrpc: \"2.0\"', ignoring");
            return;
        }

        match msg.kind() {
            MessageKind::Request(request) => {
                tokio::spawn(self.clone().serve_request(request));
            }
            MessageKind::Notification(notification) => {
                tokio::spawn(self.clone().serve_notification(notification));
            }
            MessageKind::Response { id, outcome } => {
                self.complete_call(id, outcome.map_err(ConnError::Rpc));
            }
            MessageKind::InvalidResponse { id } => {
                self.complete_call(id, Err(ConnError::InvalidResponse));
            }
            MessageKind::Unroutable => {
                warn!("Received message with no method nor ID, ignoring");
            }
        }
    }

    fn complete_call(&self, id: Id, outcome: Result<Value, ConnError>) {
        let pending = self.inner.outgoing_calls.lock().remove(&id);
        match pending {
            Some(tx) => {
                // The caller may have given up already, that's fine
                let _ = tx.send(outcome);
            }
            None => warn!(
                "Received reply with ID {}, but we don't have a corresponding outgoing call",
                id
            ),
        }
    }

    async fn serve_request(self, request: Request) {
        let id = request.id;
        let method = request.method.clone();

        let hold = ReplyHold::new();
        let handled = AssertUnwindSafe(self.inner.handler.handle_request(&self, request, &hold))
            .catch_unwind()
            .await;

        let reply = match handled {
            Ok(Ok(result)) => Message::success(id, result),
            Ok(Err(rpc_error)) => Message::failure(id, rpc_error),
            Err(payload) => {
                let caught = CaughtPanic::new(payload.as_ref());
                error!(
                    "Handler for {} panicked: {}\n{}",
                    method, caught.message, caught.backtrace
                );
                Message::failure(
                    id,
                    RpcError::internal(format!("panic: {}", caught.message))
                        .with_data(serde_json::json!({ "stack": caught.backtrace })),
                )
            }
        };

        if let Err(e) = self.send(reply).await {
            warn!("While replying to {} (id {}): {}", method, id, e);
        }
        drop(hold);
    }

    async fn serve_notification(self, notification: Notification) {
        let method = notification.method.clone();
        let handled = AssertUnwindSafe(
            self.inner
                .handler
                .handle_notification(&self, notification),
        )
        .catch_unwind()
        .await;

        if let Err(payload) = handled {
            let caught = CaughtPanic::new(payload.as_ref());
            error!(
                "Notification handler for {} panicked: {}\n{}",
                method, caught.message, caught.backtrace
            );
        }
    }
}
