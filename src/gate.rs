//! Authentication gate
//!
//! Wraps a [`Handler`] and withholds every request except
//! `Meta.Authenticate` until the client has proven it knows the secret the
//! daemon was started with. One gate guards one connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::jsonrpc::{Conn, ConnError, Handler, Notification, ReplyHold, Request, RpcError};

/// The only method served before authentication
pub const META_AUTHENTICATE: &str = "Meta.Authenticate";

#[derive(Debug, Deserialize)]
struct AuthenticateParams {
    secret: String,
}

/// Result of presenting a secret to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Rejected,
    /// `first` is true only for the attempt that opened the gate
    Accepted { first: bool },
}

/// Compare two secrets without short-circuiting on the first differing byte
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub struct AuthGate {
    secret: String,
    inner: Arc<dyn Handler>,
    authenticated: Mutex<bool>,
    /// Fired once, on the first successful authentication
    proceed: CancellationToken,
}

impl AuthGate {
    pub fn new(secret: impl Into<String>, inner: Arc<dyn Handler>) -> Self {
        Self {
            secret: secret.into(),
            inner,
            authenticated: Mutex::new(false),
            proceed: CancellationToken::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        *self.authenticated.lock()
    }

    /// Check `secret` and open the gate if it matches
    pub fn try_authenticate(&self, secret: &str) -> AuthOutcome {
        if !secrets_match(secret, &self.secret) {
            return AuthOutcome::Rejected;
        }

        let first = {
            let mut authenticated = self.authenticated.lock();
            let first = !*authenticated;
            *authenticated = true;
            first
        };
        if first {
            self.proceed.cancel();
        }
        AuthOutcome::Accepted { first }
    }

    fn authenticate(&self, request: &Request) -> Result<Value, RpcError> {
        let params: AuthenticateParams =
            serde_json::from_value(request.params.clone().unwrap_or(Value::Null))
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;

        match self.try_authenticate(&params.secret) {
            AuthOutcome::Accepted { first } => {
                if first {
                    info!("Client authenticated");
                }
                Ok(json!({ "ok": true }))
            }
            AuthOutcome::Rejected => {
                warn!("Client presented an invalid secret");
                Err(RpcError::invalid_request("invalid secret"))
            }
        }
    }
}

#[async_trait]
impl Handler for AuthGate {
    async fn handle_request(
        &self,
        conn: &Conn,
        request: Request,
        hold: &ReplyHold,
    ) -> Result<Value, RpcError> {
        if request.method == META_AUTHENTICATE {
            return self.authenticate(&request);
        }

        tokio::select! {
            biased;
            _ = self.proceed.cancelled() => {}
            _ = conn.token().cancelled() => {
                return Err(RpcError::internal(ConnError::Closed.to_string()));
            }
        }

        self.inner.handle_request(conn, request, hold).await
    }

    async fn handle_notification(&self, conn: &Conn, notification: Notification) {
        self.inner.handle_notification(conn, notification).await
    }
}
