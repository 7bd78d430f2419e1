//! Per-request context handed to every handler

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cancel::CancelFuncs;
use super::errors::{Cancelled, NetworkError};
use super::group::Group;
use super::progress::{ProgressNotification, ProgressTracker};
use super::{Shared, VersionInfo};
use crate::jsonrpc::{Conn, RpcError};
use crate::storage::{DbLease, StorageError};

/// Severity of a `Log` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Payload of the `Log` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogNotification {
    pub level: LogLevel,
    pub message: String,
}

/// Replaces the delivery of one notification method for a single request
pub type NotificationInterceptor = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Everything a handler needs to serve one request
///
/// Created per dispatch and dropped when the handler returns. Background
/// tasks get one too, bound to the router's background token and without a
/// connection.
pub struct RequestContext {
    shared: Arc<Shared>,
    method: String,
    params: Option<Value>,
    token: CancellationToken,
    conn: Option<Conn>,
    tracker: Mutex<Option<ProgressTracker>>,
    interceptors: Mutex<HashMap<String, NotificationInterceptor>>,
}

impl RequestContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        method: impl Into<String>,
        params: Option<Value>,
        token: CancellationToken,
        conn: Option<Conn>,
    ) -> Self {
        Self {
            shared,
            method: method.into(),
            params,
            token,
            conn,
            tracker: Mutex::new(None),
            interceptors: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn background(shared: Arc<Shared>) -> Self {
        let token = shared.lifecycle.background_token().child_token();
        Self::new(shared, "", None, token, None)
    }

    /// Method being served, empty for background tasks
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn raw_params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Decode the request parameters. Missing or null params decode as `{}`.
    pub fn params<P: DeserializeOwned>(&self) -> anyhow::Result<P> {
        let params = match &self.params {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params) => params.clone(),
        };
        serde_json::from_value(params).map_err(|e| {
            RpcError::invalid_params(format!("invalid params for {}: {}", self.method, e)).into()
        })
    }

    // Cancellation

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this request has been cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel_funcs(&self) -> &CancelFuncs {
        &self.shared.cancel_funcs
    }

    // Talking back to the client

    /// Connection this request came in on; `None` for background tasks
    pub fn conn(&self) -> Option<&Conn> {
        self.conn.as_ref()
    }

    /// Call a method on the client and wait for its answer
    pub async fn call<P, R>(&self, method: &str, params: &P) -> anyhow::Result<R>
    where
        P: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no client connection to call {} on", method))?;

        tokio::select! {
            result = conn.call(method, params) => Ok(result?),
            _ = self.token.cancelled() => Err(Cancelled.into()),
        }
    }

    /// Send a notification to the client, unless an interceptor claims it
    pub async fn notify<P>(&self, method: &str, params: &P) -> anyhow::Result<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        let value = serde_json::to_value(params)?;

        let interceptor = self.interceptors.lock().get(method).cloned();
        if let Some(interceptor) = interceptor {
            return interceptor(method, &value);
        }

        match &self.conn {
            Some(conn) => Ok(conn.notify(method, &value).await?),
            None => {
                debug!("No connection, dropping {} notification", method);
                Ok(())
            }
        }
    }

    pub fn intercept_notification<F>(&self, method: impl Into<String>, interceptor: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.interceptors
            .lock()
            .insert(method.into(), Arc::new(interceptor));
    }

    pub fn stop_intercepting_notification(&self, method: &str) {
        self.interceptors.lock().remove(method);
    }

    // Logging

    /// Log locally and relay the message to the client
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("[{}] {}", self.method, message),
            LogLevel::Info => tracing::info!("[{}] {}", self.method, message),
            LogLevel::Warning => tracing::warn!("[{}] {}", self.method, message),
            LogLevel::Error => tracing::error!("[{}] {}", self.method, message),
        }

        let notification = LogNotification { level, message };
        if let Err(e) = self.notify("Log", &notification).await {
            debug!("Could not relay log line: {}", e);
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message).await
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await
    }

    // Progress

    pub fn start_progress(&self) {
        self.start_progress_with_initial_and_total(0.0, 0)
    }

    pub fn start_progress_with_total_bytes(&self, total_bytes: u64) {
        self.start_progress_with_initial_and_total(0.0, total_bytes)
    }

    pub fn start_progress_with_initial_and_total(&self, initial: f64, total_bytes: u64) {
        let mut tracker = self.tracker.lock();
        if tracker.is_some() {
            warn!("Asked to start progress but already tracking progress!");
            return;
        }
        *tracker = Some(ProgressTracker::new(initial, Some(total_bytes)));
    }

    pub fn end_progress(&self) {
        if self.tracker.lock().take().is_none() {
            warn!("Asked to stop progress but wasn't tracking progress!");
        }
    }

    pub fn pause_progress(&self) {
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.pause();
        }
    }

    pub fn resume_progress(&self) {
        if let Some(tracker) = self.tracker.lock().as_mut() {
            tracker.resume();
        }
    }

    /// Record progress and emit a `Progress` notification. Ignored unless
    /// progress tracking was started.
    pub async fn progress(&self, alpha: f64) -> anyhow::Result<()> {
        let notification: Option<ProgressNotification> = self
            .tracker
            .lock()
            .as_mut()
            .map(|tracker| tracker.set_progress(alpha));

        match notification {
            Some(notification) => self.notify("Progress", &notification).await,
            None => Ok(()),
        }
    }

    // Shared resources

    /// Lease a database connection bound to this request's cancellation
    pub async fn db(&self) -> Result<DbLease, StorageError> {
        let pool = self
            .shared
            .db
            .as_ref()
            .ok_or_else(|| StorageError::Connection("no database configured".to_string()))?;
        pool.lease(&self.token, self.shared.db_lease_timeout).await
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.shared.http_client
    }

    pub fn group(&self) -> &Group {
        &self.shared.group
    }

    pub fn version(&self) -> &VersionInfo {
        &self.shared.version
    }

    /// Fails when the network is (simulated as) unavailable
    pub fn ensure_online(&self) -> Result<(), NetworkError> {
        if self.shared.is_offline() {
            Err(NetworkError::SimulatedOffline)
        } else {
            Ok(())
        }
    }

    pub fn set_simulate_offline(&self, offline: bool) {
        self.shared.set_offline(offline)
    }

    /// Run `task` in the background, tracked until it completes
    pub fn queue_background_task<F, Fut>(&self, description: impl Into<String>, task: F)
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.queue_background_task(description, task)
    }

    /// Begin graceful shutdown of the daemon
    pub fn shutdown(&self) {
        self.shared.lifecycle.initiate_shutdown()
    }
}
