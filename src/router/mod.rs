//! Request router
//!
//! Maps method names to handlers, builds a [`RequestContext`] for every
//! dispatch, keeps track of in-flight work and background tasks, and drains
//! them on graceful shutdown.

pub mod cancel;
pub mod context;
pub mod errors;
pub mod group;
pub mod lifecycle;
pub mod progress;

pub use cancel::CancelFuncs;
pub use context::{LogLevel, LogNotification, RequestContext};
pub use errors::{translate, translate_panic, ApiError, Cancelled, Code, NetworkError};
pub use group::{Group, SharedError};
pub use lifecycle::InFlight;
pub use progress::{ProgressNotification, ProgressTracker};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::jsonrpc::{
    install_panic_hook, CaughtPanic, Conn, Handler, Notification, ReplyHold, Request, RpcError,
};
use crate::storage::{DbPool, DEFAULT_LEASE_TIMEOUT};
use lifecycle::Lifecycle;

type RequestHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type NotificationHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Version reported to clients and attached to every error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub version_string: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        let version = format!("v{}", env!("CARGO_PKG_VERSION"));
        Self {
            version_string: format!("{} {}", env!("CARGO_PKG_NAME"), version),
            version,
        }
    }
}

/// Resources and tunables a router is built with
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub db: Option<DbPool>,
    pub db_lease_timeout: Duration,
    pub http_client: reqwest::Client,
    pub version: VersionInfo,
    /// How often outstanding work is logged while shutting down
    pub shutdown_log_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            db: None,
            db_lease_timeout: DEFAULT_LEASE_TIMEOUT,
            http_client: reqwest::Client::new(),
            version: VersionInfo::default(),
            shutdown_log_interval: Duration::from_secs(5),
        }
    }
}

/// State shared by the router and every context it creates
pub(crate) struct Shared {
    pub(crate) cancel_funcs: CancelFuncs,
    pub(crate) db: Option<DbPool>,
    pub(crate) db_lease_timeout: Duration,
    pub(crate) http_client: reqwest::Client,
    pub(crate) group: Group,
    pub(crate) version: VersionInfo,
    pub(crate) lifecycle: Arc<Lifecycle>,
    offline: AtomicBool,
}

impl Shared {
    pub(crate) fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst)
    }

    pub(crate) fn queue_background_task<F, Fut>(
        self: &Arc<Self>,
        description: impl Into<String>,
        task: F,
    ) where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let description = description.into();
        let tracked = self.lifecycle.task_queued(&description);
        let ctx = RequestContext::background(self.clone());

        tokio::spawn(async move {
            debug!("Executing background task {}: {}", tracked.id(), description);

            let outcome = AssertUnwindSafe(async move { task(ctx).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task error: {:?}", e),
                Err(payload) => {
                    let caught = CaughtPanic::new(payload.as_ref());
                    error!(
                        "Background task panicked: {}\n{}",
                        caught.message, caught.backtrace
                    );
                }
            }
        });
    }
}

pub struct Router {
    handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    shared: Arc<Shared>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        install_panic_hook();
        Self {
            handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
            shared: Arc::new(Shared {
                cancel_funcs: CancelFuncs::new(),
                db: config.db,
                db_lease_timeout: config.db_lease_timeout,
                http_client: config.http_client,
                group: Group::new(),
                version: config.version,
                lifecycle: Arc::new(Lifecycle::new(config.shutdown_log_interval)),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Register a request handler
    ///
    /// # Panics
    ///
    /// If a handler is already registered for `method`.
    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.handlers.contains_key(method) {
            panic!("Can't register handler twice for {}", method);
        }
        let handler: RequestHandler = Arc::new(move |ctx: RequestContext| handler(ctx).boxed());
        self.handlers.insert(method.to_string(), handler);
    }

    /// Register a handler taking decoded params and returning a serializable result
    pub fn register_typed<P, R, F, Fut>(&mut self, method: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |ctx| {
            let handler = handler.clone();
            async move {
                let params: P = ctx.params()?;
                let result = handler(ctx, params).await?;
                Ok(serde_json::to_value(result)?)
            }
        });
    }

    /// Register a notification handler
    ///
    /// # Panics
    ///
    /// If a handler is already registered for `method`.
    pub fn register_notification<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.notification_handlers.contains_key(method) {
            panic!("Can't register handler twice for {}", method);
        }
        let handler: NotificationHandler =
            Arc::new(move |ctx: RequestContext| handler(ctx).boxed());
        self.notification_handlers.insert(method.to_string(), handler);
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn cancel_funcs(&self) -> &CancelFuncs {
        &self.shared.cancel_funcs
    }

    pub fn version(&self) -> &VersionInfo {
        &self.shared.version
    }

    pub fn queue_background_task<F, Fut>(&self, description: impl Into<String>, task: F)
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.queue_background_task(description, task)
    }

    /// Begin graceful shutdown. Only the first call has any effect.
    pub fn initiate_shutdown(&self) {
        self.shared.lifecycle.initiate_shutdown()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lifecycle.is_shutting_down()
    }

    /// Cancelled once shutdown has completed
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shared.lifecycle.shutdown_signal().clone()
    }

    /// Wait until shutdown has completed
    pub async fn wait_for_shutdown(&self) {
        self.shared.lifecycle.shutdown_signal().cancelled().await
    }

    pub fn outstanding(&self) -> Vec<InFlight> {
        self.shared.lifecycle.outstanding()
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.lifecycle.in_flight_count()
    }

    fn context(&self, conn: &Conn, method: &str, params: Option<Value>) -> RequestContext {
        RequestContext::new(
            self.shared.clone(),
            method,
            params,
            conn.token().child_token(),
            Some(conn.clone()),
        )
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle_request(
        &self,
        conn: &Conn,
        request: Request,
        hold: &ReplyHold,
    ) -> Result<Value, RpcError> {
        // In flight until the reply is written, so shutdown can't outrun it
        hold.keep(self.shared.lifecycle.request_started(&request.method));
        let method = request.method;

        let Some(handler) = self.handlers.get(&method).cloned() else {
            return Err(RpcError::method_not_found(&method));
        };

        let ctx = self.context(conn, &method, request.params);
        let outcome = AssertUnwindSafe(handler(ctx)).catch_unwind().await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                debug!("{} failed: {:#}", method, e);
                Err(translate(&e, &self.shared.version.version))
            }
            Err(payload) => {
                let caught = CaughtPanic::new(payload.as_ref());
                error!(
                    "Handler for {} panicked: {}\n{}",
                    method, caught.message, caught.backtrace
                );
                Err(translate_panic(
                    &caught.message,
                    &caught.backtrace,
                    &self.shared.version.version,
                ))
            }
        }
    }

    async fn handle_notification(&self, conn: &Conn, notification: Notification) {
        let _tracked = self.shared.lifecycle.request_started(&notification.method);
        let method = notification.method;

        let Some(handler) = self.notification_handlers.get(&method).cloned() else {
            debug!("No handler for notification {}, ignoring", method);
            return;
        };

        let ctx = self.context(conn, &method, notification.params);
        match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Notification handler for {} failed: {:#}", method, e),
            Err(payload) => {
                let caught = CaughtPanic::new(payload.as_ref());
                error!(
                    "Notification handler for {} panicked: {}\n{}",
                    method, caught.message, caught.backtrace
                );
            }
        }
    }
}
