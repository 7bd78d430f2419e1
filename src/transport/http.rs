//! HTTP dual-channel transport
//!
//! Clients hold one long-lived SSE *feed* per client id (cid) and issue
//! short-lived *call* POSTs. Each call runs its own [`Conn`] over a
//! [`CallTransport`]: the synthesized request is the first frame read and
//! the reply to it becomes the HTTP response. Anything else the handler
//! emits while serving the call (notifications, server-initiated calls) is
//! pushed to the cid's feed, tagged with the call id.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Transport, TransportError};
use crate::gate::secrets_match;
use crate::jsonrpc::{Conn, Handler, Message};

pub const SECRET_HEADER: &str = "x-secret";
pub const CID_HEADER: &str = "x-cid";
pub const CALL_ID_HEADER: &str = "x-call-id";

/// Id of the synthesized request inside a call stream
const CALL_REQUEST_ID: i64 = 0;

/// What a call POST answers with
#[derive(Debug)]
struct CallOutcome {
    status: StatusCode,
    body: Value,
}

impl CallOutcome {
    fn failed(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: json!({ "message": message }),
        }
    }
}

impl IntoResponse for CallOutcome {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

struct FeedSlot {
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
}

/// One in-flight POST /call
struct CallStream {
    id: u64,
    cid: String,
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outcome: Mutex<Option<oneshot::Sender<CallOutcome>>>,
    cancel: CancellationToken,
}

impl CallStream {
    /// Settle the HTTP response. Only the first outcome counts.
    fn finish(&self, outcome: CallOutcome) -> bool {
        match self.outcome.lock().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

struct GatewayState {
    secret: String,
    handler: Arc<dyn Handler>,
    token: CancellationToken,
    keep_alive: Duration,
    feeds: Mutex<HashMap<String, FeedSlot>>,
    calls: Mutex<HashMap<u64, Arc<CallStream>>>,
    feed_generation: AtomicU64,
    call_id_seed: AtomicU64,
}

impl GatewayState {
    fn authorized(&self, headers: &HeaderMap, fallback: Option<&str>) -> bool {
        let provided = header(headers, SECRET_HEADER).or(fallback);
        provided.is_some_and(|secret| secrets_match(secret, &self.secret))
    }

    fn attach_feed(self: &Arc<Self>, cid: &str) -> (mpsc::UnboundedReceiver<Event>, FeedGuard) {
        let generation = self.feed_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        // Dropping the previous sender ends the previous stream
        let previous = self.feeds.lock().insert(
            cid.to_string(),
            FeedSlot {
                generation,
                events: tx,
            },
        );
        if previous.is_some() {
            info!("Feed for cid {} replaced by a newer one", cid);
        }

        let guard = FeedGuard {
            state: self.clone(),
            cid: cid.to_string(),
            generation,
        };
        (rx, guard)
    }

    fn detach_feed(&self, cid: &str, generation: u64) {
        {
            let mut feeds = self.feeds.lock();
            match feeds.get(cid) {
                Some(slot) if slot.generation == generation => {
                    feeds.remove(cid);
                }
                // Replaced, the newer feed keeps serving this cid
                _ => return,
            }
        }

        let orphaned: Vec<Arc<CallStream>> = self
            .calls
            .lock()
            .values()
            .filter(|call| call.cid == cid)
            .cloned()
            .collect();

        debug!(
            "Feed for cid {} closed with {} call(s) in flight",
            cid,
            orphaned.len()
        );
        for call in orphaned {
            call.finish(CallOutcome::failed(
                StatusCode::FAILED_DEPENDENCY,
                "feed closed while call was in flight",
            ));
            call.cancel.cancel();
        }
    }

    fn push(&self, call: &CallStream, frame: &[u8]) -> Result<(), TransportError> {
        let data = String::from_utf8_lossy(frame);
        let event = Event::default().id(call.id.to_string()).data(data);

        let delivered = match self.feeds.lock().get(&call.cid) {
            Some(slot) => slot.events.send(event).is_ok(),
            None => false,
        };

        if delivered {
            Ok(())
        } else {
            call.finish(CallOutcome::failed(
                StatusCode::PRECONDITION_REQUIRED,
                "no feed registered for this client",
            ));
            Err(TransportError::http(
                StatusCode::PRECONDITION_REQUIRED.as_u16(),
                format!("no feed registered for cid {}", call.cid),
            ))
        }
    }

    fn open_call(&self, cid: &str) -> (Arc<CallStream>, oneshot::Receiver<CallOutcome>) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let call = Arc::new(CallStream {
            id: self.call_id_seed.fetch_add(1, Ordering::SeqCst),
            cid: cid.to_string(),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            outcome: Mutex::new(Some(outcome_tx)),
            cancel: self.token.child_token(),
        });
        self.calls.lock().insert(call.id, call.clone());
        (call, outcome_rx)
    }

    fn find_call(&self, headers: &HeaderMap) -> Option<Arc<CallStream>> {
        let cid = header(headers, CID_HEADER)?;
        let id: u64 = header(headers, CALL_ID_HEADER)?.parse().ok()?;
        let call = self.calls.lock().get(&id).cloned()?;
        (call.cid == cid).then_some(call)
    }
}

/// Unregisters a feed when its SSE stream is dropped
struct FeedGuard {
    state: Arc<GatewayState>,
    cid: String,
    generation: u64,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.state.detach_feed(&self.cid, self.generation);
    }
}

/// Unregisters a call and cancels it when the POST handler goes away,
/// including when the client disconnects mid-call
struct CallGuard {
    state: Arc<GatewayState>,
    call: Arc<CallStream>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.call.cancel.cancel();
        self.state.calls.lock().remove(&self.call.id);
    }
}

/// Transport backing one call stream
pub struct CallTransport {
    state: Arc<GatewayState>,
    call: Arc<CallStream>,
}

#[async_trait]
impl Transport for CallTransport {
    async fn read(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut incoming = self.call.incoming_rx.lock().await;
        tokio::select! {
            frame = incoming.recv() => Ok(frame),
            _ = self.call.cancel.cancelled() => Ok(None),
        }
    }

    async fn write(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let msg = Message::decode(&frame).map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        // The only request this connection ever receives is the call itself,
        // so any response we write answers it
        if msg.is_response() {
            let outcome = match (msg.error, msg.result) {
                (Some(error), _) => CallOutcome {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: serde_json::to_value(error).unwrap_or(Value::Null),
                },
                (None, result) => CallOutcome {
                    status: StatusCode::OK,
                    body: result.unwrap_or(Value::Null),
                },
            };
            if !self.call.finish(outcome) {
                debug!("Call {} already settled, dropping reply", self.call.id);
            }
            return Ok(());
        }

        self.state.push(&self.call, &frame)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.call.finish(CallOutcome::failed(
            StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "call cancelled",
        ));
        self.call.cancel.cancel();
        Ok(())
    }
}

/// The HTTP side of the daemon
#[derive(Clone)]
pub struct HttpGateway {
    state: Arc<GatewayState>,
}

impl HttpGateway {
    pub fn new(
        secret: impl Into<String>,
        handler: Arc<dyn Handler>,
        parent: &CancellationToken,
    ) -> Self {
        Self::with_keep_alive(secret, handler, parent, Duration::from_secs(15))
    }

    /// Like [`HttpGateway::new`], with a custom interval between SSE
    /// keep-alive comments. The interval also bounds how long it takes to
    /// notice a feed whose client went away.
    pub fn with_keep_alive(
        secret: impl Into<String>,
        handler: Arc<dyn Handler>,
        parent: &CancellationToken,
        keep_alive: Duration,
    ) -> Self {
        Self {
            state: Arc::new(GatewayState {
                secret: secret.into(),
                handler,
                token: parent.child_token(),
                keep_alive,
                feeds: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                feed_generation: AtomicU64::new(0),
                call_id_seed: AtomicU64::new(0),
            }),
        }
    }

    /// Number of call streams currently open
    pub fn calls_in_flight(&self) -> usize {
        self.state.calls.lock().len()
    }

    /// Whether a feed is registered for `cid`
    pub fn has_feed(&self, cid: &str) -> bool {
        self.state.feeds.lock().contains_key(cid)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/feed", get(feed))
            .route("/call/{method}", post(call))
            .route("/reply", post(reply))
            .route("/cancel", post(cancel))
            .with_state(self.state.clone())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn unauthorized() -> Response {
    CallOutcome::failed(StatusCode::UNAUTHORIZED, "invalid secret").into_response()
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    cid: Option<String>,
    secret: Option<String>,
}

/// GET /feed
async fn feed(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<FeedQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers, query.secret.as_deref()) {
        return unauthorized();
    }
    let Some(cid) = query.cid.filter(|cid| !cid.is_empty()) else {
        return CallOutcome::failed(StatusCode::BAD_REQUEST, "missing cid").into_response();
    };

    info!("Feed opened for cid {}", cid);
    let (events, guard) = state.attach_feed(&cid);
    let token = state.token.clone();

    let stream = futures::stream::unfold(
        (events, guard, token),
        |(mut events, guard, token)| async move {
            let event = tokio::select! {
                event = events.recv() => event?,
                _ = token.cancelled() => return None,
            };
            Some((Ok::<_, Infallible>(event), (events, guard, token)))
        },
    );

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

/// POST /call/{method}
async fn call(
    State(state): State<Arc<GatewayState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.authorized(&headers, None) {
        return unauthorized();
    }
    let Some(cid) = header(&headers, CID_HEADER) else {
        return CallOutcome::failed(StatusCode::BAD_REQUEST, "missing x-cid header").into_response();
    };

    let params = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(params) => Some(params),
            Err(e) => {
                return CallOutcome::failed(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid params: {}", e),
                )
                .into_response()
            }
        }
    };

    let frame = match Message::request(CALL_REQUEST_ID, method.as_str(), params).encode() {
        Ok(frame) => frame,
        Err(e) => {
            return CallOutcome::failed(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
    };

    let (call, outcome) = state.open_call(cid);
    let _guard = CallGuard {
        state: state.clone(),
        call: call.clone(),
    };
    debug!("Call {} ({}) opened for cid {}", call.id, method, cid);

    if call.incoming_tx.send(frame).is_err() {
        return CallOutcome::failed(StatusCode::INTERNAL_SERVER_ERROR, "call stream closed")
            .into_response();
    }

    let transport = Arc::new(CallTransport {
        state: state.clone(),
        call: call.clone(),
    });
    let conn = Conn::new(&call.cancel, transport, state.handler.clone());

    let outcome = outcome.await.unwrap_or_else(|_| {
        CallOutcome::failed(StatusCode::INTERNAL_SERVER_ERROR, "call ended without a reply")
    });
    conn.close().await;

    if !outcome.status.is_success() {
        warn!("Call {} ({}) answered with {}", call.id, method, outcome.status);
    }
    outcome.into_response()
}

/// POST /reply: the client answering a server-initiated call
async fn reply(State(state): State<Arc<GatewayState>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    if !state.authorized(&headers, None) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.find_call(&headers) {
        Some(call) if call.incoming_tx.send(body.to_vec()).is_ok() => StatusCode::NO_CONTENT,
        _ => StatusCode::NOT_FOUND,
    }
}

/// POST /cancel
async fn cancel(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> StatusCode {
    if !state.authorized(&headers, None) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.find_call(&headers) {
        Some(call) => {
            info!("Cancelling call {} on behalf of cid {}", call.id, call.cid);
            call.cancel.cancel();
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}
