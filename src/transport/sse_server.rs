//! Server-sent events server transport.
//!
//! Each `GET` on the stream path opens one session: a fresh
//! [`SseServerTransport`] whose first event announces where the client must
//! `POST` its messages. Replies and server-initiated traffic travel back as
//! `message` events on that stream.
//!
//! ```text
//! GET  /sse                       ──►  event: endpoint  data: /messages?sessionId=<uuid>
//!                                 ◄──  event: message   data: {"jsonrpc":"2.0",...}
//! POST /messages?sessionId=<uuid>  {"jsonrpc":"2.0",...}  ──►  202 Accepted
//! ```
//!
//! [`SseServer::router`] returns an axum [`Router`] serving both paths;
//! mount it in an existing app or hand it to `axum::serve`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{BoxFuture, Transport, TransportCallbacks};
use crate::error::{Result, RpcError};
use crate::protocol::Message;

/// Default path of the event stream.
pub const DEFAULT_SSE_PATH: &str = "/sse";

/// Default path clients `POST` messages to.
pub const DEFAULT_MESSAGE_PATH: &str = "/messages";

/// Query parameter carrying the session ID on every `POST`.
pub const SESSION_ID_PARAM: &str = "sessionId";

/// Event stream handed to axum for one session.
pub type EventStream = Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>>;

/// Invoked with each newly opened session, before its stream is returned.
pub type SessionCallback = Arc<dyn Fn(Arc<SseServerTransport>) + Send + Sync>;

/// Server side of one HTTP + server-sent events session.
pub struct SseServerTransport {
    session_id: String,
    endpoint: String,
    callbacks: TransportCallbacks,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    started: AtomicBool,
}

impl SseServerTransport {
    /// New session whose clients will `POST` to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            callbacks: TransportCallbacks::new(),
            events: Mutex::new(Some(tx)),
            stream: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The `endpoint` event payload: the POST path with this session's ID.
    pub fn endpoint_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            self.endpoint, separator, SESSION_ID_PARAM, self.session_id
        )
    }

    /// Take the outbound event stream. Only the first call returns it.
    ///
    /// The stream ends when the transport closes. Dropping it (the client
    /// went away) closes the transport.
    pub fn event_stream(self: &Arc<Self>) -> Option<EventStream> {
        let rx = lock(&self.stream).take()?;
        let guard = StreamGuard {
            transport: Arc::downgrade(self),
            on_end: None,
        };
        Some(event_stream(rx, guard))
    }

    /// Deliver a `POST`ed message body to the engine.
    ///
    /// Fails with `NotConnected` before `start`, and with `InvalidRequest`
    /// when the body is not a JSON-RPC message.
    pub fn handle_message(&self, body: Value) -> Result<()> {
        if !self.started.load(Ordering::Acquire) || self.callbacks.is_closed() {
            self.callbacks.emit_error(RpcError::Transport(
                "SSE connection not established".into(),
            ));
            return Err(RpcError::NotConnected);
        }
        match Message::from_value(body) {
            Ok(message) => {
                self.callbacks.emit_message(message);
                Ok(())
            }
            Err(e) => {
                self.callbacks
                    .emit_error(RpcError::Transport(format!("invalid message: {e}")));
                Err(e)
            }
        }
    }

    fn push(&self, event: Event) -> Result<()> {
        match &*lock(&self.events) {
            Some(events) => events.send(event).map_err(|_| RpcError::ConnectionClosed),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    async fn start_inner(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted);
        }
        let endpoint = self.endpoint_url();
        tracing::debug!("SSE session {} announcing {}", self.session_id, endpoint);
        self.push(Event::default().event("endpoint").data(endpoint))
    }

    async fn send_inner(&self, message: Message) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RpcError::NotConnected);
        }
        let data = serde_json::to_string(&message)?;
        self.push(Event::default().event("message").data(data))
    }

    /// Stop the stream and fire the close callback once.
    fn shut(&self) {
        if lock(&self.events).take().is_some() {
            tracing::debug!("SSE session {} closed", self.session_id);
        }
        self.callbacks.emit_close();
    }
}

impl Transport for SseServerTransport {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start_inner())
    }

    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(message))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shut();
            Ok(())
        })
    }

    fn callbacks(&self) -> &TransportCallbacks {
        &self.callbacks
    }
}

/// Closes the session when axum drops its event stream.
struct StreamGuard {
    transport: Weak<SseServerTransport>,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.shut();
        }
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

fn event_stream(rx: mpsc::UnboundedReceiver<Event>, guard: StreamGuard) -> EventStream {
    Box::pin(futures::stream::unfold(
        (rx, guard),
        |(mut rx, guard)| async move {
            let event = rx.recv().await?;
            Some((Ok::<_, Infallible>(event), (rx, guard)))
        },
    ))
}

struct ServerState {
    sse_path: String,
    message_path: String,
    sessions: Mutex<HashMap<String, Arc<SseServerTransport>>>,
    on_session: SessionCallback,
}

/// Accepts event-stream sessions and routes `POST`ed messages to them.
///
/// Cheaply cloneable; clones share the session table.
#[derive(Clone)]
pub struct SseServer {
    state: Arc<ServerState>,
}

impl SseServer {
    /// Server on the default paths. `on_session` receives each new session's
    /// transport, typically to connect an engine to it.
    pub fn new<F>(on_session: F) -> Self
    where
        F: Fn(Arc<SseServerTransport>) + Send + Sync + 'static,
    {
        Self::with_paths(DEFAULT_SSE_PATH, DEFAULT_MESSAGE_PATH, on_session)
    }

    pub fn with_paths<F>(
        sse_path: impl Into<String>,
        message_path: impl Into<String>,
        on_session: F,
    ) -> Self
    where
        F: Fn(Arc<SseServerTransport>) + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(ServerState {
                sse_path: sse_path.into(),
                message_path: message_path.into(),
                sessions: Mutex::new(HashMap::new()),
                on_session: Arc::new(on_session),
            }),
        }
    }

    /// Routes for the event stream and the message endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.sse_path, get(open_stream))
            .route(&self.state.message_path, post(post_message))
            .with_state(self.clone())
    }

    /// Live session by ID.
    pub fn session(&self, session_id: &str) -> Option<Arc<SseServerTransport>> {
        lock(&self.state.sessions).get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    /// Register a new session and return its event stream.
    fn open(&self) -> Option<EventStream> {
        let transport = Arc::new(SseServerTransport::new(self.state.message_path.clone()));
        let rx = lock(&transport.stream).take()?;
        let session_id = transport.session_id.clone();

        let sessions = Arc::downgrade(&self.state);
        let id = session_id.clone();
        let guard = StreamGuard {
            transport: Arc::downgrade(&transport),
            on_end: Some(Box::new(move || {
                if let Some(state) = sessions.upgrade() {
                    lock(&state.sessions).remove(&id);
                }
            })),
        };

        lock(&self.state.sessions).insert(session_id.clone(), transport.clone());
        tracing::debug!("Opened SSE session {}", session_id);
        (self.state.on_session)(transport);
        Some(event_stream(rx, guard))
    }
}

async fn open_stream(State(server): State<SseServer>) -> Response {
    match server.open() {
        Some(stream) => Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "event stream unavailable").into_response(),
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `POST` handler. The `Json` extractor rejects bodies that are not
/// `application/json` before this runs.
async fn post_message(
    State(server): State<SseServer>,
    Query(query): Query<SessionQuery>,
    Json(body): Json<Value>,
) -> Response {
    let Some(transport) = server.session(&query.session_id) else {
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    };
    match transport.handle_message(body) {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(RpcError::NotConnected) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "SSE connection not established",
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            format!("Error handling message: {e}"),
        )
            .into_response(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
