//! Protocol engine: request correlation and inbound dispatch.
//!
//! The [`EngineBuilder`] provides a fluent API for registering handlers and
//! sinks. The [`Engine`] manages the connection lifecycle:
//! 1. `connect` installs the transport callbacks and starts the transport
//! 2. Outbound requests get a fresh ID and a pending entry, resolved exactly
//!    once by a reply, cancellation, timeout or close
//! 3. Inbound requests run on their own task, with a cancellation token
//!    derived from the connection's
//! 4. `close` (or the transport closing) fails every pending request with
//!    `ConnectionClosed` in one sweep
//!
//! # Example
//!
//! ```
//! use rpcwire::engine::Engine;
//! use rpcwire::transport::InMemoryTransport;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Sum { a: i64, b: i64 }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Total { result: i64 }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rpcwire::Result<()> {
//! let server = Engine::builder()
//!     .request_handler("sum", |p: Sum, _ctx| async move { Ok(Total { result: p.a + p.b }) })
//!     .build();
//! let client = Engine::builder().build();
//!
//! let (a, b) = InMemoryTransport::pair();
//! server.connect(b).await?;
//! client.connect(a).await?;
//!
//! let total: Total = client.send_request("sum", &json!({"a": 2, "b": 3})).await?;
//! assert_eq!(total.result, 5);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityPolicy;
use crate::error::{Result, RpcError};
use crate::handler::{
    FnHandler, FnNotificationHandler, HandlerRegistry, NotificationHandler, RequestContext,
    RequestHandler, TypedHandler, TypedNotificationHandler,
};
use crate::protocol::{ErrorCode, ErrorObject, Message, Notification, Payload, Request, RequestId};
use crate::transport::Transport;

/// Default maximum concurrent inbound handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Receives out-of-band errors: decode failures, unknown reply IDs,
/// notification handler errors, failed reply writes.
pub type ErrorSink = Arc<dyn Fn(RpcError) + Send + Sync>;

/// Invoked once when the connection closes.
pub type CloseSink = Arc<dyn Fn() + Send + Sync>;

type Resolver = oneshot::Sender<Result<Payload>>;

/// Extension points for layers built on the engine.
///
/// All methods run synchronously on the engine's own paths and must not block.
pub trait EngineHooks: Send + Sync + 'static {
    /// An inbound request is about to be handed to its handler.
    fn request_received(&self, _id: RequestId, _cancel: &CancellationToken) {}

    /// The handler for an inbound request finished (or was cancelled).
    fn request_completed(&self, _id: RequestId) {}

    /// A pending outbound request was resolved by a reply or abandoned.
    fn response_settled(&self, _id: RequestId) {}

    /// The connection is closing; runs before pending requests are failed.
    fn connection_closing(&self) {}
}

enum State {
    Disconnected,
    Connected(Arc<dyn Transport>),
    Closed,
}

struct Inner {
    state: Mutex<State>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, Resolver>>,
    handlers: RwLock<HandlerRegistry>,
    hooks: Option<Arc<dyn EngineHooks>>,
    on_error: Option<ErrorSink>,
    on_close: Option<CloseSink>,
    capabilities: Option<Arc<dyn CapabilityPolicy>>,
    enforce_strict_capabilities: bool,
    /// Parent of every inbound handler's token.
    shutdown: CancellationToken,
    handler_permits: Arc<Semaphore>,
    /// Feeds the reply writer; replies go out in the order they are queued.
    replies: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Set once the close sweep has started; checked under the pending lock.
    closed: AtomicBool,
}

/// Builder for configuring and creating an [`Engine`].
pub struct EngineBuilder {
    registry: HandlerRegistry,
    hooks: Option<Arc<dyn EngineHooks>>,
    on_error: Option<ErrorSink>,
    on_close: Option<CloseSink>,
    capabilities: Option<Arc<dyn CapabilityPolicy>>,
    enforce_strict_capabilities: bool,
    max_concurrent_handlers: usize,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            hooks: None,
            on_error: None,
            on_close: None,
            capabilities: None,
            enforce_strict_capabilities: false,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }

    /// Register a request handler with typed params and result.
    ///
    /// Params that fail to decode are answered with `InvalidParams`.
    pub fn request_handler<F, T, R, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.registry
            .set_request_handler(method, TypedHandler::new(handler));
        self
    }

    /// Register a request handler over the raw request.
    pub fn raw_request_handler<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.registry.set_request_handler(method, FnHandler::new(handler));
        self
    }

    /// Register a notification handler with typed params.
    pub fn notification_handler<F, T>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.registry
            .set_notification_handler(method, TypedNotificationHandler::new(handler));
        self
    }

    /// Register a notification handler over the raw notification.
    pub fn raw_notification_handler<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Notification) -> Result<()> + Send + Sync + 'static,
    {
        self.registry
            .set_notification_handler(method, FnNotificationHandler::new(handler));
        self
    }

    /// Handler for requests whose method has no handler of its own.
    pub fn fallback_request_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.registry
            .set_fallback_request_handler(FnHandler::new(handler));
        self
    }

    /// Handler for notifications whose method has no handler of its own.
    pub fn fallback_notification_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Notification) -> Result<()> + Send + Sync + 'static,
    {
        self.registry
            .set_fallback_notification_handler(FnNotificationHandler::new(handler));
        self
    }

    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(RpcError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(sink));
        self
    }

    pub fn on_close<F>(mut self, sink: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(sink));
        self
    }

    /// Policy consulted before each outbound request when strict
    /// enforcement is enabled.
    pub fn capability_policy<P: CapabilityPolicy>(mut self, policy: P) -> Self {
        self.capabilities = Some(Arc::new(policy));
        self
    }

    /// Default: false
    pub fn enforce_strict_capabilities(mut self, enforce: bool) -> Self {
        self.enforce_strict_capabilities = enforce;
        self
    }

    /// Set the maximum number of concurrently running inbound handlers.
    ///
    /// Requests over the limit are answered with an `InternalError`.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    /// Install lifecycle hooks. Replaces any hooks set earlier.
    pub fn hooks(mut self, hooks: Arc<dyn EngineHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub(crate) fn has_request_handler(&self, method: &str) -> bool {
        self.registry.has_request_handler(method)
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Disconnected),
                next_id: AtomicI64::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(self.registry),
                hooks: self.hooks,
                on_error: self.on_error,
                on_close: self.on_close,
                capabilities: self.capabilities,
                enforce_strict_capabilities: self.enforce_strict_capabilities,
                shutdown: CancellationToken::new(),
                handler_permits: Arc::new(Semaphore::new(self.max_concurrent_handlers)),
                replies: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A JSON-RPC endpoint bound to at most one transport.
///
/// Cheaply cloneable; clones share the same connection.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Attach to `transport` and start it.
    ///
    /// The engine takes over the transport's callbacks.
    pub async fn connect<T: Transport>(&self, transport: T) -> Result<()> {
        let transport: Arc<dyn Transport> = Arc::new(transport);

        {
            let mut state = lock(&self.inner.state);
            match *state {
                State::Connected(_) => return Err(RpcError::AlreadyConnected),
                State::Closed => return Err(RpcError::ConnectionClosed),
                State::Disconnected => {}
            }
            *state = State::Connected(transport.clone());
        }

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        *lock(&self.inner.replies) = Some(reply_tx);
        spawn_reply_writer(
            Arc::downgrade(&self.inner),
            transport.clone(),
            reply_rx,
            self.inner.shutdown.clone(),
        );

        let weak = Arc::downgrade(&self.inner);
        transport.set_on_message(Arc::new(move |message| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_message(message);
            }
        }));
        let weak = Arc::downgrade(&self.inner);
        transport.set_on_error(Arc::new(move |error| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.report(error);
            }
        }));
        let weak = Arc::downgrade(&self.inner);
        transport.set_on_close(Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.handle_closed();
            }
        }));

        if let Err(e) = transport.start().await {
            tracing::error!("Transport failed to start: {}", e);
            lock(&self.inner.replies).take();
            let mut state = lock(&self.inner.state);
            if matches!(*state, State::Connected(_)) {
                *state = State::Disconnected;
            }
            return Err(e);
        }
        tracing::debug!("Engine connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        matches!(*lock(&self.inner.state), State::Connected(_))
    }

    /// Send a request and decode its result into `R`.
    ///
    /// `params` must serialize to a JSON object, or to `null` for none.
    pub async fn send_request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = params_from(params)?;
        self.send_raw_request(method, params, None).await?.decode()
    }

    /// Send a request with a raw payload, optionally abandoning it when
    /// `cancel` fires.
    pub async fn send_raw_request(
        &self,
        method: &str,
        params: Option<Payload>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Payload> {
        self.transport()?;
        self.check_capability(method)?;
        let request = Request {
            id: self.next_request_id(),
            method: method.to_string(),
            params,
        };
        self.send_prepared(request, cancel, None).await
    }

    /// Send a notification. Fails only when not connected or the write fails.
    pub async fn send_notification<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let params = params_from(params)?;
        self.send_raw_notification(method, params).await
    }

    pub async fn send_raw_notification(&self, method: &str, params: Option<Payload>) -> Result<()> {
        let transport = self.transport()?;
        transport.send(Message::notification(method, params)).await
    }

    /// Close the transport and fail every pending request. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let transport = {
            let mut state = lock(&self.inner.state);
            match std::mem::replace(&mut *state, State::Closed) {
                State::Connected(transport) => Some(transport),
                _ => None,
            }
        };
        self.inner.shutdown.cancel();

        let result = match &transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        };
        self.inner.handle_closed();
        result
    }

    pub fn set_request_handler<H: RequestHandler>(&self, method: &str, handler: H) {
        write(&self.inner.handlers).set_request_handler(method, handler);
    }

    pub fn remove_request_handler(&self, method: &str) -> bool {
        write(&self.inner.handlers).remove_request_handler(method)
    }

    pub fn set_notification_handler<H: NotificationHandler>(&self, method: &str, handler: H) {
        write(&self.inner.handlers).set_notification_handler(method, handler);
    }

    pub fn remove_notification_handler(&self, method: &str) -> bool {
        write(&self.inner.handlers).remove_notification_handler(method)
    }

    pub fn set_fallback_request_handler<H: RequestHandler>(&self, handler: H) {
        write(&self.inner.handlers).set_fallback_request_handler(handler);
    }

    pub fn set_fallback_notification_handler<H: NotificationHandler>(&self, handler: H) {
        write(&self.inner.handlers).set_fallback_notification_handler(handler);
    }

    /// Number of outbound requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Allocate the next request ID.
    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Run the capability gate for `method`, if strict enforcement is on.
    pub(crate) fn check_capability(&self, method: &str) -> Result<()> {
        if !self.inner.enforce_strict_capabilities {
            return Ok(());
        }
        match &self.inner.capabilities {
            Some(policy) => policy.assert_capability_for_method(method),
            None => Ok(()),
        }
    }

    pub(crate) fn report_error(&self, error: RpcError) {
        self.inner.report(error);
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.inner.transport()
    }

    /// Send a request whose ID is already allocated and wait for its outcome.
    ///
    /// `cancel` and `timeout` cover the write as well as the wait for the
    /// reply. The pending entry is removed by whichever of reply, `cancel`,
    /// `timeout` or close happens first, or when this future is dropped.
    pub(crate) async fn send_prepared(
        &self,
        request: Request,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<Payload> {
        let transport = self.transport()?;
        let id = request.id;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = lock(&self.inner.pending);
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(RpcError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }
        let mut guard = PendingGuard::new(&self.inner, id);

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);
        tokio::pin!(deadline);

        tracing::debug!("Sending request {} ({})", id, request.method);
        tokio::select! {
            sent = transport.send(Message::Request(request)) => sent?,
            _ = &mut cancelled => return Err(RpcError::Cancelled),
            _ = &mut deadline => {
                tracing::debug!("Request {} timed out while writing", id);
                return Err(RpcError::Timeout);
            }
        }

        tokio::select! {
            outcome = &mut rx => {
                // Settled through the table by a reply or the close sweep
                guard.disarm();
                outcome.unwrap_or(Err(RpcError::ConnectionClosed))
            }
            _ = &mut cancelled => Err(RpcError::Cancelled),
            _ = &mut deadline => {
                tracing::debug!("Request {} timed out", id);
                Err(RpcError::Timeout)
            }
        }
    }
}

/// Removes a pending entry when its request future ends without a reply.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: RequestId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(inner: &'a Inner, id: RequestId) -> Self {
        Self {
            inner,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abandon(self.id);
        }
    }
}

impl Inner {
    fn transport(&self) -> Result<Arc<dyn Transport>> {
        match &*lock(&self.state) {
            State::Connected(transport) => Ok(transport.clone()),
            _ => Err(RpcError::NotConnected),
        }
    }

    fn report(&self, error: RpcError) {
        match &self.on_error {
            Some(sink) => sink(error),
            None => tracing::warn!("{}", error),
        }
    }

    fn on_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::Request(request) => self.on_request(request),
            Message::Notification(notification) => self.on_notification(notification),
            Message::Response(response) => self.on_reply(response.id, Ok(response.result)),
            Message::Error(error) => self.on_reply(error.id, Err(RpcError::Rpc(error.error))),
        }
    }

    fn on_request(self: &Arc<Self>, request: Request) {
        let transport = match self.transport() {
            Ok(t) => t,
            Err(_) => {
                tracing::debug!("Dropping request {} after close", request.id);
                return;
            }
        };

        let handler = read(&self.handlers).request_handler(&request.method);
        let Some(handler) = handler else {
            tracing::warn!("No handler for method {}", request.method);
            let reply = ErrorObject::new(ErrorCode::MethodNotFound, "Method not found");
            self.queue_reply(Message::error(request.id, reply));
            return;
        };

        // Permit is held until the handler task completes
        let permit = match self.handler_permits.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    "Handler capacity reached, rejecting request {} for method {}",
                    request.id,
                    request.method
                );
                let reply = ErrorObject::new(ErrorCode::InternalError, "handler capacity reached");
                self.queue_reply(Message::error(request.id, reply));
                return;
            }
        };

        let id = request.id;
        let cancel = self.shutdown.child_token();
        if let Some(hooks) = &self.hooks {
            hooks.request_received(id, &cancel);
        }
        let ctx = RequestContext::for_request(&request, cancel.clone(), transport.clone());
        let inner = self.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let method = request.method.clone();

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = handler.call(ctx, request) => Some(result),
            };

            let reply = match outcome {
                // Checked again right before sending
                _ if cancel.is_cancelled() => None,
                None | Some(Err(RpcError::Cancelled)) => None,
                Some(Ok(result)) => Some(Message::response(id, result)),
                Some(Err(e)) => {
                    tracing::debug!("Handler error for method {}: {}", method, e);
                    Some(Message::error(id, e.to_error_object()))
                }
            };

            match reply {
                Some(reply) => inner.queue_reply(reply),
                None => tracing::debug!("Request {} cancelled, not replying", id),
            }

            if let Some(hooks) = &inner.hooks {
                hooks.request_completed(id);
            }
        });
    }

    /// Hand a reply to the writer task. Dropped once the connection closed.
    fn queue_reply(&self, reply: Message) {
        let sent = match &*lock(&self.replies) {
            Some(replies) => replies.send(reply).is_ok(),
            None => false,
        };
        if !sent {
            tracing::debug!("Dropping reply after close");
        }
    }

    fn on_notification(&self, notification: Notification) {
        let handler = read(&self.handlers).notification_handler(&notification.method);
        match handler {
            Some(handler) => {
                if let Err(e) = handler.call(notification) {
                    self.report(e);
                }
            }
            None => tracing::debug!("No handler for notification {}", notification.method),
        }
    }

    fn on_reply(&self, id: RequestId, outcome: Result<Payload>) {
        let resolver = lock(&self.pending).remove(&id);
        match resolver {
            Some(resolver) => {
                if let Some(hooks) = &self.hooks {
                    hooks.response_settled(id);
                }
                let _ = resolver.send(outcome);
            }
            None => self.report(RpcError::UnknownRequestId(id)),
        }
    }

    /// Drop a pending entry after a local timeout or cancellation.
    fn abandon(&self, id: RequestId) {
        if lock(&self.pending).remove(&id).is_some() {
            if let Some(hooks) = &self.hooks {
                hooks.response_settled(id);
            }
        }
    }

    /// Close sweep. Runs once, whether the close came from us or the transport.
    fn handle_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.state) = State::Closed;
        self.shutdown.cancel();
        lock(&self.replies).take();

        if let Some(hooks) = &self.hooks {
            hooks.connection_closing();
        }

        let drained = std::mem::take(&mut *lock(&self.pending));
        if !drained.is_empty() {
            tracing::debug!("Failing {} pending requests on close", drained.len());
        }
        for (_, resolver) in drained {
            let _ = resolver.send(Err(RpcError::ConnectionClosed));
        }

        if let Some(sink) = &self.on_close {
            sink();
        }
    }
}

/// Writes queued replies one at a time until the connection shuts down.
fn spawn_reply_writer(
    inner: Weak<Inner>,
    transport: Arc<dyn Transport>,
    mut replies: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let reply = tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = replies.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            if let Err(e) = transport.send(reply).await {
                match inner.upgrade() {
                    Some(inner) => inner.report(RpcError::Transport(format!(
                        "failed to send response: {e}"
                    ))),
                    None => break,
                }
            }
        }
        tracing::debug!("Reply writer stopped");
    });
}

/// Serialize outbound params; `null` means no params.
fn params_from<P: Serialize + ?Sized>(params: &P) -> Result<Option<Payload>> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        value @ Value::Object(_) => Payload::from_value(value).map(Some),
        _ => Err(RpcError::Encode("params must serialize to a JSON object".into())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
