//! Request lifecycle on top of the engine: timeouts, cancellation
//! notifications and progress.
//!
//! A [`Session`] wraps an [`Engine`] and keeps two side tables:
//! - progress sinks for outbound requests, keyed by progress token
//! - cancellation tokens for inbound requests still being handled
//!
//! Outbound requests that time out or are cancelled locally are announced
//! to the peer with `notifications/cancelled`. Inbound
//! `notifications/cancelled` fire the matching handler's token; inbound
//! `notifications/progress` reach the sink registered for their token.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityPolicy;
use crate::engine::{Engine, EngineBuilder, EngineHooks};
use crate::error::{Result, RpcError};
use crate::handler::RequestContext;
use crate::protocol::{
    methods, CancelledNotification, Payload, ProgressNotification, Request, RequestId,
    PROGRESS_TOKEN_KEY,
};
use crate::transport::Transport;

/// Timeout applied when [`RequestOptions::timeout`] is unset.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives progress updates for one outbound request.
///
/// Called synchronously on the receive path; must not block.
pub type ProgressSink = Arc<dyn Fn(ProgressNotification) + Send + Sync>;

/// Per-request options for [`Session::send_request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressSink>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request progress updates; the request ID doubles as the progress token.
    pub fn on_progress<F>(mut self, sink: F) -> Self
    where
        F: Fn(ProgressNotification) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(sink));
        self
    }

    /// Abandon the request when `token` fires.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Default)]
struct SideTables {
    progress: Mutex<HashMap<RequestId, ProgressSink>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl SideTables {
    fn on_cancelled(&self, notification: CancelledNotification) -> Result<()> {
        let token = lock(&self.in_flight).get(&notification.request_id).cloned();
        match token {
            Some(token) => {
                tracing::debug!(
                    "Peer cancelled request {}: {}",
                    notification.request_id,
                    notification.reason.as_deref().unwrap_or("no reason")
                );
                token.cancel();
            }
            // Already finished, or never seen
            None => tracing::debug!(
                "Cancel for unknown request {}",
                notification.request_id
            ),
        }
        Ok(())
    }

    fn on_progress(&self, notification: ProgressNotification) -> Result<()> {
        let token = notification.progress_token;
        let sink = lock(&self.progress).get(&token).cloned();
        match sink {
            Some(sink) => {
                sink(notification);
                Ok(())
            }
            None => Err(RpcError::UnknownProgressToken(token)),
        }
    }
}

impl EngineHooks for SideTables {
    fn request_received(&self, id: RequestId, cancel: &CancellationToken) {
        lock(&self.in_flight).insert(id, cancel.clone());
    }

    fn request_completed(&self, id: RequestId) {
        lock(&self.in_flight).remove(&id);
    }

    fn response_settled(&self, id: RequestId) {
        lock(&self.progress).remove(&id);
    }

    fn connection_closing(&self) {
        lock(&self.progress).clear();
        lock(&self.in_flight).clear();
    }
}

/// Builder for a [`Session`].
///
/// Handlers and sinks are configured on the wrapped [`EngineBuilder`]; the
/// session installs its own hooks and the `notifications/cancelled` and
/// `notifications/progress` handlers at build time.
pub struct SessionBuilder {
    engine: EngineBuilder,
    default_timeout: Duration,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            engine: EngineBuilder::new(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Start from an already configured engine builder.
    pub fn with_engine(engine: EngineBuilder) -> Self {
        Self {
            engine,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Default: 60s
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn request_handler<F, T, R, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.engine = self.engine.request_handler(method, handler);
        self
    }

    pub fn raw_request_handler<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.engine = self.engine.raw_request_handler(method, handler);
        self
    }

    pub fn notification_handler<F, T>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.engine = self.engine.notification_handler(method, handler);
        self
    }

    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(RpcError) + Send + Sync + 'static,
    {
        self.engine = self.engine.on_error(sink);
        self
    }

    pub fn on_close<F>(mut self, sink: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.engine = self.engine.on_close(sink);
        self
    }

    pub fn capability_policy<P: CapabilityPolicy>(mut self, policy: P) -> Self {
        self.engine = self.engine.capability_policy(policy);
        self
    }

    pub fn enforce_strict_capabilities(mut self, enforce: bool) -> Self {
        self.engine = self.engine.enforce_strict_capabilities(enforce);
        self
    }

    pub fn build(self) -> Session {
        let tables = Arc::new(SideTables::default());
        let mut engine = self.engine.hooks(tables.clone());

        if !engine.has_request_handler(methods::PING) {
            engine = engine.raw_request_handler(methods::PING, |_ctx, _req| async {
                Ok(Payload::new())
            });
        }

        let cancelled = tables.clone();
        let progress = tables.clone();
        let engine = engine
            .notification_handler(methods::CANCELLED, move |n: CancelledNotification| {
                cancelled.on_cancelled(n)
            })
            .notification_handler(methods::PROGRESS, move |n: ProgressNotification| {
                progress.on_progress(n)
            })
            .build();

        Session {
            engine,
            tables,
            default_timeout: self.default_timeout,
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An [`Engine`] with request timeouts, cancellation and progress.
#[derive(Clone)]
pub struct Session {
    engine: Engine,
    tables: Arc<SideTables>,
    default_timeout: Duration,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The underlying engine, for handler registration at runtime.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn connect<T: Transport>(&self, transport: T) -> Result<()> {
        self.engine.connect(transport).await
    }

    pub async fn close(&self) -> Result<()> {
        self.engine.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Send a request and decode its result into `R`.
    pub async fn send_request<P, R>(
        &self,
        method: &str,
        params: &P,
        options: RequestOptions,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            value => Some(Payload::from_value(value)?),
        };
        self.send_raw_request(method, params, options).await?.decode()
    }

    /// Send a request with a raw payload.
    ///
    /// On timeout or local cancellation the pending entry and progress sink
    /// are removed and the peer is sent `notifications/cancelled`.
    pub async fn send_raw_request(
        &self,
        method: &str,
        params: Option<Payload>,
        options: RequestOptions,
    ) -> Result<Payload> {
        if !self.engine.is_connected() {
            return Err(RpcError::NotConnected);
        }
        self.engine.check_capability(method)?;

        let id = self.engine.next_request_id();
        let mut params = params;
        let _progress = options.on_progress.map(|sink| {
            lock(&self.tables.progress).insert(id, sink);
            params
                .get_or_insert_with(Payload::new)
                .set_meta(PROGRESS_TOKEN_KEY, Value::from(id.value()));
            ProgressGuard {
                tables: &self.tables,
                id,
            }
        });

        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let outcome = self
            .engine
            .send_prepared(request, options.cancel.as_ref(), Some(timeout))
            .await;

        match &outcome {
            Err(RpcError::Timeout) => self.announce_cancel(id, "request timed out"),
            Err(RpcError::Cancelled) => self.announce_cancel(id, "request cancelled"),
            _ => {}
        }
        outcome
    }

    pub async fn send_notification<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        self.engine.send_notification(method, params).await
    }

    /// Send `ping` and wait for the empty reply.
    pub async fn ping(&self) -> Result<()> {
        self.send_raw_request(methods::PING, None, RequestOptions::default())
            .await
            .map(|_| ())
    }

    /// Tell the peer to stop working on `id`. Runs on its own task so a
    /// stalled transport cannot hold up the caller.
    fn announce_cancel(&self, id: RequestId, reason: &str) {
        let notification = CancelledNotification::new(id, reason);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine
                .send_notification(methods::CANCELLED, &notification)
                .await
            {
                engine.report_error(RpcError::Transport(format!(
                    "failed to send cancel notification for request {id}: {e}"
                )));
            }
        });
    }
}

/// Removes a progress sink when its request ends, however it ends.
struct ProgressGuard<'a> {
    tables: &'a SideTables,
    id: RequestId,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        lock(&self.tables.progress).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::transport::{BoxFuture, InMemoryTransport, TransportCallbacks};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn raw_peer(transport: &Arc<InMemoryTransport>) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_on_message(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        transport.start().await.unwrap();
        rx
    }

    #[tokio::test]
    async fn test_timeout_sends_cancel() {
        let session = Session::builder().build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        let mut rx = raw_peer(&b).await;

        let result = session
            .send_raw_request(
                "slow",
                None,
                RequestOptions::new().timeout(Duration::from_millis(10)),
            )
            .await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert_eq!(session.engine().pending_requests(), 0);

        let Message::Request(req) = rx.recv().await.unwrap() else {
            panic!("expected request");
        };
        let Message::Notification(n) = rx.recv().await.unwrap() else {
            panic!("expected cancel notification");
        };
        assert_eq!(n.method, methods::CANCELLED);
        let cancel: CancelledNotification = n.params.unwrap().decode().unwrap();
        assert_eq!(cancel.request_id, req.id);
        assert_eq!(cancel.reason.as_deref(), Some("request timed out"));
    }

    #[tokio::test]
    async fn test_progress_token_injected_and_routed() {
        let session = Session::builder().build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        let mut rx = raw_peer(&b).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let call = {
            let session = session.clone();
            tokio::spawn(async move {
                let options = RequestOptions::new().on_progress(move |p| {
                    let _ = seen_tx.send(p.progress);
                });
                session.send_raw_request("index", None, options).await
            })
        };

        let Message::Request(req) = rx.recv().await.unwrap() else {
            panic!("expected request");
        };
        let token = req.params.as_ref().and_then(Payload::progress_token);
        assert_eq!(token, Some(req.id));

        let progress = Payload::from_serialize(&ProgressNotification::new(req.id, 0.5, Some(1.0)))
            .unwrap();
        b.send(Message::notification(methods::PROGRESS, Some(progress)))
            .await
            .unwrap();
        assert_eq!(seen_rx.recv().await, Some(0.5));

        b.send(Message::response(req.id, Payload::new())).await.unwrap();
        assert!(call.await.unwrap().is_ok());
        assert!(lock(&session.tables.progress).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_progress_token_is_reported() {
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let session = Session::builder()
            .on_error(move |e| {
                let _ = err_tx.send(e);
            })
            .build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        b.start().await.unwrap();

        let progress =
            Payload::from_serialize(&ProgressNotification::new(RequestId(42), 1.0, None)).unwrap();
        b.send(Message::notification(methods::PROGRESS, Some(progress)))
            .await
            .unwrap();

        match err_rx.recv().await {
            Some(RpcError::UnknownProgressToken(token)) => assert_eq!(token, RequestId(42)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_cancel_fires_handler_token() {
        let (cancelled_tx, mut cancelled_rx) = mpsc::unbounded_channel();
        let session = Session::builder()
            .raw_request_handler("hang", move |ctx, _req| {
                let done = cancelled_tx.clone();
                async move {
                    let token = ctx.cancellation_token().clone();
                    tokio::spawn(async move {
                        token.cancelled().await;
                        let _ = done.send(());
                    });
                    ctx.cancelled().await;
                    Ok(Payload::new())
                }
            })
            .build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        let mut rx = raw_peer(&b).await;

        b.send(Message::request(RequestId(5), "hang", None))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let cancel = Payload::from_serialize(&CancelledNotification::new(RequestId(5), "stop"))
            .unwrap();
        b.send(Message::notification(methods::CANCELLED, Some(cancel)))
            .await
            .unwrap();

        cancelled_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "cancelled request must not be answered");
        assert!(lock(&session.tables.in_flight).is_empty());
    }

    #[tokio::test]
    async fn test_local_cancel_announced() {
        let session = Session::builder().build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        let mut rx = raw_peer(&b).await;

        let token = CancellationToken::new();
        let call = {
            let session = session.clone();
            let token = token.clone();
            tokio::spawn(async move {
                session
                    .send_raw_request("slow", None, RequestOptions::new().cancel(token))
                    .await
            })
        };
        let Message::Request(_) = rx.recv().await.unwrap() else {
            panic!("expected request");
        };
        token.cancel();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));

        let Message::Notification(n) = rx.recv().await.unwrap() else {
            panic!("expected cancel notification");
        };
        let cancel: CancelledNotification = n.params.unwrap().decode().unwrap();
        assert_eq!(cancel.reason.as_deref(), Some("request cancelled"));
    }

    #[derive(Default)]
    struct StuckTransport {
        callbacks: TransportCallbacks,
    }

    impl Transport for StuckTransport {
        fn start(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send(&self, _message: Message) -> BoxFuture<'_, Result<()>> {
            Box::pin(std::future::pending())
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn callbacks(&self) -> &TransportCallbacks {
            &self.callbacks
        }
    }

    #[tokio::test]
    async fn test_timeout_with_stuck_write_returns() {
        let session = Session::builder().build();
        session.connect(StuckTransport::default()).await.unwrap();

        let options = RequestOptions::new()
            .timeout(Duration::from_millis(10))
            .on_progress(|_| {});
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            session.send_raw_request("slow", None, options),
        )
        .await
        .expect("request must time out while the write is stuck");
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert_eq!(session.engine().pending_requests(), 0);
        assert!(lock(&session.tables.progress).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_request_removes_progress_sink() {
        let session = Session::builder().build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        let mut rx = raw_peer(&b).await;

        let options = RequestOptions::new().on_progress(|_| {});
        let call = session.send_raw_request("slow", None, options);
        assert!(tokio::time::timeout(Duration::from_millis(10), call)
            .await
            .is_err());

        assert!(matches!(rx.recv().await, Some(Message::Request(_))));
        assert!(lock(&session.tables.progress).is_empty());
        assert_eq!(session.engine().pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ping_answered_by_default() {
        let server = Session::builder().build();
        let client = Session::builder().build();
        let (a, b) = InMemoryTransport::pair();
        server.connect(b).await.unwrap();
        client.connect(a).await.unwrap();

        client.ping().await.unwrap();
        let echoed: Value = client
            .send_request(methods::PING, &json!(null), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(echoed, json!({}));
    }

    #[tokio::test]
    async fn test_close_clears_side_tables() {
        let session = Session::builder().build();
        let (a, b) = InMemoryTransport::pair();
        session.connect(a).await.unwrap();
        let mut rx = raw_peer(&b).await;

        let call = {
            let session = session.clone();
            tokio::spawn(async move {
                let options = RequestOptions::new().on_progress(|_| {});
                session.send_raw_request("slow", None, options).await
            })
        };
        rx.recv().await.unwrap();
        session.close().await.unwrap();

        assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
        assert!(lock(&session.tables.progress).is_empty());
    }
}
