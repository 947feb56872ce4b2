//! Server-sent events client transport.
//!
//! Inbound traffic arrives on a long-lived `GET` opened as an event stream;
//! outbound messages are `POST`ed to the endpoint the server announces in
//! its first `endpoint` event.
//!
//! ```text
//! GET  /sse            ──►  event: endpoint   data: /messages?session=abc
//!                      ◄──  event: message    data: {"jsonrpc":"2.0",...}
//! POST /messages?session=abc  {"jsonrpc":"2.0",...}
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BoxFuture, Transport, TransportCallbacks};
use crate::error::{Result, RpcError};
use crate::protocol::Message;

const EVENT_STREAM: &str = "text/event-stream";

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SseEvent {
    /// Event name; `message` when the server sent none.
    event: String,
    /// `data:` lines joined with `\n`.
    data: String,
    id: Option<String>,
}

/// Incremental event-stream decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    out.push(event);
                }
                continue;
            }
            // Comment / keep-alive
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}

/// Where outbound messages go, as learned from the event stream.
#[derive(Debug, Clone)]
enum Endpoint {
    Pending,
    Ready(Url),
    Failed(String),
}

/// Builder for [`SseClientTransport`].
pub struct SseClientTransportBuilder {
    url: String,
    client: Option<reqwest::Client>,
    headers: HeaderMap,
}

impl SseClientTransportBuilder {
    /// Use a preconfigured HTTP client (proxies, TLS roots, timeouts).
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Add a header to both the event-stream `GET` and every `POST`.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn build(self) -> Result<SseClientTransport> {
        let url = Url::parse(&self.url)?;
        let (endpoint, _) = watch::channel(Endpoint::Pending);
        Ok(SseClientTransport {
            url,
            client: self.client.unwrap_or_default(),
            headers: self.headers,
            callbacks: Arc::new(TransportCallbacks::new()),
            endpoint: Arc::new(endpoint),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

/// Client side of an HTTP + server-sent events connection.
pub struct SseClientTransport {
    url: Url,
    client: reqwest::Client,
    headers: HeaderMap,
    callbacks: Arc<TransportCallbacks>,
    endpoint: Arc<watch::Sender<Endpoint>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SseClientTransport {
    pub fn builder(url: impl Into<String>) -> SseClientTransportBuilder {
        SseClientTransportBuilder {
            url: url.into(),
            client: None,
            headers: HeaderMap::new(),
        }
    }

    /// Transport with a default HTTP client and no extra headers.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::builder(url).build()
    }

    /// Token that stops the event stream and any waiting `send`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// POST target announced by the server, once known.
    pub fn endpoint(&self) -> Option<Url> {
        match &*self.endpoint.borrow() {
            Endpoint::Ready(url) => Some(url.clone()),
            _ => None,
        }
    }

    async fn start_inner(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted);
        }

        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, EVENT_STREAM)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!("Opened event stream at {}", self.url);

        let task = tokio::spawn(read_events(
            response,
            self.url.clone(),
            self.callbacks.clone(),
            self.endpoint.clone(),
            self.shutdown.clone(),
        ));
        *lock(&self.task) = Some(task);

        self.wait_for_endpoint().await.map(|_| ())
    }

    async fn wait_for_endpoint(&self) -> Result<Url> {
        let mut rx = self.endpoint.subscribe();
        let state = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(RpcError::Cancelled),
            state = rx.wait_for(|e| !matches!(e, Endpoint::Pending)) => {
                state.map_err(|_| RpcError::ConnectionClosed)?.clone()
            }
        };
        match state {
            Endpoint::Ready(url) => Ok(url),
            Endpoint::Failed(reason) => Err(RpcError::Transport(reason)),
            Endpoint::Pending => Err(RpcError::ConnectionClosed),
        }
    }

    async fn send_inner(&self, message: Message) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RpcError::NotConnected);
        }
        match self.post(&message).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.callbacks
                    .emit_error(RpcError::Transport(format!("send failed: {error}")));
                Err(error)
            }
        }
    }

    async fn post(&self, message: &Message) -> Result<()> {
        let endpoint = self.wait_for_endpoint().await?;
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RpcError::Transport(format!(
                "error POSTing to endpoint: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close_inner(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.endpoint.send_if_modified(|e| {
            if matches!(e, Endpoint::Pending) {
                *e = Endpoint::Failed("transport closed".into());
                true
            } else {
                false
            }
        });
        self.callbacks.emit_close();
        Ok(())
    }
}

impl Transport for SseClientTransport {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start_inner())
    }

    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(message))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.close_inner())
    }

    fn callbacks(&self) -> &TransportCallbacks {
        &self.callbacks
    }
}

impl Drop for SseClientTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

async fn read_events(
    mut response: reqwest::Response,
    base: Url,
    callbacks: Arc<TransportCallbacks>,
    endpoint: Arc<watch::Sender<Endpoint>>,
    shutdown: CancellationToken,
) {
    let mut decoder = SseDecoder::default();

    let reason = 'stream: loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break 'stream "transport closed".to_string(),
            chunk = response.chunk() => chunk,
        };
        let chunk = match chunk {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break 'stream "event stream ended".to_string(),
            Err(e) => {
                callbacks.emit_error(RpcError::Http(e));
                break 'stream "event stream failed".to_string();
            }
        };

        for event in decoder.push(&chunk) {
            match event.event.as_str() {
                "endpoint" => match base.join(event.data.trim()) {
                    Ok(url) => {
                        tracing::debug!("Event stream announced endpoint {}", url);
                        endpoint.send_replace(Endpoint::Ready(url));
                    }
                    Err(e) => {
                        callbacks.emit_error(RpcError::Url(e));
                        break 'stream "invalid endpoint".to_string();
                    }
                },
                "error" => {
                    callbacks.emit_error(RpcError::Transport(format!(
                        "error receiving SSE event: {}",
                        event.data
                    )));
                    break 'stream "server sent an error event".to_string();
                }
                "open" => {}
                _ => match Message::decode(event.data.as_bytes()) {
                    Ok(message) => callbacks.emit_message(message),
                    Err(e) => callbacks.emit_error(e),
                },
            }
        }
    };

    tracing::debug!("Event stream reader stopped: {}", reason);
    endpoint.send_if_modified(|e| {
        if matches!(e, Endpoint::Pending) {
            *e = Endpoint::Failed(reason.clone());
            true
        } else {
            false
        }
    });
    callbacks.emit_close();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_named_event() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"event: endpoint\ndata: /messages?s=1\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "endpoint".into(),
                data: "/messages?s=1".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn test_unnamed_event_is_message() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: {\"jsonrpc\":\"2.0\"}\r\n\r\n");
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn test_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_waits_for_blank_line_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: message\nda").is_empty());
        assert!(decoder.push(b"ta: {}\n").is_empty());
        let events = decoder.push(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_ignores_comments_and_empty_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keep-alive\n\nevent: open\n\n").is_empty());
        // the dropped event name must not leak into the next event
        let events = decoder.push(b"data: x\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_keeps_split_utf8_intact() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|&b| b == 0xc3).unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..])[0].data, "héllo");
    }

    #[test]
    fn test_endpoint_resolves_against_base() {
        let base = Url::parse("http://localhost:8080/sse").unwrap();
        let url = base.join("/messages?sessionId=42").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/messages?sessionId=42");
    }

    #[test]
    fn test_builder_rejects_bad_url() {
        assert!(matches!(
            SseClientTransport::new("not a url"),
            Err(RpcError::Url(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = SseClientTransport::new("http://127.0.0.1:1/sse").unwrap();
        let result = transport.send(Message::notification("x", None)).await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_without_endpoint_reports_error() {
        let transport = SseClientTransport::new("http://127.0.0.1:1/sse").unwrap();
        let (err_tx, mut err_rx) = tokio::sync::mpsc::unbounded_channel();
        transport.set_on_error(Arc::new(move |e| {
            let _ = err_tx.send(e.to_string());
        }));
        transport.started.store(true, Ordering::Release);
        transport
            .endpoint
            .send_replace(Endpoint::Failed("event stream ended".into()));

        let result = transport.send(Message::notification("x", None)).await;
        assert!(matches!(result, Err(RpcError::Transport(_))));
        let reported = err_rx.try_recv().unwrap();
        assert!(reported.contains("send failed"), "{reported}");
        assert!(reported.contains("event stream ended"), "{reported}");
    }
}
