//! Request context for handlers.
//!
//! Gives an inbound request handler what it needs beyond the params:
//! - the request ID and method
//! - the `_meta` object the peer attached
//! - a cancellation token, fired when the peer cancels or the connection closes
//! - `notify_progress` for requests that carry a progress token
//!
//! # Example
//!
//! ```ignore
//! async fn index(params: IndexParams, ctx: RequestContext) -> Result<IndexResult> {
//!     for (i, file) in params.files.iter().enumerate() {
//!         if ctx.is_cancelled() {
//!             return Err(RpcError::Cancelled);
//!         }
//!         index_file(file).await?;
//!         ctx.notify_progress(i as f64 + 1.0, Some(params.files.len() as f64)).await?;
//!     }
//!     Ok(IndexResult::default())
//! }
//! ```

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::protocol::{methods, Message, Payload, ProgressNotification, Request, RequestId};
use crate::transport::Transport;

/// Context passed to request handlers.
///
/// `RequestContext` is `Clone`; clones share the same cancellation token.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    method: String,
    meta: Option<Map<String, Value>>,
    progress_token: Option<RequestId>,
    cancel: CancellationToken,
    /// Where notifications go. `None` outside a live connection.
    transport: Option<Arc<dyn Transport>>,
}

impl RequestContext {
    /// Create a detached context (no transport), for testing handlers directly.
    pub fn new(id: RequestId, method: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            meta: None,
            progress_token: None,
            cancel: CancellationToken::new(),
            transport: None,
        }
    }

    /// Build the context for an inbound request.
    pub(crate) fn for_request(
        request: &Request,
        cancel: CancellationToken,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let params = request.params.as_ref();
        Self {
            id: request.id,
            method: request.method.clone(),
            meta: params.and_then(|p| p.meta.clone()),
            progress_token: params.and_then(Payload::progress_token),
            cancel,
            transport: Some(transport),
        }
    }

    #[inline]
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The `_meta` object sent with the request, if any.
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.meta.as_ref()
    }

    /// Token to use in progress notifications, if the peer asked for them.
    pub fn progress_token(&self) -> Option<RequestId> {
        self.progress_token
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Send `notifications/progress` for this request.
    ///
    /// A no-op when the peer sent no progress token.
    pub async fn notify_progress(&self, progress: f64, total: Option<f64>) -> Result<()> {
        let Some(token) = self.progress_token else {
            return Ok(());
        };
        let params = Payload::from_serialize(&ProgressNotification::new(token, progress, total))?;
        self.send_notification(methods::PROGRESS, Some(params)).await
    }

    /// Send an arbitrary notification on the connection serving this request.
    pub async fn send_notification(
        &self,
        method: impl Into<String>,
        params: Option<Payload>,
    ) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(RpcError::NotConnected)?;
        transport
            .send(Message::notification(method, params))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    fn request_with_token(token: i64) -> Request {
        let params = Payload::from_value(json!({"_meta": {"progressToken": token}, "n": 1})).unwrap();
        Request {
            id: RequestId(token),
            method: "index".into(),
            params: Some(params),
        }
    }

    #[test]
    fn test_context_creation() {
        let ctx = RequestContext::new(RequestId(42), "echo");
        assert_eq!(ctx.request_id(), RequestId(42));
        assert_eq!(ctx.method(), "echo");
        assert!(ctx.meta().is_none());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = RequestContext::new(RequestId(1), "x");
        let clone = ctx.clone();
        ctx.cancellation_token().cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_progress_without_token_is_noop() {
        let ctx = RequestContext::new(RequestId(1), "x");
        assert!(ctx.notify_progress(1.0, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_detached_notification_fails() {
        let ctx = RequestContext::new(RequestId(1), "x");
        let result = ctx.send_notification("x", None).await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_progress_goes_to_peer() {
        let (local, remote) = InMemoryTransport::pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        remote.set_on_message(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        remote.start().await.unwrap();

        let request = request_with_token(7);
        let ctx = RequestContext::for_request(&request, CancellationToken::new(), local);
        assert_eq!(ctx.progress_token(), Some(RequestId(7)));

        ctx.notify_progress(1.0, Some(2.0)).await.unwrap();
        let Message::Notification(n) = rx.recv().await.unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(n.method, methods::PROGRESS);
        let progress: ProgressNotification = n.params.unwrap().decode().unwrap();
        assert_eq!(progress.progress_token, RequestId(7));
        assert_eq!(progress.total, Some(2.0));
    }
}
