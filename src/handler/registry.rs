//! Handler registry for dispatching inbound traffic by method name.
//!
//! One table for requests and one for notifications, each with an optional
//! fallback consulted when no method-specific handler matches.
//!
//! # Example
//!
//! ```
//! use rpcwire::handler::{HandlerRegistry, TypedHandler};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct Sum { a: i64, b: i64 }
//!
//! #[derive(Serialize)]
//! struct Total { result: i64 }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.set_request_handler(
//!     "sum",
//!     TypedHandler::new(|p: Sum, _ctx| async move { Ok(Total { result: p.a + p.b }) }),
//! );
//! assert!(registry.request_handler("sum").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::RequestContext;
use crate::error::{Result, RpcError};
use crate::protocol::{ErrorCode, Notification, Payload, Request};
use crate::transport::BoxFuture;

/// Handles one inbound request and produces its result object.
pub trait RequestHandler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext, request: Request) -> BoxFuture<'static, Result<Payload>>;
}

/// Handles one inbound notification. Runs on the receive path, so it must
/// not block.
pub trait NotificationHandler: Send + Sync + 'static {
    fn call(&self, notification: Notification) -> Result<()>;
}

/// Adapter for closures over the raw request.
pub struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    fn call(&self, ctx: RequestContext, request: Request) -> BoxFuture<'static, Result<Payload>> {
        Box::pin((self.handler)(ctx, request))
    }
}

/// Wrapper that deserializes params before calling the handler and
/// serializes what it returns.
///
/// Params that do not decode into `T` are answered with `InvalidParams`.
pub struct TypedHandler<F, T, R, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> RequestHandler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, ctx: RequestContext, request: Request) -> BoxFuture<'static, Result<Payload>> {
        let params = request.params.unwrap_or_default();
        let parsed: T = match params.decode() {
            Ok(v) => v,
            Err(e) => {
                let err = RpcError::rpc(ErrorCode::InvalidParams, e.to_string());
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move { Payload::from_serialize(&fut.await?) })
    }
}

/// Adapter for closures over the raw notification.
pub struct FnNotificationHandler<F> {
    handler: F,
}

impl<F> FnNotificationHandler<F>
where
    F: Fn(Notification) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Notification) -> Result<()> + Send + Sync + 'static,
{
    fn call(&self, notification: Notification) -> Result<()> {
        (self.handler)(notification)
    }
}

/// Typed notification handler; undecodable params are reported as an error.
pub struct TypedNotificationHandler<F, T> {
    handler: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> TypedNotificationHandler<F, T>
where
    F: Fn(T) -> Result<()> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T> NotificationHandler for TypedNotificationHandler<F, T>
where
    F: Fn(T) -> Result<()> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    fn call(&self, notification: Notification) -> Result<()> {
        let parsed = notification.params.unwrap_or_default().decode()?;
        (self.handler)(parsed)
    }
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
    fallback_request: Option<Arc<dyn RequestHandler>>,
    fallback_notification: Option<Arc<dyn NotificationHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a request method.
    pub fn set_request_handler<H: RequestHandler>(&mut self, method: impl Into<String>, handler: H) {
        self.requests.insert(method.into(), Arc::new(handler));
    }

    pub fn remove_request_handler(&mut self, method: &str) -> bool {
        self.requests.remove(method).is_some()
    }

    /// Register (or replace) the handler for a notification method.
    pub fn set_notification_handler<H: NotificationHandler>(
        &mut self,
        method: impl Into<String>,
        handler: H,
    ) {
        self.notifications.insert(method.into(), Arc::new(handler));
    }

    pub fn remove_notification_handler(&mut self, method: &str) -> bool {
        self.notifications.remove(method).is_some()
    }

    pub fn set_fallback_request_handler<H: RequestHandler>(&mut self, handler: H) {
        self.fallback_request = Some(Arc::new(handler));
    }

    pub fn set_fallback_notification_handler<H: NotificationHandler>(&mut self, handler: H) {
        self.fallback_notification = Some(Arc::new(handler));
    }

    /// Handler for `method`, else the fallback.
    pub fn request_handler(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests
            .get(method)
            .or(self.fallback_request.as_ref())
            .cloned()
    }

    /// Notification handler for `method`, else the fallback.
    pub fn notification_handler(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications
            .get(method)
            .or(self.fallback_notification.as_ref())
            .cloned()
    }

    /// True when `method` has its own request handler (fallback not counted).
    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    pub fn has_notification_handler(&self, method: &str) -> bool {
        self.notifications.contains_key(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Sum {
        a: i64,
        b: i64,
    }

    fn request(method: &str, params: serde_json::Value) -> Request {
        Request {
            id: RequestId(1),
            method: method.into(),
            params: Some(Payload::from_value(params).unwrap()),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(RequestId(1), "test")
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        let handler = TypedHandler::new(|p: Sum, _ctx| async move {
            Ok(json!({"result": p.a + p.b}))
        });

        let result = handler
            .call(ctx(), request("sum", json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(result.fields.get("result"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_typed_handler_invalid_params() {
        let handler = TypedHandler::new(|p: Sum, _ctx| async move {
            Ok(json!({"result": p.a + p.b}))
        });

        let err = handler
            .call(ctx(), request("sum", json!({"a": "two"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams.code());
    }

    #[tokio::test]
    async fn test_unit_params_accept_missing() {
        let handler = TypedHandler::new(|_: (), _ctx| async { Ok(json!({})) });
        let req = Request {
            id: RequestId(1),
            method: "ping".into(),
            params: None,
        };
        assert!(handler.call(ctx(), req).await.is_ok());
    }

    #[test]
    fn test_lookup_and_fallback() {
        let mut registry = HandlerRegistry::new();
        registry.set_request_handler(
            "echo",
            FnHandler::new(|_ctx, req: Request| async move { Ok(req.params.unwrap_or_default()) }),
        );

        assert!(registry.request_handler("echo").is_some());
        assert!(registry.request_handler("other").is_none());

        registry.set_fallback_request_handler(FnHandler::new(|_ctx, _req| async {
            Ok(Payload::new())
        }));
        assert!(registry.request_handler("other").is_some());
        assert!(!registry.has_request_handler("other"));
    }

    #[test]
    fn test_remove_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.set_notification_handler("n", FnNotificationHandler::new(|_| Ok(())));
        assert!(registry.has_notification_handler("n"));
        assert!(registry.remove_notification_handler("n"));
        assert!(!registry.remove_notification_handler("n"));
        assert!(registry.notification_handler("n").is_none());
    }

    #[test]
    fn test_typed_notification_decode_failure() {
        let handler = TypedNotificationHandler::new(|_: Sum| Ok(()));
        let result = handler.call(Notification {
            method: "n".into(),
            params: None,
        });
        assert!(result.is_err());
    }
}
