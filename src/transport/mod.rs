//! Transport module - bidirectional message carriers.
//!
//! A transport moves whole [`Message`]s between two peers and reports what
//! it receives through three callbacks (message, error, close). Provided
//! implementations:
//! - [`StdioClientTransport`] - spawns a child process and talks over its pipes
//! - [`StreamTransport`] - any `AsyncRead`/`AsyncWrite` pair, including our own stdio
//! - [`SseClientTransport`] - server-sent event stream in, HTTP POST out
//! - [`SseServerTransport`] - the server half, one per session, served by [`SseServer`]
//! - [`InMemoryTransport`] - linked pair inside one process, for tests
//!
//! Callbacks are installed before `start` and are expected to be invoked
//! from a single reader task per transport; `on_close` fires at most once.

mod callbacks;
mod memory;
mod sse;
mod sse_server;
mod stdio;
mod stream;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use callbacks::{CloseCallback, ErrorCallback, MessageCallback, TransportCallbacks};
pub use memory::InMemoryTransport;
pub use sse::{SseClientTransport, SseClientTransportBuilder};
pub use sse_server::{
    EventStream, SessionCallback, SseServer, SseServerTransport, DEFAULT_MESSAGE_PATH,
    DEFAULT_SSE_PATH, SESSION_ID_PARAM,
};
pub use stdio::{StderrSink, StdioClientTransport, StdioServerParameters};
pub use stream::StreamTransport;

use crate::error::Result;
use crate::protocol::Message;

/// Boxed future returned by transport and handler trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Carrier of messages between two peers.
pub trait Transport: Send + Sync + 'static {
    /// Begin receiving. A second call fails with
    /// [`RpcError::AlreadyStarted`](crate::error::RpcError::AlreadyStarted).
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Deliver one message to the peer.
    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// Stop the transport and release its resources. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Callback slots this transport reports into.
    fn callbacks(&self) -> &TransportCallbacks;

    fn set_on_message(&self, callback: MessageCallback) {
        self.callbacks().set_on_message(callback);
    }

    fn set_on_error(&self, callback: ErrorCallback) {
        self.callbacks().set_on_error(callback);
    }

    fn set_on_close(&self, callback: CloseCallback) {
        self.callbacks().set_on_close(callback);
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        (**self).start()
    }

    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        (**self).send(message)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        (**self).close()
    }

    fn callbacks(&self) -> &TransportCallbacks {
        (**self).callbacks()
    }
}
