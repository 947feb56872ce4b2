//! Callback slots shared by every transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RpcError;
use crate::protocol::Message;

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(RpcError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// The three callback slots plus a once-only guard for `on_close`.
///
/// Slots are cloned out of their lock before invocation, so a callback may
/// itself replace a slot without deadlocking.
#[derive(Default)]
pub struct TransportCallbacks {
    on_message: Mutex<Option<MessageCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

impl TransportCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_message(&self, callback: MessageCallback) {
        *lock(&self.on_message) = Some(callback);
    }

    pub fn set_on_error(&self, callback: ErrorCallback) {
        *lock(&self.on_error) = Some(callback);
    }

    pub fn set_on_close(&self, callback: CloseCallback) {
        *lock(&self.on_close) = Some(callback);
    }

    /// Report an inbound message. Dropped with a log line if no callback is set.
    pub fn emit_message(&self, message: Message) {
        let callback = lock(&self.on_message).clone();
        match callback {
            Some(cb) => cb(message),
            None => tracing::debug!("Dropping {} with no message callback", message.kind()),
        }
    }

    /// Report a transport-level error.
    pub fn emit_error(&self, error: RpcError) {
        let callback = lock(&self.on_error).clone();
        match callback {
            Some(cb) => cb(error),
            None => tracing::warn!("Transport error: {}", error),
        }
    }

    /// Report that the transport closed. Only the first call has any effect.
    pub fn emit_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = lock(&self.on_close).clone();
        if let Some(cb) = callback {
            cb();
        }
    }

    /// True once `emit_close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
