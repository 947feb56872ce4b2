//! In-process transport pair.
//!
//! Two linked instances deliver straight into each other's message callback.
//! Messages that arrive before the receiving side has started are queued
//! and flushed in order by its `start`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::{BoxFuture, Transport, TransportCallbacks};
use crate::error::{Result, RpcError};
use crate::protocol::Message;

#[derive(Default)]
struct Inbox {
    started: bool,
    queue: VecDeque<Message>,
}

/// One end of an in-process connection.
pub struct InMemoryTransport {
    peer: Mutex<Weak<InMemoryTransport>>,
    inbox: Mutex<Inbox>,
    callbacks: TransportCallbacks,
    start_called: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryTransport {
    fn unlinked() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(Weak::new()),
            inbox: Mutex::new(Inbox::default()),
            callbacks: TransportCallbacks::new(),
            start_called: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Create two linked transports.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::unlinked();
        let b = Self::unlinked();
        *lock(&a.peer) = Arc::downgrade(&b);
        *lock(&b.peer) = Arc::downgrade(&a);
        (a, b)
    }

    fn peer(&self) -> Option<Arc<InMemoryTransport>> {
        lock(&self.peer).upgrade()
    }

    /// Accept a message from the peer, delivering now or queueing for `start`.
    fn deliver(&self, message: Message) {
        {
            let mut inbox = lock(&self.inbox);
            if !inbox.started {
                inbox.queue.push_back(message);
                return;
            }
        }
        self.callbacks.emit_message(message);
    }

    async fn start_inner(&self) -> Result<()> {
        if self.start_called.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted);
        }

        // Drain without holding the lock across callbacks; anything the
        // callbacks cause to arrive meanwhile lands in the queue and is
        // picked up by the next round.
        loop {
            let batch: Vec<Message> = {
                let mut inbox = lock(&self.inbox);
                if inbox.queue.is_empty() {
                    inbox.started = true;
                    break;
                }
                inbox.queue.drain(..).collect()
            };
            for message in batch {
                self.callbacks.emit_message(message);
            }
        }
        Ok(())
    }

    async fn send_inner(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::NotConnected);
        }
        let Some(peer) = self.peer() else {
            let error = RpcError::ConnectionClosed;
            self.callbacks
                .emit_error(RpcError::Transport(format!("send failed: {error}")));
            return Err(error);
        };
        if peer.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        peer.deliver(message);
        Ok(())
    }

    fn shut(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.inbox).queue.clear();
        self.callbacks.emit_close();
    }

    async fn close_inner(&self) -> Result<()> {
        self.shut();
        if let Some(peer) = self.peer() {
            peer.shut();
        }
        Ok(())
    }
}

impl Transport for InMemoryTransport {
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

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use std::sync::atomic::AtomicUsize;

    fn recorder(transport: &InMemoryTransport) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.set_on_message(Arc::new(move |m| sink.lock().unwrap().push(m)));
        seen
    }

    #[tokio::test]
    async fn test_delivers_to_peer() {
        let (a, b) = InMemoryTransport::pair();
        let seen = recorder(&b);
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.send(Message::request(RequestId(1), "ping", None))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queues_until_start_in_order() {
        let (a, b) = InMemoryTransport::pair();
        let seen = recorder(&b);
        a.start().await.unwrap();

        for i in 1..=3 {
            a.send(Message::request(RequestId(i), "ping", None))
                .await
                .unwrap();
        }
        assert!(seen.lock().unwrap().is_empty());

        b.start().await.unwrap();
        let ids: Vec<_> = seen.lock().unwrap().iter().filter_map(Message::id).collect();
        assert_eq!(ids, vec![RequestId(1), RequestId(2), RequestId(3)]);
    }

    #[tokio::test]
    async fn test_close_closes_both_once() {
        let (a, b) = InMemoryTransport::pair();
        let closes = Arc::new(AtomicUsize::new(0));
        for t in [&a, &b] {
            let c = closes.clone();
            t.set_on_close(Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.close().await.unwrap();
        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 2);

        assert!(a.send(Message::notification("x", None)).await.is_err());
        assert!(b.send(Message::notification("x", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_reports_error() {
        let (a, b) = InMemoryTransport::pair();
        drop(b);
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        a.set_on_error(Arc::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        let result = a.send(Message::notification("x", None)).await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (a, _b) = InMemoryTransport::pair();
        a.start().await.unwrap();
        assert!(matches!(a.start().await, Err(RpcError::AlreadyStarted)));
    }
}
