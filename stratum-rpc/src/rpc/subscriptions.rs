//! Subscription listeners and notification fan-out.
//!
//! Each `*.subscribe` call registers a fresh unbounded queue under its
//! method name. Notifications for that method are broadcast to every queue,
//! oldest listener first. A slow consumer builds up backlog; nothing is
//! dropped on its behalf.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Identifies one listener within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    tx: mpsc::UnboundedSender<Value>,
}

/// Stream of notification payloads for one subscribed method.
///
/// Ends (yields `None`) once the registry drops the listener, which happens
/// on [`unsubscribe`](SubscriptionRegistry::unsubscribe) and on connection
/// teardown. Servers forget subscriptions when the connection goes away, so
/// an ended stream means "subscribe again after reconnecting".
#[derive(Debug)]
pub struct Subscription {
    method: String,
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Method this listener is registered under.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Registry id of this listener.
    pub fn listener_id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next notification payload.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Take a queued payload without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

/// Method name -> listeners, in registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener for `method`.
    pub fn register(&self, method: &str) -> Subscription {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        self.listeners
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(Listener { id, tx });

        debug!(method, listener = id.0, "Registered subscription listener");

        Subscription {
            method: method.to_string(),
            id,
            rx,
        }
    }

    /// Broadcast a payload to every listener for `method`.
    ///
    /// Returns how many listeners received it. Listeners whose consumer has
    /// gone away are pruned.
    pub fn notify(&self, method: &str, payload: Value) -> usize {
        let mut listeners = self.listeners.lock();

        let Some(queues) = listeners.get_mut(method) else {
            warn!(method, "Notification for method with no subscribers");
            return 0;
        };

        queues.retain(|listener| listener.tx.send(payload.clone()).is_ok());
        let delivered = queues.len();

        if delivered == 0 {
            listeners.remove(method);
            warn!(method, "Notification for method whose listeners are gone");
        } else {
            trace!(method, delivered, "Fanned out notification");
        }

        delivered
    }

    /// Remove one listener; its stream ends once drained.
    pub fn unsubscribe(&self, method: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(queues) = listeners.get_mut(method) else {
            return false;
        };

        let before = queues.len();
        queues.retain(|listener| listener.id != id);
        let removed = queues.len() != before;

        if queues.is_empty() {
            listeners.remove(method);
        }
        removed
    }

    /// Drop every listener. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut *self.listeners.lock());
        let count = drained.values().map(Vec::len).sum();
        if count > 0 {
            debug!(count, "Dropped subscription listeners");
        }
        count
    }

    /// Number of live listeners for `method`.
    pub fn listener_count(&self, method: &str) -> usize {
        self.listeners.lock().get(method).map_or(0, Vec::len)
    }
}
