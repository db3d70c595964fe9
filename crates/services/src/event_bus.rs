//! Listener registry for send-queue events.
//!
//! Listeners run on the queue's task, one after another. A panicking listener
//! is logged and skipped; the remaining listeners still see the event.

use parking_lot::Mutex;
use shared::events::{QueueEvent, QueueEventKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    /// `None` listens to every event
    kind: Option<QueueEventKind>,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    listeners: Vec<Registration>,
    subscribers: Vec<mpsc::UnboundedSender<QueueEvent>>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: QueueEventKind, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Call `listener` for every event.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, kind: Option<QueueEventKind>, listener: Listener) -> ListenerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push(Registration { id, kind, listener });
        id
    }

    /// Returns whether a listener was removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|r| r.id != id);
        inner.listeners.len() != before
    }

    /// Receive every event on a channel. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn remove_all_listeners(&self) {
        let mut inner = self.inner.lock();
        inner.listeners.clear();
        inner.subscribers.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Deliver `event` to matching listeners and all subscribers.
    /// Returns the number of listeners that panicked.
    pub fn emit(&self, event: &QueueEvent) -> usize {
        let kind = event.kind();
        // Snapshot so listeners may (un)register without deadlocking
        let listeners: Vec<Listener> = {
            let mut inner = self.inner.lock();
            inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            inner
                .listeners
                .iter()
                .filter(|r| r.kind.map_or(true, |k| k == kind))
                .map(|r| Arc::clone(&r.listener))
                .collect()
        };

        let mut panicked = 0;
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(event))).is_err() {
                panicked += 1;
                warn!("listener for {} panicked", event.name());
            }
        }
        panicked
    }
}
