/*
    ListenerHub - ordered fan-out of store events to subscribers

    Responsibilities:
    `listeners.rs` decouples the stores from whoever wants to observe them
    (statistics aggregation, UI adapters, tests). Stores publish events while
    holding their per-identity lock, which only enqueues; a dedicated task
    delivers them in acceptance order, outside any store lock.

    Guarantees:
    - events are delivered in the order they were published
    - a panicking subscriber is logged and skipped, the others still run
    - flush() resolves once everything published before it was delivered

    Inputs:
    - subscribe(listener) / unsubscribe(id)
    - publish(event) from the stores

    Outputs:
    - on_event(&StoreEvent) calls on the dispatch task
*/

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::model::hash::PayloadHash;
use super::model::payload::PersistablePayload;
use super::model::record::ProtectedRecord;

/// Why a record left the mutable store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Superseded by a higher sequence number
    Replaced,
    /// Owner-signed removal
    Removed,
    /// Expiry sweep
    Expired,
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Added {
        identity: PayloadHash,
        record: Arc<ProtectedRecord>,
    },
    Removed {
        identity: PayloadHash,
        record: Arc<ProtectedRecord>,
        cause: RemovalCause,
    },
    Refreshed {
        identity: PayloadHash,
        record: Arc<ProtectedRecord>,
    },
    Appended {
        identity: PayloadHash,
        payload: Arc<PersistablePayload>,
    },
}

impl StoreEvent {
    pub fn identity(&self) -> &PayloadHash {
        match self {
            StoreEvent::Added { identity, .. }
            | StoreEvent::Removed { identity, .. }
            | StoreEvent::Refreshed { identity, .. }
            | StoreEvent::Appended { identity, .. } => identity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreEvent::Added { .. } => "added",
            StoreEvent::Removed { .. } => "removed",
            StoreEvent::Refreshed { .. } => "refreshed",
            StoreEvent::Appended { .. } => "appended",
        }
    }
}

/// Receives store events on the hub's dispatch task
pub trait StoreListener: Send + Sync {
    fn on_event(&self, event: &StoreEvent);
}

impl<F> StoreListener for F
where
    F: Fn(&StoreEvent) + Send + Sync,
{
    fn on_event(&self, event: &StoreEvent) {
        self(event)
    }
}

/// Handle returned by subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum HubCommand {
    Publish(StoreEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

type Subscribers = Arc<RwLock<Vec<(SubscriptionId, Arc<dyn StoreListener>)>>>;

pub struct ListenerHub {
    subscribers: Subscribers,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<HubCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHub {
    /// Create a hub; events queue up until `start` is called
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            tx,
            rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the dispatch task. Calling it twice is a no-op.
    pub fn start(&self) {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(rx) = rx else {
            return;
        };

        let subscribers = self.subscribers.clone();
        let handle = tokio::spawn(dispatch_loop(rx, subscribers));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn subscribe(&self, listener: Arc<dyn StoreListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        debug!(subscription = id.0, "Listener subscribed");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Enqueue an event. Never blocks.
    pub fn publish(&self, event: StoreEvent) {
        if self.tx.send(HubCommand::Publish(event)).is_err() {
            debug!("Listener hub stopped, event discarded");
        }
    }

    /// Take the events still queued because `start` was never called.
    ///
    /// Lets synchronous callers inspect what a store published.
    pub fn drain_queued(&self) -> Vec<StoreEvent> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rx) = rx.as_mut() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let HubCommand::Publish(event) = command {
                events.push(event);
            }
        }
        events
    }

    /// Wait until every event published before this call has been delivered
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(HubCommand::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Deliver what is queued, then stop the dispatch task
    pub async fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown);
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<HubCommand>, subscribers: Subscribers) {
    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Publish(event) => {
                let targets: Vec<(SubscriptionId, Arc<dyn StoreListener>)> =
                    subscribers.read().unwrap_or_else(PoisonError::into_inner).clone();

                for (id, listener) in targets {
                    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
                    if outcome.is_err() {
                        warn!(
                            subscription = id.0,
                            event = event.name(),
                            identity = %event.identity(),
                            "Listener panicked, skipping"
                        );
                        crate::metrics::listener_panicked();
                    }
                }
            }
            HubCommand::Flush(done) => {
                let _ = done.send(());
            }
            HubCommand::Shutdown => break,
        }
    }
    debug!("Listener hub dispatch loop stopped");
}
