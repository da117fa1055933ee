/*
    Outbox - bounded per-peer send queues

    Each connected peer gets a FIFO of envelopes drained by its own task, so a
    slow socket only ever delays that peer. Queues are bounded; when one is full
    the oldest pending envelope is dropped to make room (gossip peers will get
    the record from someone else, newer data matters more).

    Removing a peer aborts its task and discards its queue, nothing else.
*/

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::envelope::NetworkEnvelope;
use super::metrics;
use super::transport::{PeerId, PeerTransport};

type Queue = Arc<Mutex<VecDeque<NetworkEnvelope>>>;

struct PeerOutbox {
    queue: Queue,
    wake: Arc<Notify>,
    worker: AbortHandle,
}

pub struct OutboxSet {
    transport: Arc<dyn PeerTransport>,
    capacity: usize,
    outboxes: Mutex<HashMap<PeerId, PeerOutbox>>,
    sent: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl OutboxSet {
    pub fn new(transport: Arc<dyn PeerTransport>, capacity: usize) -> Self {
        Self {
            transport,
            capacity: capacity.max(1),
            outboxes: Mutex::new(HashMap::new()),
            sent: Arc::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a copy for every connected peer except `except`. Returns the number of copies.
    pub fn broadcast(&self, envelope: &NetworkEnvelope, except: Option<&PeerId>) -> usize {
        let mut copies = 0;
        for peer in self.transport.connected_peers() {
            if Some(&peer) == except {
                continue;
            }
            self.enqueue(&peer, envelope.clone());
            copies += 1;
        }
        copies
    }

    /// Queue an envelope for one peer. Returns false if an older envelope was dropped.
    pub fn enqueue(&self, peer: &PeerId, envelope: NetworkEnvelope) -> bool {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(PoisonError::into_inner);
        let outbox = outboxes
            .entry(peer.clone())
            .or_insert_with(|| self.spawn_worker(peer.clone()));

        let mut kept_all = true;
        {
            let mut queue = outbox.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                queue.pop_front();
                kept_all = false;
            }
            queue.push_back(envelope);
        }
        outbox.wake.notify_one();

        if !kept_all {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::outbox_overflow();
            debug!(peer = %peer, capacity = self.capacity, "Outbox full, dropped oldest pending send");
        }
        metrics::set_connected_peers(outboxes.len());
        kept_all
    }

    fn spawn_worker(&self, peer: PeerId) -> PeerOutbox {
        let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let wake = Arc::new(Notify::new());
        let transport = self.transport.clone();
        let sent = self.sent.clone();

        let worker_queue = queue.clone();
        let worker_wake = wake.clone();
        let handle = tokio::spawn(async move {
            loop {
                let next = worker_queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                match next {
                    Some(envelope) => match transport.send(&peer, &envelope).await {
                        Ok(()) => {
                            sent.fetch_add(1, Ordering::Relaxed);
                            trace!(peer = %peer, kind = envelope.message_type, "Envelope sent");
                        }
                        Err(e) => {
                            metrics::send_failed();
                            debug!(peer = %peer, error = %e, "Send failed");
                        }
                    },
                    None => worker_wake.notified().await,
                }
            }
        });

        PeerOutbox {
            queue,
            wake,
            worker: handle.abort_handle(),
        }
    }

    /// Abort a peer's worker and discard its queue
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = outboxes.remove(peer);
        metrics::set_connected_peers(outboxes.len());
        drop(outboxes);

        match removed {
            Some(outbox) => {
                outbox.worker.abort();
                let discarded = outbox.queue.lock().unwrap_or_else(PoisonError::into_inner).len();
                debug!(peer = %peer, discarded, "Outbox closed");
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let drained: Vec<PeerOutbox> = self
            .outboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, outbox)| outbox)
            .collect();
        for outbox in drained {
            outbox.worker.abort();
        }
        metrics::set_connected_peers(0);
    }

    /// Envelopes waiting for `peer`
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.outboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|o| o.queue.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    pub fn peer_count(&self) -> usize {
        self.outboxes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn sent_total(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for OutboxSet {
    fn drop(&mut self) {
        self.clear();
    }
}
