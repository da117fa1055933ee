/*
    BroadcastScheduler - delayed, cancellable outbound broadcasts

    Local publications are not sent immediately. Each one waits a random delay
    drawn from a window that grows with its batch position, so a node
    republishing many records spreads them out instead of flooding its peers:

        position i  ->  [min_delay * (i + 1), max_delay + min_delay * i]

    Per identity: Pending -> Scheduled -> Sent. Scheduling an identity that
    already has a timer replaces it; cancelling aborts it. The timer task only
    sends if its ticket still matches the entry, so a replaced timer that was
    already waking up cannot send stale data.
*/

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

use super::envelope::NetworkEnvelope;
use super::metrics;
use super::outbox::OutboxSet;
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::store::PendingBroadcasts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    /// Registered, timer not yet armed
    Pending,
    /// Timer armed
    Scheduled,
    /// Handed to the peer outboxes
    Sent,
}

/// Random delay bounds for one batch of broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl DelayWindow {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
        }
    }

    /// No delay at all (removals, tests)
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Inclusive bounds for batch position `batch_index`
    pub fn for_position(&self, batch_index: usize) -> (Duration, Duration) {
        let index = u32::try_from(batch_index).unwrap_or(u32::MAX);
        let low = self.min_delay.saturating_mul(index.saturating_add(1));
        let high = self
            .max_delay
            .saturating_add(self.min_delay.saturating_mul(index));
        (low, high.max(low))
    }

    pub fn sample(&self, batch_index: usize) -> Duration {
        let (low, high) = self.for_position(batch_index);
        let low_ms = low.as_millis() as u64;
        let high_ms = high.as_millis() as u64;
        if low_ms >= high_ms {
            return low;
        }
        Duration::from_millis(rand::rng().random_range(low_ms..=high_ms))
    }
}

impl Default for DelayWindow {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(2))
    }
}

struct Entry {
    ticket: u64,
    state: BroadcastState,
    timer: Option<AbortHandle>,
}

pub struct BroadcastScheduler {
    entries: Arc<Mutex<HashMap<PayloadHash, Entry>>>,
    next_ticket: AtomicU64,
    outboxes: Arc<OutboxSet>,
}

impl BroadcastScheduler {
    pub fn new(outboxes: Arc<OutboxSet>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
            outboxes,
        }
    }

    /// Arm a timer that broadcasts `envelope` to every connected peer.
    ///
    /// Replaces any pending timer for the same identity. Returns the drawn delay.
    pub fn schedule(
        &self,
        identity: PayloadHash,
        envelope: NetworkEnvelope,
        window: DelayWindow,
        batch_index: usize,
    ) -> Duration {
        let delay = window.sample(batch_index);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, e| e.state != BroadcastState::Sent);
            let previous = entries.insert(
                identity,
                Entry {
                    ticket,
                    state: BroadcastState::Pending,
                    timer: None,
                },
            );
            if let Some(timer) = previous.and_then(|e| e.timer) {
                timer.abort();
                trace!(identity = %identity, "Replaced pending broadcast");
            }
            metrics::set_pending_broadcasts(entries.len());
        }

        let entries = self.entries.clone();
        let outboxes = self.outboxes.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
                match entries.get_mut(&identity) {
                    Some(entry) if entry.ticket == ticket => {
                        entry.state = BroadcastState::Sent;
                        entry.timer = None;
                    }
                    _ => return,
                }
            }
            let copies = outboxes.broadcast(&envelope, None);
            metrics::broadcast_stage("sent");
            trace!(identity = %identity, copies, "Broadcast sent");
        });

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&identity) {
            if entry.ticket == ticket && entry.state == BroadcastState::Pending {
                entry.state = BroadcastState::Scheduled;
                entry.timer = Some(handle.abort_handle());
            }
        }
        metrics::broadcast_stage("scheduled");
        trace!(identity = %identity, delay_ms = delay.as_millis() as u64, batch_index, "Broadcast scheduled");
        delay
    }

    /// Cancel a broadcast that has not been sent yet
    pub fn cancel(&self, identity: &PayloadHash) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = match entries.remove(identity) {
            Some(entry) if entry.state != BroadcastState::Sent => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                metrics::broadcast_stage("cancelled");
                true
            }
            _ => false,
        };
        metrics::set_pending_broadcasts(entries.len());
        cancelled
    }

    pub fn is_pending(&self, identity: &PayloadHash) -> bool {
        matches!(
            self.state(identity),
            Some(BroadcastState::Pending | BroadcastState::Scheduled)
        )
    }

    pub fn state(&self, identity: &PayloadHash) -> Option<BroadcastState> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .map(|e| e.state)
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.state != BroadcastState::Sent)
            .count()
    }

    /// Abort every unsent broadcast (shutdown)
    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cancelled = 0;
        for (_, entry) in entries.drain() {
            if entry.state == BroadcastState::Sent {
                continue;
            }
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            cancelled += 1;
        }
        metrics::set_pending_broadcasts(0);
        cancelled
    }
}

impl PendingBroadcasts for BroadcastScheduler {
    fn cancel_pending(&self, identity: &PayloadHash) -> bool {
        self.cancel(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::network::RecordingTransport;

    fn envelope(n: u8) -> NetworkEnvelope {
        NetworkEnvelope {
            protocol_version: 1,
            message_type: 1,
            payload: vec![n],
        }
    }

    fn scheduler() -> (Arc<RecordingTransport>, BroadcastScheduler) {
        let transport = Arc::new(RecordingTransport::with_peers(&["a", "b"]));
        let outboxes = Arc::new(OutboxSet::new(transport.clone(), 16));
        (transport, BroadcastScheduler::new(outboxes))
    }

    #[test]
    fn test_window_grows_with_position() {
        let window = DelayWindow::new(Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(
            window.for_position(0),
            (Duration::from_secs(1), Duration::from_secs(3))
        );
        assert_eq!(
            window.for_position(2),
            (Duration::from_secs(3), Duration::from_secs(5))
        );
    }

    #[test]
    fn test_sample_within_bounds() {
        let window = DelayWindow::new(Duration::from_millis(100), Duration::from_millis(400));
        for i in 0..50 {
            let (low, high) = window.for_position(i % 5);
            let delay = window.sample(i % 5);
            assert!(delay >= low && delay <= high, "{delay:?} outside {low:?}..{high:?}");
        }
    }

    #[test]
    fn test_degenerate_window() {
        let window = DelayWindow::new(Duration::from_secs(5), Duration::from_secs(1));
        let (low, high) = window.for_position(0);
        assert_eq!(low, high);
        assert_eq!(window.sample(0), Duration::from_secs(5));
        assert_eq!(DelayWindow::immediate().sample(10), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_sent_after_delay() {
        let (transport, scheduler) = scheduler();
        let id = PayloadHash::random();
        let window = DelayWindow::new(Duration::from_secs(1), Duration::from_secs(1));

        scheduler.schedule(id, envelope(1), window, 0);
        assert_eq!(scheduler.state(&id), Some(BroadcastState::Scheduled));
        assert!(scheduler.is_pending(&id));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(scheduler.state(&id), Some(BroadcastState::Sent));
        transport.wait_for_sends(2, Duration::from_secs(1)).await;
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let (transport, scheduler) = scheduler();
        let id = PayloadHash::random();

        scheduler.schedule(id, envelope(1), DelayWindow::default(), 0);
        assert!(scheduler.cancel(&id));
        assert!(!scheduler.cancel(&id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(transport.sent().is_empty());
        assert_eq!(scheduler.state(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let (transport, scheduler) = scheduler();
        let id = PayloadHash::random();
        let window = DelayWindow::new(Duration::from_secs(1), Duration::from_secs(1));

        scheduler.schedule(id, envelope(1), window, 0);
        scheduler.schedule(id, envelope(2), window, 0);
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        transport.wait_for_sends(2, Duration::from_secs(1)).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, e)| e.payload == vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (transport, scheduler) = scheduler();
        for n in 0..3 {
            scheduler.schedule(PayloadHash::random(), envelope(n), DelayWindow::default(), n as usize);
        }
        assert_eq!(scheduler.cancel_all(), 3);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(transport.sent().is_empty());
    }
}
