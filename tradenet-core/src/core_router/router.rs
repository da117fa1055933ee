/*
    BroadcastRouter - gossip of store mutations between peers

    Inbound pipeline for every envelope handed to `on_receive`:
      ready? -> header (version, type) -> seen cache -> decode -> apply -> relay

    - Envelopes arriving before the node finished restoring are dropped.
    - Header and decode failures are counted, charged to the sending peer's
      decode budget, and the peer is disconnected once the budget runs out.
    - A mutation accepted by the store or ledger is relayed verbatim to every
      connected peer except the one it came from. Snapshot responses are
      applied but never relayed.

    Outbound: local store mutations arrive as `OutboundMutation`s on a channel
    drained by one task. Publications and refreshes go through the delayed
    scheduler; removals are sent at once. The scheduler is attached to the
    store, which withdraws a pending publication while it still holds the
    identity lock of the removal or expiry. A publication still queued on the
    channel when its record disappears is skipped.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::envelope::{BroadcastMessage, EnvelopeError, NetworkEnvelope, SnapshotBatch};
use super::metrics;
use super::outbox::OutboxSet;
use super::peer_guard::{GuardVerdict, PeerGuard, PeerGuardConfig};
use super::scheduler::{BroadcastScheduler, DelayWindow};
use super::seen_cache::SeenCache;
use super::transport::{PeerId, PeerTransport, TransportError};
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::model::payload::PersistablePayload;
use crate::core_store::model::record::RemovalRequest;
use crate::core_store::store::{AppendOnlyLedger, MutableRecordStore, OutboundMutation};
use crate::metrics::{RejectionCounters, RejectionReason};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Delay window for local publications
    pub delay_window: DelayWindow,
    /// Pending sends kept per peer before the oldest is dropped
    pub max_in_flight_per_peer: usize,
    /// Envelope digests remembered for loop prevention
    pub seen_cache_capacity: usize,
    /// Records per snapshot response envelope
    pub snapshot_chunk: usize,
    pub peer_guard: PeerGuardConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            delay_window: DelayWindow::default(),
            max_in_flight_per_peer: 256,
            seen_cache_capacity: 65_536,
            snapshot_chunk: 1_000,
            peer_guard: PeerGuardConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotReady,
    Seen,
}

/// What happened to one inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Store or ledger changed; `relayed` copies queued to other peers
    Applied { relayed: usize },
    /// Valid but nothing new (duplicate, unknown identity)
    Unchanged,
    Rejected(RejectionReason),
    Dropped(DropReason),
    Snapshot { accepted: usize, rejected: usize },
    /// Envelope rejected and the peer ran out of decode budget
    Disconnected,
}

pub struct BroadcastRouter {
    config: RouterConfig,
    store: Arc<MutableRecordStore>,
    ledger: Arc<AppendOnlyLedger>,
    transport: Arc<dyn PeerTransport>,
    outboxes: Arc<OutboxSet>,
    scheduler: Arc<BroadcastScheduler>,
    seen: SeenCache,
    guard: PeerGuard,
    rejections: Arc<RejectionCounters>,
    ready: AtomicBool,
    outbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastRouter {
    pub fn new(
        config: RouterConfig,
        store: Arc<MutableRecordStore>,
        ledger: Arc<AppendOnlyLedger>,
        transport: Arc<dyn PeerTransport>,
        rejections: Arc<RejectionCounters>,
    ) -> Arc<Self> {
        let outboxes = Arc::new(OutboxSet::new(
            transport.clone(),
            config.max_in_flight_per_peer,
        ));
        let scheduler = Arc::new(BroadcastScheduler::new(outboxes.clone()));
        store.attach_pending(scheduler.clone());
        Arc::new(Self {
            scheduler,
            seen: SeenCache::new(config.seen_cache_capacity),
            guard: PeerGuard::new(config.peer_guard.clone()),
            config,
            store,
            ledger,
            transport,
            outboxes,
            rejections,
            ready: AtomicBool::new(false),
            outbound_task: Mutex::new(None),
        })
    }

    /// Start accepting inbound envelopes (after restore)
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        info!("Broadcast router accepting inbound traffic");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &BroadcastScheduler {
        &self.scheduler
    }

    pub fn outboxes(&self) -> &OutboxSet {
        &self.outboxes
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Drain local store mutations on a dedicated task
    pub fn spawn_outbound(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<OutboundMutation>) {
        let router = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(mutation) = rx.recv().await {
                let Some(router) = router.upgrade() else {
                    break;
                };
                if let Err(e) = router.handle_outbound(mutation).await {
                    warn!(error = %e, "Failed to broadcast local mutation");
                }
            }
            debug!("Outbound mutation channel closed");
        });

        let previous = self
            .outbound_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn handle_outbound(&self, mutation: OutboundMutation) -> RouterResult<()> {
        match mutation {
            OutboundMutation::Publish { identity, .. } | OutboundMutation::Refresh { identity, .. }
                if !self.store.contains(&identity) =>
            {
                trace!(identity = %identity, "Record gone before its broadcast was scheduled");
            }
            OutboundMutation::Publish { identity, record } => {
                let message = BroadcastMessage::AddMutable(record.as_ref().clone());
                self.schedule_message(identity, &message, self.config.delay_window, 0)
                    .await?;
            }
            OutboundMutation::Refresh {
                identity,
                request,
                record,
            } => {
                // Peers that never saw the add need the full record
                let message = if self.scheduler.is_pending(&identity) {
                    BroadcastMessage::AddMutable(record.as_ref().clone())
                } else {
                    BroadcastMessage::RefreshTtl(request)
                };
                self.schedule_message(identity, &message, self.config.delay_window, 0)
                    .await?;
            }
            OutboundMutation::Remove { request } => {
                self.broadcast_removal(request).await?;
            }
        }
        Ok(())
    }

    /// Schedule a local immutable payload for delayed broadcast
    pub async fn schedule_immutable(
        &self,
        identity: PayloadHash,
        payload: PersistablePayload,
        batch_index: usize,
        window: Option<DelayWindow>,
    ) -> RouterResult<Duration> {
        let window = window.unwrap_or(self.config.delay_window);
        self.schedule_message(
            identity,
            &BroadcastMessage::AddImmutable(payload),
            window,
            batch_index,
        )
        .await
    }

    async fn schedule_message(
        &self,
        identity: PayloadHash,
        message: &BroadcastMessage,
        window: DelayWindow,
        batch_index: usize,
    ) -> RouterResult<Duration> {
        let envelope = message.to_envelope()?;
        // Our own gossip echoed back by a peer must not be re-applied and relayed
        self.seen.insert(envelope.digest()).await;
        Ok(self
            .scheduler
            .schedule(identity, envelope, window, batch_index))
    }

    async fn broadcast_removal(&self, request: RemovalRequest) -> RouterResult<usize> {
        let identity = request.identity;
        if self.scheduler.cancel(&identity) {
            debug!(identity = %identity, "Pending broadcast cancelled by removal");
        }
        let envelope = BroadcastMessage::RemoveMutable(request).to_envelope()?;
        self.seen.insert(envelope.digest()).await;
        let copies = self.outboxes.broadcast(&envelope, None);
        trace!(identity = %identity, copies, "Removal broadcast");
        Ok(copies)
    }

    /// Cancel a pending local broadcast
    pub fn cancel_broadcast(&self, identity: &PayloadHash) -> bool {
        self.scheduler.cancel(identity)
    }

    /// Handle one envelope received from `peer`
    pub async fn on_receive(&self, peer: &PeerId, envelope: NetworkEnvelope) -> InboundOutcome {
        if !self.is_ready() {
            metrics::envelope_dropped("not_ready");
            return InboundOutcome::Dropped(DropReason::NotReady);
        }

        let message_type = match envelope.header() {
            Ok(message_type) => message_type,
            Err(e) => return self.on_decode_error(peer, e).await,
        };
        metrics::envelope_received(message_type.as_str());

        if !self.seen.insert(envelope.digest()).await {
            metrics::envelope_dropped("seen");
            trace!(peer = %peer, kind = message_type.as_str(), "Envelope already seen");
            return InboundOutcome::Dropped(DropReason::Seen);
        }

        let message = match BroadcastMessage::from_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => return self.on_decode_error(peer, e).await,
        };

        let applied = match message {
            BroadcastMessage::AddMutable(record) => self.store.add(record, false),
            BroadcastMessage::RemoveMutable(request) => self.store.remove(request, false),
            BroadcastMessage::RefreshTtl(request) => self.store.refresh(request, false),
            BroadcastMessage::AddImmutable(payload) => self.ledger.add(payload),
            BroadcastMessage::SnapshotResponse(batch) => {
                return self.apply_snapshot(peer, batch);
            }
        };

        match applied {
            Ok(true) => {
                let relayed = self.outboxes.broadcast(&envelope, Some(peer));
                metrics::envelopes_relayed(relayed);
                trace!(peer = %peer, kind = message_type.as_str(), relayed, "Envelope applied");
                InboundOutcome::Applied { relayed }
            }
            Ok(false) => InboundOutcome::Unchanged,
            Err(e) => {
                debug!(peer = %peer, kind = message_type.as_str(), error = %e, "Inbound mutation rejected");
                // Stores count their own rejections
                InboundOutcome::Rejected(
                    e.rejection_reason()
                        .unwrap_or(RejectionReason::InvalidRecord),
                )
            }
        }
    }

    fn apply_snapshot(&self, peer: &PeerId, batch: SnapshotBatch) -> InboundOutcome {
        let mut accepted = 0;
        let mut rejected = 0;
        for record in batch.protected {
            match self.store.add(record, false) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(_) => rejected += 1,
            }
        }
        for payload in batch.persistable {
            match self.ledger.add(payload) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(_) => rejected += 1,
            }
        }
        debug!(peer = %peer, accepted, rejected, "Snapshot response applied");
        InboundOutcome::Snapshot { accepted, rejected }
    }

    /// Count an undecodable envelope against `peer`, disconnecting it when over budget
    pub async fn on_decode_error(&self, peer: &PeerId, error: EnvelopeError) -> InboundOutcome {
        let reason = error.rejection_reason();
        self.rejections.record(reason);
        metrics::envelope_dropped(reason.as_str());
        debug!(peer = %peer, error = %error, "Undecodable envelope dropped");

        match self.guard.record_decode_error(peer).await {
            GuardVerdict::Tolerated { .. } => InboundOutcome::Rejected(reason),
            GuardVerdict::Disconnect => {
                debug!(peer = %peer, "Disconnecting peer");
                metrics::peer_disconnected("decode_budget");
                self.transport.disconnect(peer).await;
                self.on_peer_disconnected(peer).await;
                InboundOutcome::Disconnected
            }
        }
    }

    /// Send everything we hold to a newly connected peer. Returns the number of envelopes queued.
    pub async fn on_peer_connected(&self, peer: &PeerId) -> RouterResult<usize> {
        let protected = self.store.snapshot_records();
        let persistable = self.ledger.payloads();
        let chunk = self.config.snapshot_chunk.max(1);

        let mut envelopes = 0;
        for records in protected.chunks(chunk) {
            let batch = SnapshotBatch {
                protected: records.to_vec(),
                persistable: Vec::new(),
            };
            self.outboxes
                .enqueue(peer, BroadcastMessage::SnapshotResponse(batch).to_envelope()?);
            envelopes += 1;
        }
        for payloads in persistable.chunks(chunk) {
            let batch = SnapshotBatch {
                protected: Vec::new(),
                persistable: payloads.to_vec(),
            };
            self.outboxes
                .enqueue(peer, BroadcastMessage::SnapshotResponse(batch).to_envelope()?);
            envelopes += 1;
        }

        info!(
            peer = %peer,
            records = protected.len(),
            payloads = persistable.len(),
            envelopes,
            "Peer connected, initial data queued"
        );
        Ok(envelopes)
    }

    /// Tear down per-peer state. Other peers are unaffected.
    pub async fn on_peer_disconnected(&self, peer: &PeerId) {
        self.outboxes.remove_peer(peer);
        self.guard.remove_peer(peer).await;
        debug!(peer = %peer, "Peer state released");
    }

    /// Cancel pending broadcasts, stop the outbound task and close all outboxes
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let cancelled = self.scheduler.cancel_all();
        let task = self
            .outbound_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.outboxes.clear();
        info!(cancelled, "Broadcast router stopped");
    }
}
