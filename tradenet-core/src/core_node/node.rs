use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::{NodeError, NodeResult};
use crate::config::Config;
use crate::core_router::{BroadcastRouter, PeerTransport};
use crate::core_stats::{TradeStatisticsAggregator, TradeStatisticsPublisher};
use crate::core_store::clock::{Clock, SystemClock};
use crate::core_store::crypto::{Blake3Hasher, ContentHasher, Ed25519Verifier, RecordSigner, SignatureVerifier};
use crate::core_store::listeners::{ListenerHub, StoreListener, SubscriptionId};
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::model::payload::{PersistablePayload, ProtectedPayload};
use crate::core_store::model::record::{record_identity, ProtectedRecord, RefreshRequest, RemovalRequest};
use crate::core_store::store::{
    AppendOnlyLedger, AppendOutcome, ClaimRegistry, MutableRecordStore, OutboundMutation,
    PersistenceBridge, RestoreReport, SequenceTracker, StoreContext,
};
use crate::metrics::RejectionCounters;
use crate::shutdown::ShutdownCoordinator;

/// The capabilities a node is built from
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn PeerTransport>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub hasher: Arc<dyn ContentHasher>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Ed25519 signatures, BLAKE3 identities, wall clock
    pub fn standard(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            verifier: Arc::new(Ed25519Verifier),
            hasher: Arc::new(Blake3Hasher),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    Stopped,
}

pub struct DataNode {
    config: Config,
    clock: Arc<dyn Clock>,
    hasher: Arc<dyn ContentHasher>,
    hub: Arc<ListenerHub>,
    tracker: Arc<SequenceTracker>,
    store: Arc<MutableRecordStore>,
    ledger: Arc<AppendOnlyLedger>,
    router: Arc<BroadcastRouter>,
    persistence: Arc<PersistenceBridge>,
    aggregator: Arc<TradeStatisticsAggregator>,
    rejections: Arc<RejectionCounters>,
    coordinator: ShutdownCoordinator,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundMutation>>>,
    state: Mutex<NodeState>,
}

impl DataNode {
    /// Build every component. Nothing runs until `start`.
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            transport,
            verifier,
            hasher,
            clock,
        } = collaborators;

        let hub = Arc::new(ListenerHub::new());
        let rejections = Arc::new(RejectionCounters::new());
        let tracker = Arc::new(SequenceTracker::new());
        let ctx = StoreContext {
            verifier,
            hasher: hasher.clone(),
            clock: clock.clone(),
            hub: hub.clone(),
            rejections: rejections.clone(),
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let store = Arc::new(
            MutableRecordStore::new(ctx, tracker.clone(), config.store.max_ttl)
                .with_outbound(outbound_tx),
        );
        let ledger = Arc::new(AppendOnlyLedger::new(
            ClaimRegistry::default(),
            hasher.clone(),
            hub.clone(),
            rejections.clone(),
        ));
        let router = BroadcastRouter::new(
            config.broadcast.router_config(),
            store.clone(),
            ledger.clone(),
            transport,
            rejections.clone(),
        );
        let persistence = Arc::new(PersistenceBridge::new(
            config.persistence.data_dir.clone(),
            store.clone(),
            ledger.clone(),
            clock.clone(),
        ));

        let aggregator = Arc::new(TradeStatisticsAggregator::new());
        hub.subscribe(aggregator.clone());

        let coordinator = ShutdownCoordinator::new(config.node.shutdown_timeout);

        Self {
            config,
            clock,
            hasher,
            hub,
            tracker,
            store,
            ledger,
            router,
            persistence,
            aggregator,
            rejections,
            coordinator,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state: Mutex::new(NodeState::Created),
        }
    }

    /// Restore persisted state, then open the node for traffic.
    ///
    /// A corrupt snapshot aborts startup; nothing is listening yet at that point.
    pub async fn start(&self) -> NodeResult<RestoreReport> {
        {
            let state = self.lock_state();
            if *state != NodeState::Created {
                return Err(NodeError::AlreadyStarted);
            }
        }

        let report = self.restore()?;
        self.hub.start();

        let outbound = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = outbound {
            self.router.spawn_outbound(rx);
        }
        self.router.mark_ready();

        self.spawn_expiry_sweeper();
        self.spawn_snapshot_loop();
        self.spawn_sequence_writer();

        *self.lock_state() = NodeState::Running;
        info!(
            node = %self.config.node.node_id,
            records = report.records,
            appended = report.appended,
            sequences = report.sequences,
            trade_statistics = self.aggregator.len(),
            "Data node started"
        );

        if self.config.statistics.republish_on_start {
            TradeStatisticsPublisher::new(
                self.ledger.clone(),
                self.router.clone(),
                self.clock.clone(),
                self.config.statistics.clone(),
            )
            .republish_recent()
            .await?;
        }

        Ok(report)
    }

    /// Load persisted state without starting anything.
    ///
    /// `start` does this itself; calling it directly serves offline inspection.
    pub fn restore(&self) -> NodeResult<RestoreReport> {
        if self.state() != NodeState::Created {
            return Err(NodeError::AlreadyStarted);
        }
        let report = self.persistence.restore()?;
        self.aggregator.seed_from_ledger(&self.ledger);
        Ok(report)
    }

    /// Drop sequence entries whose record expired longer ago than the retention period
    pub fn purge_expired_sequences(&self) -> usize {
        self.tracker
            .purge_expired(self.clock.now_millis(), self.config.store.sequence_retention)
    }

    /// Publish (or replace) a record owned by `signer`. Returns its identity.
    pub fn add_local(
        &self,
        payload: ProtectedPayload,
        signer: &dyn RecordSigner,
    ) -> NodeResult<PayloadHash> {
        self.ensure_running()?;
        let identity = record_identity(&payload, &signer.public_key(), self.hasher.as_ref())?;
        let sequence_number = self.tracker.next_sequence(&identity);
        let expiration = self.expiration_for(payload.kind().default_ttl());

        let record = ProtectedRecord::sign(
            payload,
            sequence_number,
            expiration,
            signer,
            self.hasher.as_ref(),
        )?;
        self.store.add(record, true)?;
        debug!(identity = %identity, sequence_number, "Local record added");
        Ok(identity)
    }

    /// Extend the TTL of a stored record by its default lifetime
    pub fn refresh_local(
        &self,
        identity: &PayloadHash,
        signer: &dyn RecordSigner,
    ) -> NodeResult<bool> {
        self.ensure_running()?;
        let record = self
            .store
            .get(identity)
            .ok_or(NodeError::UnknownRecord(*identity))?;
        let sequence_number = self.tracker.next_sequence(identity);
        let expiration = self.expiration_for(record.kind().default_ttl());

        let request = RefreshRequest::sign(*identity, sequence_number, expiration, signer);
        Ok(self.store.refresh(request, true)?)
    }

    pub fn remove_local(
        &self,
        identity: &PayloadHash,
        signer: &dyn RecordSigner,
    ) -> NodeResult<bool> {
        self.ensure_running()?;
        if !self.store.contains(identity) {
            return Err(NodeError::UnknownRecord(*identity));
        }
        let sequence_number = self.tracker.next_sequence(identity);
        let request = RemovalRequest::sign(*identity, sequence_number, signer);
        Ok(self.store.remove(request, true)?)
    }

    /// Append to the ledger and, if new, schedule its broadcast
    pub async fn add_immutable_local(
        &self,
        payload: PersistablePayload,
    ) -> NodeResult<AppendOutcome> {
        self.ensure_running()?;
        let outcome = self.ledger.append_local(payload)?;
        if !outcome.is_new() {
            return Ok(outcome);
        }

        // The ledger may have migrated the payload; broadcast what was stored
        let identity = outcome.identity();
        if let Some(stored) = self.ledger.get(&identity) {
            self.router
                .schedule_immutable(identity, stored.as_ref().clone(), 0, None)
                .await?;
        }
        Ok(outcome)
    }

    pub fn subscribe(&self, listener: Arc<dyn StoreListener>) -> SubscriptionId {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Write all persisted blobs now
    pub fn snapshot(&self) -> NodeResult<()> {
        Ok(self.persistence.snapshot()?)
    }

    /// Cancel pending broadcasts, stop background work, drain listeners and
    /// write a final snapshot
    pub async fn shutdown(&self) -> NodeResult<()> {
        {
            let mut state = self.lock_state();
            if *state != NodeState::Running {
                return Err(NodeError::NotRunning);
            }
            *state = NodeState::Stopped;
        }

        info!(node = %self.config.node.node_id, "Data node shutting down");
        self.router.shutdown().await;

        let aborted = self.coordinator.shutdown().await;
        if aborted > 0 {
            warn!(aborted, "Background tasks did not stop in time");
        }
        self.hub.shutdown().await;

        let persistence = self.persistence.clone();
        match tokio::task::spawn_blocking(move || persistence.snapshot()).await {
            Ok(Ok(())) => info!("Final snapshot written"),
            // The bridge already logged the failing blob
            Ok(Err(err)) => debug!(error = %err, "Final snapshot incomplete"),
            Err(err) => warn!(error = %err, "Final snapshot task failed"),
        }
        Ok(())
    }

    pub fn state(&self) -> NodeState {
        *self.lock_state()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MutableRecordStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<AppendOnlyLedger> {
        &self.ledger
    }

    pub fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.tracker
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn aggregator(&self) -> &Arc<TradeStatisticsAggregator> {
        &self.aggregator
    }

    pub fn rejections(&self) -> &Arc<RejectionCounters> {
        &self.rejections
    }

    pub fn hub(&self) -> &Arc<ListenerHub> {
        &self.hub
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> NodeResult<()> {
        match self.state() {
            NodeState::Running => Ok(()),
            _ => Err(NodeError::NotRunning),
        }
    }

    fn expiration_for(&self, ttl: Duration) -> u64 {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    fn spawn_expiry_sweeper(&self) {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let clock = self.clock.clone();
        let period = self.config.store.expiry_sweep_interval;
        let retention = self.config.store.sequence_retention;

        self.coordinator.spawn("expiry_sweeper", move |mut shutdown| async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = clock.now_millis();
                        let expired = store.expiry_sweep(now);
                        let purged = tracker.purge_expired(now, retention);
                        if expired > 0 || purged > 0 {
                            debug!(expired, purged, "Housekeeping pass finished");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_snapshot_loop(&self) {
        let persistence = self.persistence.clone();
        let period = self.config.persistence.snapshot_interval;

        self.coordinator.spawn("snapshot_writer", move |mut shutdown| async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let persistence = persistence.clone();
                        // Failures were logged by the bridge; retried next tick
                        if let Err(err) = tokio::task::spawn_blocking(move || persistence.snapshot()).await {
                            warn!(error = %err, "Snapshot task failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_sequence_writer(&self) {
        let persistence = self.persistence.clone();
        let changed = self.tracker.change_notifier();
        let delay = self.config.persistence.sequence_write_delay;

        self.coordinator.spawn("sequence_writer", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = changed.notified() => {}
                    _ = shutdown.recv() => break,
                }
                // Coalesce bursts of commits into one write
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }
                let persistence = persistence.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || persistence.snapshot_sequences()).await {
                    warn!(error = %err, "Sequence map write task failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::listeners::StoreEvent;
    use crate::core_store::store::snapshot::PROTECTED_STORE_FILE;
    use crate::core_store::store::StoreError;
    use crate::core_store::ManualClock;
    use crate::test_utils::async_helpers::eventually;
    use crate::test_utils::fixtures::{dispute_payload, offer_payload, seeded_signer, trade_statistics_at, NOW};
    use crate::test_utils::network::RecordingTransport;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.node.node_id = "test-node".to_string();
        config.persistence.data_dir = dir.to_path_buf();
        config.statistics.republish_on_start = false;
        config
    }

    fn test_node(dir: &Path, transport: Arc<RecordingTransport>) -> (DataNode, ManualClock) {
        let clock = ManualClock::new(NOW);
        let mut collaborators = Collaborators::standard(transport);
        collaborators.clock = Arc::new(clock.clone());
        (DataNode::new(test_config(dir), collaborators), clock)
    }

    #[derive(Default)]
    struct CountingListener {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl StoreListener for CountingListener {
        fn on_event(&self, event: &StoreEvent) {
            match event {
                StoreEvent::Added { .. } => {
                    self.added.fetch_add(1, Ordering::SeqCst);
                }
                StoreEvent::Removed { .. } => {
                    self.removed.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_operations_require_running_node() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));

        let signer = seeded_signer(1);
        let result = node.add_local(offer_payload("offer-1"), &signer);
        assert!(matches!(result, Err(NodeError::NotRunning)));
        assert!(matches!(node.shutdown().await, Err(NodeError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));

        let report = node.start().await.unwrap();
        assert!(report.is_fresh());
        assert!(node.router().is_ready());
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

        node.shutdown().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_local_lifecycle_notifies_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
        node.start().await.unwrap();

        let listener = Arc::new(CountingListener::default());
        let subscription = node.subscribe(listener.clone());

        let signer = seeded_signer(1);
        let identity = node.add_local(offer_payload("offer-1"), &signer).unwrap();
        let stored = node.store().get(&identity).unwrap();
        assert_eq!(stored.sequence_number, 1);
        assert_eq!(stored.expiration_timestamp, NOW + 9 * 60_000);

        assert!(node.refresh_local(&identity, &signer).unwrap());
        assert_eq!(node.store().get(&identity).unwrap().sequence_number, 2);

        assert!(node.remove_local(&identity, &signer).unwrap());
        assert!(!node.store().contains(&identity));

        assert!(eventually(Duration::from_secs(1), || listener.removed.load(Ordering::SeqCst) == 1).await);
        assert_eq!(listener.added.load(Ordering::SeqCst), 1);
        assert!(node.unsubscribe(subscription));

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_identity_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
        node.start().await.unwrap();

        let signer = seeded_signer(1);
        let identity =
            record_identity(&dispute_payload("trade-1"), &signer.public_key(), &Blake3Hasher).unwrap();
        assert!(matches!(
            node.remove_local(&identity, &signer),
            Err(NodeError::UnknownRecord(id)) if id == identity
        ));
        assert!(matches!(
            node.refresh_local(&identity, &signer),
            Err(NodeError::UnknownRecord(_))
        ));

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_owner_cannot_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
        node.start().await.unwrap();

        let owner = seeded_signer(1);
        let intruder = seeded_signer(2);
        let identity = node.add_local(offer_payload("offer-1"), &owner).unwrap();

        let result = node.remove_local(&identity, &intruder);
        assert!(matches!(result, Err(NodeError::Store(StoreError::NotOwner(_)))));
        assert!(node.store().contains(&identity));

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_immutable_append_broadcasts_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::with_peers(&["peer-a"]));
        let mut config = test_config(dir.path());
        config.broadcast.min_delay = Duration::from_millis(1);
        config.broadcast.max_delay = Duration::from_millis(5);
        let node = DataNode::new(config, Collaborators::standard(transport.clone()));
        node.start().await.unwrap();

        let stats = trade_statistics_at("offer-1", "EUR", 30_000, NOW);
        let first = node
            .add_immutable_local(PersistablePayload::TradeStatistics(stats.clone()))
            .await
            .unwrap();
        assert!(first.is_new());
        let second = node
            .add_immutable_local(PersistablePayload::TradeStatistics(stats))
            .await
            .unwrap();
        assert!(!second.is_new());

        transport.wait_for_sends(1, Duration::from_secs(2)).await;
        assert!(eventually(Duration::from_secs(1), || node.aggregator().get("offer-1").is_some()).await);
        assert_eq!(transport.sent().len(), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let signer = seeded_signer(1);

        let identity = {
            let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
            node.start().await.unwrap();
            let identity = node.add_local(offer_payload("offer-1"), &signer).unwrap();
            node.add_immutable_local(PersistablePayload::TradeStatistics(trade_statistics_at(
                "offer-2", "USD", 31_000, NOW,
            )))
            .await
            .unwrap();
            node.shutdown().await.unwrap();
            identity
        };

        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
        let report = node.start().await.unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.appended, 1);
        assert!(node.store().contains(&identity));
        assert_eq!(node.aggregator().len(), 1);

        // Sequence numbers continue where the previous run stopped
        assert!(node.refresh_local(&identity, &signer).unwrap());
        assert_eq!(node.store().get(&identity).unwrap().sequence_number, 2);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_restore_and_sequence_purge() {
        let dir = tempfile::tempdir().unwrap();
        let signer = seeded_signer(1);
        {
            let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
            node.start().await.unwrap();
            let identity = node.add_local(offer_payload("offer-1"), &signer).unwrap();
            node.remove_local(&identity, &signer).unwrap();
            node.shutdown().await.unwrap();
        }

        let (node, clock) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
        let report = node.restore().unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(report.sequences, 1);
        assert_eq!(node.purge_expired_sequences(), 0);

        clock.advance(Duration::from_secs(11 * 24 * 3600));
        assert_eq!(node.purge_expired_sequences(), 1);
        node.snapshot().unwrap();
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROTECTED_STORE_FILE), b"garbage").unwrap();

        let (node, _) = test_node(dir.path(), Arc::new(RecordingTransport::with_peers(&[])));
        assert!(matches!(node.start().await, Err(NodeError::Store(_))));
        assert!(!node.router().is_ready());
        assert_eq!(node.state(), NodeState::Created);
    }
}
