//! Record fixtures and a ready-wired store harness
//!
//! `StoreHarness` builds the store stack the way a node does (one hub, one
//! tracker, shared rejection counters) but with a `ManualClock` and without
//! starting the hub, so tests can inspect queued events synchronously.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core_store::clock::{Clock, ManualClock};
use crate::core_store::crypto::{Blake3Hasher, ContentHasher, Ed25519Signer, Ed25519Verifier, RecordSigner};
use crate::core_store::listeners::{ListenerHub, StoreEvent};
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::model::payload::{
    Direction, DisputeEntry, LegacyAmount, LegacyTradeStatistics, OfferPayload, PersistablePayload,
    ProtectedPayload, TradeStatistics,
};
use crate::core_store::model::record::ProtectedRecord;
use crate::core_store::store::{
    AppendOnlyLedger, ClaimRegistry, MutableRecordStore, OutboundMutation, SequenceTracker,
    StoreContext,
};
use crate::metrics::RejectionCounters;

/// A fixed "current time" for fixtures (Unix millis)
pub const NOW: u64 = 1_700_000_000_000;

/// Expiration one minute after `NOW`
pub const EXP: u64 = NOW + 60_000;

pub fn offer_payload(offer_id: &str) -> ProtectedPayload {
    ProtectedPayload::Offer(OfferPayload {
        offer_id: offer_id.to_string(),
        direction: Direction::Sell,
        base_currency: "BTC".to_string(),
        counter_currency: "EUR".to_string(),
        payment_method_id: "SEPA".to_string(),
        price: 3_500_000,
        amount: 10_000_000,
        min_amount: 1_000_000,
        use_market_based_price: false,
        market_price_margin_bps: 0,
        creation_date: NOW,
        owner_node_address: "node-a.onion:9999".to_string(),
    })
}

pub fn dispute_payload(trade_id: &str) -> ProtectedPayload {
    ProtectedPayload::DisputeEntry(DisputeEntry {
        trade_id: trade_id.to_string(),
        trader_id: 7,
        opener_is_buyer: true,
        opening_date: NOW,
        summary: "payment not received".to_string(),
        attachments: vec![],
    })
}

pub fn trade_statistics(offer_id: &str, trade_price: u64) -> TradeStatistics {
    trade_statistics_at(offer_id, "EUR", trade_price, NOW)
}

pub fn trade_statistics_at(
    offer_id: &str,
    counter_currency: &str,
    trade_price: u64,
    trade_date: u64,
) -> TradeStatistics {
    TradeStatistics {
        direction: Direction::Buy,
        base_currency: "BTC".to_string(),
        counter_currency: counter_currency.to_string(),
        payment_method_id: "SEPA".to_string(),
        offer_date: trade_date.saturating_sub(3_600_000),
        use_market_based_price: true,
        market_price_margin_bps: 150,
        offer_amount: 5_000_000,
        offer_min_amount: 1_000_000,
        offer_id: offer_id.to_string(),
        trade_price,
        trade_amount: 2_500_000,
        trade_date,
        deposit_tx_id: format!("tx-{offer_id}"),
        extra_data: BTreeMap::new(),
    }
}

pub fn legacy_trade_statistics(offer_id: &str, trade_price: u64) -> LegacyTradeStatistics {
    LegacyTradeStatistics {
        direction: Direction::Buy,
        base_currency: "BTC".to_string(),
        counter_currency: "EUR".to_string(),
        offer_payment_method: "SEPA".to_string(),
        offer_date: NOW - 3_600_000,
        offer_use_market_based_price: false,
        offer_market_price_margin: 0,
        offer_amount: LegacyAmount { value: 5_000_000 },
        offer_min_amount: LegacyAmount { value: 1_000_000 },
        offer_id: offer_id.to_string(),
        trade_price: LegacyAmount { value: trade_price },
        trade_amount: LegacyAmount { value: 2_500_000 },
        trade_date: NOW,
        deposit_tx_id: format!("legacy-tx-{offer_id}"),
        owner_public_key: vec![0x02; 33],
        extra_data: None,
    }
}

/// Ledger event with an opaque payload
pub fn appended_event(identity: PayloadHash) -> StoreEvent {
    StoreEvent::Appended {
        identity,
        payload: Arc::new(PersistablePayload::Unknown {
            type_tag: "fixture".to_string(),
            bytes: identity.to_vec(),
        }),
    }
}

/// Deterministic signer for tests needing stable keys
pub fn seeded_signer(seed: u8) -> Ed25519Signer {
    Ed25519Signer::from_seed([seed; 32])
}

pub struct StoreHarness {
    pub store: Arc<MutableRecordStore>,
    pub ledger: Arc<AppendOnlyLedger>,
    pub tracker: Arc<SequenceTracker>,
    pub hub: Arc<ListenerHub>,
    pub clock: ManualClock,
    pub rejections: Arc<RejectionCounters>,
    pub signer: Ed25519Signer,
    pub hasher: Arc<dyn ContentHasher>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<OutboundMutation>>>,
}

impl StoreHarness {
    pub fn new(now: u64) -> Self {
        let clock = ManualClock::new(now);
        let hub = Arc::new(ListenerHub::new());
        let rejections = Arc::new(RejectionCounters::new());
        let hasher: Arc<dyn ContentHasher> = Arc::new(Blake3Hasher);
        let ctx = StoreContext {
            verifier: Arc::new(Ed25519Verifier),
            hasher: hasher.clone(),
            clock: Arc::new(clock.clone()),
            hub: hub.clone(),
            rejections: rejections.clone(),
        };

        let tracker = Arc::new(SequenceTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(
            MutableRecordStore::new(ctx, tracker.clone(), Duration::from_secs(30 * 24 * 3600))
                .with_outbound(tx),
        );
        let ledger = Arc::new(AppendOnlyLedger::new(
            ClaimRegistry::default(),
            hasher.clone(),
            hub.clone(),
            rejections.clone(),
        ));

        Self {
            store,
            ledger,
            tracker,
            hub,
            clock,
            rejections,
            signer: seeded_signer(1),
            hasher,
            outbound: Mutex::new(Some(rx)),
        }
    }

    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    pub fn sign_record(
        &self,
        payload: ProtectedPayload,
        sequence_number: u64,
        expiration: u64,
        signer: &dyn RecordSigner,
    ) -> ProtectedRecord {
        ProtectedRecord::sign(payload, sequence_number, expiration, signer, self.hasher.as_ref())
            .expect("fixture payload encodes")
    }

    pub fn identity(&self, record: &ProtectedRecord) -> PayloadHash {
        record
            .identity(self.hasher.as_ref())
            .expect("fixture payload encodes")
    }

    /// Events queued on the (unstarted) hub
    pub fn drain_events(&self) -> Vec<StoreEvent> {
        self.hub.drain_queued()
    }

    /// Outbound mutations queued by local store calls
    pub fn drain_outbound(&self) -> Vec<OutboundMutation> {
        let mut guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let mut drained = Vec::new();
        if let Some(rx) = guard.as_mut() {
            while let Ok(mutation) = rx.try_recv() {
                drained.push(mutation);
            }
        }
        drained
    }

    /// Hand the outbound channel to a router
    pub fn take_outbound(&self) -> mpsc::UnboundedReceiver<OutboundMutation> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("outbound receiver already taken")
    }
}
