/*
    persistence.rs - snapshot and restore across store instances
*/

use std::time::Duration;

use tradenet_core::core_store::model::payload::PersistablePayload;
use tradenet_core::core_store::store::snapshot::{APPEND_ONLY_FILE, SEQUENCE_MAP_FILE};
use tradenet_core::core_store::store::{PersistenceBridge, StoreError};
use tradenet_core::test_utils::{
    dispute_payload, legacy_trade_statistics, offer_payload, trade_statistics, StoreHarness, EXP,
    NOW,
};

fn bridge(h: &StoreHarness, dir: &std::path::Path) -> PersistenceBridge {
    PersistenceBridge::new(dir, h.store.clone(), h.ledger.clone(), h.clock_handle())
}

#[test]
fn test_round_trip_into_fresh_stores() {
    let dir = tempfile::tempdir().unwrap();

    let source = StoreHarness::new(NOW);
    let offer = source.sign_record(offer_payload("offer-1"), 4, EXP, &source.signer);
    let dispute = source.sign_record(dispute_payload("trade-1"), 1, EXP + 1_000, &source.signer);
    let offer_id = source.identity(&offer);
    source.store.add(offer, false).unwrap();
    source.store.add(dispute, false).unwrap();
    source
        .ledger
        .add(PersistablePayload::TradeStatistics(trade_statistics("offer-7", 30_000)))
        .unwrap();
    bridge(&source, dir.path()).snapshot().unwrap();

    let restored = StoreHarness::new(NOW);
    let report = bridge(&restored, dir.path()).restore().unwrap();

    assert_eq!(report.records, 2);
    assert_eq!(report.appended, 1);
    assert_eq!(report.sequences, 2);
    assert_eq!(restored.store.get(&offer_id).unwrap().sequence_number, 4);
    assert_eq!(restored.tracker.current(&offer_id).unwrap().sequence_number, 4);
    // Restore is silent
    assert!(restored.drain_events().is_empty());
}

#[test]
fn test_expired_records_dropped_on_restore() {
    let dir = tempfile::tempdir().unwrap();

    let source = StoreHarness::new(NOW);
    let short = source.sign_record(offer_payload("offer-1"), 1, NOW + 1_000, &source.signer);
    let long = source.sign_record(offer_payload("offer-2"), 1, EXP, &source.signer);
    let short_id = source.identity(&short);
    source.store.add(short, false).unwrap();
    source.store.add(long, false).unwrap();
    bridge(&source, dir.path()).snapshot().unwrap();

    let restored = StoreHarness::new(NOW);
    restored.clock.advance(Duration::from_secs(2));
    let report = bridge(&restored, dir.path()).restore().unwrap();

    assert_eq!(report.records, 1);
    assert!(!restored.store.contains(&short_id));
    // Its sequence entry still guards against replays
    assert!(restored.tracker.current(&short_id).is_some());
}

#[test]
fn test_legacy_payloads_persist_in_current_shape() {
    let dir = tempfile::tempdir().unwrap();

    let source = StoreHarness::new(NOW);
    source
        .ledger
        .add(PersistablePayload::LegacyTradeStatistics(legacy_trade_statistics("offer-3", 28_000)))
        .unwrap();
    bridge(&source, dir.path()).snapshot().unwrap();

    let restored = StoreHarness::new(NOW);
    bridge(&restored, dir.path()).restore().unwrap();

    let payloads = restored.ledger.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(!payloads[0].is_legacy());
}

#[test]
fn test_missing_blobs_start_empty() {
    let dir = tempfile::tempdir().unwrap();
    let fresh = StoreHarness::new(NOW);

    let report = bridge(&fresh, dir.path()).restore().unwrap();
    assert!(report.is_fresh());
}

#[test]
fn test_truncated_blob_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source = StoreHarness::new(NOW);
    source
        .ledger
        .add(PersistablePayload::TradeStatistics(trade_statistics("offer-7", 30_000)))
        .unwrap();
    bridge(&source, dir.path()).snapshot().unwrap();

    let path = dir.path().join(APPEND_ONLY_FILE);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let restored = StoreHarness::new(NOW);
    let result = bridge(&restored, dir.path()).restore();
    assert!(matches!(result, Err(StoreError::PersistenceReadFailure(_))));
}

#[test]
fn test_sequence_only_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let source = StoreHarness::new(NOW);
    source
        .store
        .add(source.sign_record(offer_payload("offer-1"), 2, EXP, &source.signer), false)
        .unwrap();

    bridge(&source, dir.path()).snapshot_sequences().unwrap();
    assert!(dir.path().join(SEQUENCE_MAP_FILE).exists());
    assert!(!dir.path().join(APPEND_ONLY_FILE).exists());
}
