/*
    scenarios.rs - store behaviour as seen through inbound peer traffic

    Each test drives the stores the way the router does for remote senders
    (`sender_is_self = false`) and checks state plus the emitted events.
*/

use std::sync::Arc;
use std::thread;

use tradenet_core::core_store::listeners::StoreEvent;
use tradenet_core::core_store::model::payload::PersistablePayload;
use tradenet_core::core_store::model::record::RemovalRequest;
use tradenet_core::core_store::store::StoreError;
use tradenet_core::test_utils::{
    dispute_payload, offer_payload, trade_statistics, StoreHarness, EXP, NOW,
};

#[test]
fn test_duplicate_add_fires_one_event() {
    let h = StoreHarness::new(NOW);
    let record = h.sign_record(offer_payload("offer-O"), 1, EXP, &h.signer);

    assert!(h.store.add(record.clone(), false).unwrap());
    assert!(!h.store.add(record, false).unwrap());

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StoreEvent::Added { .. }));
}

#[test]
fn test_concurrent_adds_keep_highest_sequence() {
    for order in [[2u64, 3], [3, 2]] {
        let h = Arc::new(StoreHarness::new(NOW));
        let records: Vec<_> = order
            .iter()
            .map(|seq| h.sign_record(offer_payload("offer-O"), *seq, EXP, &h.signer))
            .collect();
        let identity = h.identity(&records[0]);

        let handles: Vec<_> = records
            .into_iter()
            .map(|record| {
                let h = h.clone();
                thread::spawn(move || h.store.add(record, false))
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) | Err(StoreError::StaleSequence { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(h.store.get(&identity).unwrap().sequence_number, 3);
        assert_eq!(h.tracker.current(&identity).unwrap().sequence_number, 3);
    }
}

#[test]
fn test_competing_claim_on_offer_id_rejected() {
    let h = StoreHarness::new(NOW);

    let first = h
        .ledger
        .append(PersistablePayload::TradeStatistics(trade_statistics("offer-123", 30_000)))
        .unwrap();
    assert!(first.is_new());

    let mut competing = trade_statistics("offer-123", 30_000);
    competing.deposit_tx_id = "another-tx".to_string();
    let result = h.ledger.append(PersistablePayload::TradeStatistics(competing));

    assert!(matches!(
        result,
        Err(StoreError::DuplicateImmutableClaim { existing, .. }) if existing == first.identity()
    ));
    assert_eq!(h.ledger.len(), 1);
    assert!(h.ledger.contains(&first.identity()));
}

#[test]
fn test_remove_of_unknown_identity_is_quiet() {
    let h = StoreHarness::new(NOW);
    let record = h.sign_record(dispute_payload("trade-1"), 1, EXP, &h.signer);
    let identity = h.identity(&record);

    let request = RemovalRequest::sign(identity, 1, &h.signer);
    assert!(!h.store.remove(request, false).unwrap());
    assert!(h.drain_events().is_empty());
    assert_eq!(h.rejections.total(), 0);
}
