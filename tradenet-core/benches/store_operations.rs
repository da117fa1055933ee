use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use tradenet_core::core_router::{BroadcastMessage, NetworkEnvelope};
use tradenet_core::core_store::model::payload::PersistablePayload;
use tradenet_core::core_store::store::PersistenceBridge;
use tradenet_core::test_utils::{offer_payload, trade_statistics, StoreHarness, NOW};

const EXP: u64 = NOW + 3_600_000;

fn bench_mutable_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutable_store");
    group.measurement_time(Duration::from_secs(5));

    for size in [100usize, 1_000] {
        let h = StoreHarness::new(NOW);
        let records: Vec<_> = (0..size)
            .map(|i| h.sign_record(offer_payload(&format!("offer-{i}")), 1, EXP, &h.signer))
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("add_fresh", size), &records, |b, records| {
            b.iter(|| {
                let h = StoreHarness::new(NOW);
                for record in records {
                    black_box(h.store.add(record.clone(), false).unwrap());
                }
            });
        });
    }

    // Replays are the common case on a busy network
    let h = StoreHarness::new(NOW);
    let record = h.sign_record(offer_payload("offer-replayed"), 5, EXP, &h.signer);
    h.store.add(record.clone(), false).unwrap();
    group.bench_function("add_duplicate", |b| {
        b.iter(|| black_box(h.store.add(record.clone(), false).unwrap()));
    });

    group.finish();
}

fn bench_ledger_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_only_ledger");

    let payloads: Vec<_> = (0..1_000)
        .map(|i| PersistablePayload::TradeStatistics(trade_statistics(&format!("offer-{i}"), 30_000 + i)))
        .collect();

    group.throughput(Throughput::Elements(payloads.len() as u64));
    group.bench_function("append_1000", |b| {
        b.iter(|| {
            let h = StoreHarness::new(NOW);
            for payload in &payloads {
                black_box(h.ledger.add(payload.clone()).unwrap());
            }
        });
    });

    group.finish();
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");

    let h = StoreHarness::new(NOW);
    let record = h.sign_record(offer_payload("offer-1"), 1, EXP, &h.signer);
    let envelope = BroadcastMessage::AddMutable(record).to_envelope().unwrap();
    let bytes = envelope.to_bytes().unwrap();

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(envelope.to_bytes().unwrap()));
    });
    group.bench_function("decode", |b| {
        b.iter(|| {
            let decoded = NetworkEnvelope::from_bytes(black_box(&bytes)).unwrap();
            black_box(BroadcastMessage::from_envelope(&decoded).unwrap())
        });
    });
    group.bench_function("digest", |b| {
        b.iter(|| black_box(envelope.digest()));
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("persistence");
    group.sample_size(20);

    let h = StoreHarness::new(NOW);
    for i in 0..1_000 {
        let record = h.sign_record(offer_payload(&format!("offer-{i}")), 1, EXP, &h.signer);
        h.store.add(record, false).unwrap();
    }
    let dir = tempfile::tempdir().unwrap();
    let bridge = PersistenceBridge::new(dir.path(), h.store.clone(), h.ledger.clone(), h.clock_handle());

    group.bench_function("snapshot_1000_records", |b| {
        b.iter(|| bridge.snapshot().unwrap());
    });
    group.bench_function("restore_1000_records", |b| {
        b.iter(|| {
            let fresh = StoreHarness::new(NOW);
            let bridge = PersistenceBridge::new(
                dir.path(),
                fresh.store.clone(),
                fresh.ledger.clone(),
                fresh.clock_handle(),
            );
            black_box(bridge.restore().unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_mutable_add,
    bench_ledger_append,
    bench_envelope_codec,
    bench_snapshot
);
criterion_main!(benches);
