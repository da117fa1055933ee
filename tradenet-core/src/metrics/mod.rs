//! Metrics for the data store and persistence layer
//!
//! Metric names follow `tradenet_<subsystem>_<what>`. Router-side metrics live
//! in `core_router::metrics`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub mod collector;

pub use collector::{RejectionCounters, RejectionReason};

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Mutable store
    describe_counter!(
        "tradenet_store_mutations_total",
        "Accepted mutable-store mutations, labeled by op (add, remove, refresh) and kind"
    );
    describe_counter!(
        "tradenet_store_rejections_total",
        "Rejected mutations and envelopes, labeled by reason"
    );
    describe_counter!(
        "tradenet_store_expired_total",
        "Records removed by the expiry sweep"
    );
    describe_gauge!("tradenet_store_records", "Current number of mutable records");

    // Append-only ledger
    describe_counter!(
        "tradenet_ledger_appends_total",
        "Accepted append-only records, labeled by type"
    );
    describe_counter!(
        "tradenet_ledger_migrations_total",
        "Legacy payloads converted at ingestion"
    );
    describe_gauge!("tradenet_ledger_records", "Current number of append-only records");

    // Persistence
    describe_histogram!(
        "tradenet_snapshot_duration_seconds",
        "Time to write all snapshot blobs"
    );
    describe_counter!(
        "tradenet_snapshot_failures_total",
        "Snapshot writes that failed, labeled by blob"
    );

    // Listener hub
    describe_counter!(
        "tradenet_listener_panics_total",
        "Subscriber callbacks that panicked and were isolated"
    );

    crate::core_router::metrics::init_metrics();
}

pub fn mutation_accepted(op: &'static str, kind: &'static str) {
    counter!("tradenet_store_mutations_total", "op" => op, "kind" => kind).increment(1);
}

pub fn mutation_rejected(reason: RejectionReason) {
    counter!("tradenet_store_rejections_total", "reason" => reason.as_str()).increment(1);
}

pub fn records_expired(count: usize) {
    counter!("tradenet_store_expired_total").increment(count as u64);
}

pub fn set_store_records(count: usize) {
    gauge!("tradenet_store_records").set(count as f64);
}

pub fn ledger_appended(type_name: &'static str) {
    counter!("tradenet_ledger_appends_total", "type" => type_name).increment(1);
}

pub fn ledger_migrated() {
    counter!("tradenet_ledger_migrations_total").increment(1);
}

pub fn set_ledger_records(count: usize) {
    gauge!("tradenet_ledger_records").set(count as f64);
}

pub fn snapshot_failed(blob: &'static str) {
    counter!("tradenet_snapshot_failures_total", "blob" => blob).increment(1);
}

pub fn listener_panicked() {
    counter!("tradenet_listener_panics_total").increment(1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in seconds
    pub fn stop(self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        histogram!(self.name).record(elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        // Metrics are initialized globally, just ensure it doesn't panic
        init_metrics();
        mutation_accepted("add", "offer");
        mutation_rejected(RejectionReason::StaleSequence);
        records_expired(3);
        set_store_records(10);
        ledger_appended("trade_statistics");
        ledger_migrated();
        set_ledger_records(5);
        snapshot_failed("sequence_map");
        listener_panicked();
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("tradenet_snapshot_duration_seconds");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() > 0.0);
    }
}
