//! Local rejection counters
//!
//! Counts are kept in atomics so they can be queried in-process (tests, CLI
//! `inspect`) regardless of which metrics exporter, if any, is installed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why an inbound mutation or envelope was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    InvalidSignature,
    InvalidRecord,
    StaleSequence,
    ExpiredRecord,
    NotOwner,
    DuplicateClaim,
    MalformedEnvelope,
    UnknownProtocolVersion,
    UnknownMessageType,
}

impl RejectionReason {
    pub const ALL: [RejectionReason; 9] = [
        RejectionReason::InvalidSignature,
        RejectionReason::InvalidRecord,
        RejectionReason::StaleSequence,
        RejectionReason::ExpiredRecord,
        RejectionReason::NotOwner,
        RejectionReason::DuplicateClaim,
        RejectionReason::MalformedEnvelope,
        RejectionReason::UnknownProtocolVersion,
        RejectionReason::UnknownMessageType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InvalidSignature => "invalid_signature",
            RejectionReason::InvalidRecord => "invalid_record",
            RejectionReason::StaleSequence => "stale_sequence",
            RejectionReason::ExpiredRecord => "expired_record",
            RejectionReason::NotOwner => "not_owner",
            RejectionReason::DuplicateClaim => "duplicate_claim",
            RejectionReason::MalformedEnvelope => "malformed_envelope",
            RejectionReason::UnknownProtocolVersion => "unknown_protocol_version",
            RejectionReason::UnknownMessageType => "unknown_message_type",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reason rejection tallies
#[derive(Debug, Default)]
pub struct RejectionCounters {
    counts: [AtomicU64; 9],
}

impl RejectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a rejection locally and on the metrics facade
    pub fn record(&self, reason: RejectionReason) {
        self.counts[reason.index()].fetch_add(1, Ordering::Relaxed);
        super::mutation_rejected(reason);
    }

    pub fn count(&self, reason: RejectionReason) -> u64 {
        self.counts[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Non-zero counts, in declaration order
    pub fn snapshot(&self) -> Vec<(RejectionReason, u64)> {
        RejectionReason::ALL
            .iter()
            .map(|reason| (*reason, self.count(*reason)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_reason() {
        let counters = RejectionCounters::new();
        counters.record(RejectionReason::StaleSequence);
        counters.record(RejectionReason::StaleSequence);
        counters.record(RejectionReason::NotOwner);

        assert_eq!(counters.count(RejectionReason::StaleSequence), 2);
        assert_eq!(counters.count(RejectionReason::NotOwner), 1);
        assert_eq!(counters.count(RejectionReason::InvalidSignature), 0);
        assert_eq!(counters.total(), 3);
        assert_eq!(
            counters.snapshot(),
            vec![(RejectionReason::StaleSequence, 2), (RejectionReason::NotOwner, 1)]
        );
    }

    #[test]
    fn test_reason_index_covers_all() {
        for (i, reason) in RejectionReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }
}
