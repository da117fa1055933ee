/*
    SequenceTracker - replay and staleness protection for mutable records

    Responsibilities:
    `sequence_tracker.rs` remembers, per identity, the highest sequence number
    accepted and the expiration it came with. Every add/refresh/remove must carry
    a sequence number strictly above the tracked one, unless the tracked entry has
    already expired, in which case the mutation is treated as a fresh record.

    The map outlives the records themselves: a removed record keeps its entry so
    an old add cannot be replayed to resurrect it.

    Inputs:
    - check(identity, candidate, now)
    - commit(identity, seq, expiration) after a mutation is applied
    - restore(entries) before the node accepts network input

    Outputs:
    - verdicts (Accept / Stale / ExpiredOverride)
    - a change notification consumed by the persistence writer
*/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

use crate::core_store::model::hash::PayloadHash;

/// Outcome of a sequence check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Candidate is above the tracked sequence (or identity unseen)
    Accept,
    /// Candidate is at or below the tracked, unexpired sequence
    Stale { stored: u64 },
    /// Tracked entry has expired; candidate accepted regardless of its number
    ExpiredOverride,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Verdict::Stale { .. })
    }
}

/// Persisted per-identity sequence state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub sequence_number: u64,
    pub expiration_timestamp: u64,
}

pub struct SequenceTracker {
    entries: RwLock<HashMap<PayloadHash, SequenceEntry>>,
    changed: Arc<Notify>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn check(&self, identity: &PayloadHash, candidate: u64, now: u64) -> Verdict {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(identity) {
            None => Verdict::Accept,
            Some(entry) if entry.expiration_timestamp <= now => Verdict::ExpiredOverride,
            Some(entry) if candidate > entry.sequence_number => Verdict::Accept,
            Some(entry) => Verdict::Stale {
                stored: entry.sequence_number,
            },
        }
    }

    /// Record an accepted mutation and wake the persistence writer
    pub fn commit(&self, identity: PayloadHash, sequence_number: u64, expiration_timestamp: u64) {
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.insert(
                identity,
                SequenceEntry {
                    sequence_number,
                    expiration_timestamp,
                },
            );
        }
        self.changed.notify_one();
    }

    pub fn current(&self, identity: &PayloadHash) -> Option<SequenceEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .copied()
    }

    /// Sequence number to use for the next local mutation of `identity`
    pub fn next_sequence(&self, identity: &PayloadHash) -> u64 {
        self.current(identity)
            .map(|entry| entry.sequence_number.saturating_add(1))
            .unwrap_or(1)
    }

    /// Drop entries that expired more than `retention` before `now`.
    ///
    /// Expired entries already grant an override, so this only reclaims memory.
    pub fn purge_expired(&self, now: u64, retention: Duration) -> usize {
        let cutoff = now.saturating_sub(retention.as_millis() as u64);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expiration_timestamp > cutoff);
        let purged = before - entries.len();
        drop(entries);

        if purged > 0 {
            tracing::debug!(purged, "Purged expired sequence entries");
            self.changed.notify_one();
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole map for persistence
    pub fn entries(&self) -> HashMap<PayloadHash, SequenceEntry> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the map with restored state
    pub fn restore(&self, restored: HashMap<PayloadHash, SequenceEntry>) {
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = restored;
    }

    /// Notified after every commit or purge
    pub fn change_notifier(&self) -> Arc<Notify> {
        self.changed.clone()
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u8) -> PayloadHash {
        PayloadHash::from_bytes([n; 32])
    }

    #[test]
    fn test_unknown_identity_accepts() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.check(&id(1), 0, 100), Verdict::Accept);
    }

    #[test]
    fn test_stale_and_equal_rejected() {
        let tracker = SequenceTracker::new();
        tracker.commit(id(1), 5, 1_000);

        assert_eq!(tracker.check(&id(1), 6, 100), Verdict::Accept);
        assert_eq!(tracker.check(&id(1), 5, 100), Verdict::Stale { stored: 5 });
        assert_eq!(tracker.check(&id(1), 4, 100), Verdict::Stale { stored: 5 });
    }

    #[test]
    fn test_expired_entry_overrides() {
        let tracker = SequenceTracker::new();
        tracker.commit(id(1), 5, 1_000);

        assert_eq!(tracker.check(&id(1), 1, 999), Verdict::Stale { stored: 5 });
        assert_eq!(tracker.check(&id(1), 1, 1_000), Verdict::ExpiredOverride);
        assert!(Verdict::ExpiredOverride.is_accepted());
    }

    #[test]
    fn test_next_sequence() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.next_sequence(&id(1)), 1);

        tracker.commit(id(1), 7, 1_000);
        assert_eq!(tracker.next_sequence(&id(1)), 8);
    }

    #[test]
    fn test_purge_expired_respects_retention() {
        let tracker = SequenceTracker::new();
        tracker.commit(id(1), 1, 1_000);
        tracker.commit(id(2), 1, 50_000);
        tracker.commit(id(3), 1, 200_000);

        let purged = tracker.purge_expired(100_000, Duration::from_secs(10));
        assert_eq!(purged, 1);
        assert!(tracker.current(&id(1)).is_none());
        assert!(tracker.current(&id(2)).is_some());
        assert!(tracker.current(&id(3)).is_some());
    }

    #[test]
    fn test_restore_replaces_entries() {
        let tracker = SequenceTracker::new();
        tracker.commit(id(1), 1, 10);

        let mut restored = HashMap::new();
        restored.insert(
            id(2),
            SequenceEntry {
                sequence_number: 9,
                expiration_timestamp: 99,
            },
        );
        tracker.restore(restored);

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.current(&id(2)).map(|e| e.sequence_number), Some(9));
    }

    #[tokio::test]
    async fn test_commit_notifies_writer() {
        let tracker = SequenceTracker::new();
        let notifier = tracker.change_notifier();

        tracker.commit(id(1), 1, 10);
        tokio::time::timeout(std::time::Duration::from_millis(100), notifier.notified())
            .await
            .expect("commit should notify");
    }

    proptest! {
        #[test]
        fn prop_accepted_sequence_never_decreases(seqs in proptest::collection::vec(0u64..50, 1..40)) {
            let tracker = SequenceTracker::new();
            let identity = id(7);
            let mut highest: Option<u64> = None;

            for seq in seqs {
                if tracker.check(&identity, seq, 0).is_accepted() {
                    tracker.commit(identity, seq, u64::MAX);
                    if let Some(prev) = highest {
                        prop_assert!(seq > prev);
                    }
                    highest = Some(seq);
                }
                prop_assert_eq!(tracker.current(&identity).map(|e| e.sequence_number), highest);
            }
        }
    }
}
