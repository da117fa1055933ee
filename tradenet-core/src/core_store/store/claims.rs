//! Secondary-key claims for append-only records
//!
//! Two immutable records with different content can still describe the same
//! real-world thing (the same offer traded twice, republished with a tweaked
//! field). A claim predicate extracts the key that must stay unique per variant;
//! the first record to claim a key wins.

use std::fmt;

use crate::core_store::model::payload::PersistablePayload;

type Extractor = Box<dyn Fn(&PersistablePayload) -> Option<String> + Send + Sync>;

/// Namespaced secondary key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub namespace: &'static str,
    pub key: String,
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

struct ClaimPredicate {
    namespace: &'static str,
    extract: Extractor,
}

/// Per-variant claim predicates consulted by the ledger
pub struct ClaimRegistry {
    predicates: Vec<ClaimPredicate>,
}

impl ClaimRegistry {
    /// Registry with no predicates: only content hashes deduplicate
    pub fn empty() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }

    /// Add a predicate. `extract` returns `None` for payloads it does not cover.
    pub fn with_predicate<F>(mut self, namespace: &'static str, extract: F) -> Self
    where
        F: Fn(&PersistablePayload) -> Option<String> + Send + Sync + 'static,
    {
        self.predicates.push(ClaimPredicate {
            namespace,
            extract: Box::new(extract),
        });
        self
    }

    pub fn claim_keys(&self, payload: &PersistablePayload) -> Vec<ClaimKey> {
        self.predicates
            .iter()
            .filter_map(|p| {
                (p.extract)(payload).map(|key| ClaimKey {
                    namespace: p.namespace,
                    key,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl Default for ClaimRegistry {
    /// One trade statistic per offer ID
    fn default() -> Self {
        Self::empty().with_predicate("offer_id", |payload| match payload {
            PersistablePayload::TradeStatistics(stats) => Some(stats.offer_id.clone()),
            _ => None,
        })
    }
}

impl fmt::Debug for ClaimRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.predicates.iter().map(|p| p.namespace)).finish()
    }
}
