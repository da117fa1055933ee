/*
    AppendOnlyLedger - deduplicated storage for immutable records

    Responsibilities:
    `append_only.rs` stores payloads that are never updated or deleted once
    accepted (trade statistics). Entries are keyed by content hash; a second
    copy of the same payload is dropped silently. Per-variant claim predicates
    additionally reject a different payload claiming an already-claimed
    secondary key (first writer wins).

    Legacy payload shapes are migrated before hashing.

    Payloads this node published itself are marked local. Only those are
    republished after a restart; the mark is persisted with the payloads.

    Inputs:
    - add(payload) from the router (network)
    - append_local(payload) from local publication
    - restore(payloads, local) from the persistence bridge

    Outputs:
    - Appended events on the listener hub
    - contains/get/all read access
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

use super::claims::{ClaimKey, ClaimRegistry};
use super::errors::{StoreError, StoreResult};
use super::migration::migrate;
use crate::core_store::crypto::ContentHasher;
use crate::core_store::listeners::{ListenerHub, StoreEvent};
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::model::payload::PersistablePayload;
use crate::metrics::RejectionCounters;

/// Result of a successful add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(PayloadHash),
    Duplicate(PayloadHash),
}

impl AppendOutcome {
    pub fn identity(&self) -> PayloadHash {
        match self {
            AppendOutcome::Appended(id) | AppendOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, AppendOutcome::Appended(_))
    }
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<PayloadHash, Arc<PersistablePayload>>,
    claimed: HashMap<ClaimKey, PayloadHash>,
    local: HashSet<PayloadHash>,
}

pub struct AppendOnlyLedger {
    state: RwLock<LedgerState>,
    claims: ClaimRegistry,
    hasher: Arc<dyn ContentHasher>,
    hub: Arc<ListenerHub>,
    rejections: Arc<RejectionCounters>,
}

impl AppendOnlyLedger {
    pub fn new(
        claims: ClaimRegistry,
        hasher: Arc<dyn ContentHasher>,
        hub: Arc<ListenerHub>,
        rejections: Arc<RejectionCounters>,
    ) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            claims,
            hasher,
            hub,
            rejections,
        }
    }

    /// Add a payload. `Ok(false)` means an identical payload is already stored.
    pub fn add(&self, payload: PersistablePayload) -> StoreResult<bool> {
        self.append(payload).map(|outcome| outcome.is_new())
    }

    /// Same as `add`, but reports the identity the payload was stored under
    pub fn append(&self, payload: PersistablePayload) -> StoreResult<AppendOutcome> {
        let result = self.try_append(payload);
        if let Err(err) = &result {
            if let Some(reason) = err.rejection_reason() {
                self.rejections.record(reason);
            }
            debug!(error = %err, "Append-only payload rejected");
        }
        result
    }

    /// Append a payload this node published. The identity is marked local
    /// whether or not a peer delivered the same payload first.
    pub fn append_local(&self, payload: PersistablePayload) -> StoreResult<AppendOutcome> {
        let outcome = self.append(payload)?;
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .local
            .insert(outcome.identity());
        Ok(outcome)
    }

    fn try_append(&self, payload: PersistablePayload) -> StoreResult<AppendOutcome> {
        let (payload, migrated) = migrate(payload);
        if migrated {
            crate::metrics::ledger_migrated();
        }
        payload.validate()?;

        let identity = payload
            .identity(self.hasher.as_ref())
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        let keys = self.claims.claim_keys(&payload);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.entries.contains_key(&identity) {
            trace!(identity = %identity, "Duplicate append-only payload ignored");
            return Ok(AppendOutcome::Duplicate(identity));
        }

        for key in &keys {
            if let Some(existing) = state.claimed.get(key) {
                return Err(StoreError::DuplicateImmutableClaim {
                    key: key.to_string(),
                    existing: *existing,
                });
            }
        }

        let type_name = payload.type_name();
        let payload = Arc::new(payload);
        state.entries.insert(identity, payload.clone());
        for key in keys {
            state.claimed.insert(key, identity);
        }
        let len = state.entries.len();

        // Enqueued under the lock so subscribers see acceptance order
        self.hub.publish(StoreEvent::Appended { identity, payload });
        drop(state);

        crate::metrics::ledger_appended(type_name);
        crate::metrics::set_ledger_records(len);
        debug!(identity = %identity, kind = type_name, "Append-only payload stored");
        Ok(AppendOutcome::Appended(identity))
    }

    pub fn contains(&self, identity: &PayloadHash) -> bool {
        self.read().entries.contains_key(identity)
    }

    pub fn get(&self, identity: &PayloadHash) -> Option<Arc<PersistablePayload>> {
        self.read().entries.get(identity).cloned()
    }

    /// Point-in-time view of every entry. Order is unspecified.
    pub fn all(&self) -> impl Iterator<Item = (PayloadHash, Arc<PersistablePayload>)> {
        let entries: Vec<_> = self
            .read()
            .entries
            .iter()
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();
        entries.into_iter()
    }

    /// Published by this node
    pub fn is_local(&self, identity: &PayloadHash) -> bool {
        self.read().local.contains(identity)
    }

    /// Identities published by this node, sorted, for the snapshot blob
    pub fn local_identities(&self) -> Vec<PayloadHash> {
        let mut local: Vec<_> = self.read().local.iter().copied().collect();
        local.sort();
        local
    }

    /// Owner of a claim key, if any
    pub fn claimed_by(&self, key: &ClaimKey) -> Option<PayloadHash> {
        self.read().claimed.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payloads for the snapshot blob
    pub fn payloads(&self) -> Vec<PersistablePayload> {
        self.read().entries.values().map(|p| p.as_ref().clone()).collect()
    }

    /// Load restored payloads without publishing events.
    ///
    /// Payloads colliding on a claim with an earlier one are skipped. Local marks
    /// without a restored payload are dropped.
    pub fn restore(
        &self,
        payloads: Vec<PersistablePayload>,
        local: Vec<PayloadHash>,
    ) -> StoreResult<usize> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = LedgerState::default();

        for payload in payloads {
            let (payload, _) = migrate(payload);
            let identity = payload.identity(self.hasher.as_ref())?;
            let keys = self.claims.claim_keys(&payload);
            if keys.iter().any(|key| state.claimed.contains_key(key)) {
                debug!(identity = %identity, "Restored payload collides on claim, skipped");
                continue;
            }
            for key in keys {
                state.claimed.insert(key, identity);
            }
            state.entries.insert(identity, Arc::new(payload));
        }
        let local: HashSet<_> = local
            .into_iter()
            .filter(|identity| state.entries.contains_key(identity))
            .collect();
        state.local = local;

        crate::metrics::set_ledger_records(state.entries.len());
        Ok(state.entries.len())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}
