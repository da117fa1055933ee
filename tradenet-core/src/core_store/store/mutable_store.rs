/*
    MutableRecordStore - owner-signed, expiring, sequence-numbered records

    Responsibilities:
    `mutable_store.rs` holds the replicated view of mutable network data (offers,
    disputes, proposals, preferences). Every mutation is:
    - authenticated: the owner's signature must verify
    - ordered: its sequence number must beat the tracked one (see SequenceTracker)
    - owned: the identity hashes the owner key in, and only that key may
      remove or refresh the record

    Mutations of one identity are serialized through a striped lock. Listener
    events and outbound broadcast requests are enqueued while that lock is held,
    so both observe acceptance order; neither is delivered under the lock.

    Inputs:
    - add(record, sender_is_self)
    - remove(request, sender_is_self)
    - refresh(request, sender_is_self)
    - expiry_sweep(now) from the node's sweeper

    Outputs:
    - Added / Removed / Refreshed events on the listener hub
    - OutboundMutation requests for the broadcast router (local mutations only)
    - cancellation of a pending broadcast whenever a record is removed or
      expires, before the lock is released
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::errors::{StoreError, StoreResult};
use super::sequence_tracker::{SequenceTracker, Verdict};
use super::StoreContext;
use crate::core_store::crypto::VerifyError;
use crate::core_store::listeners::{RemovalCause, StoreEvent};
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::model::payload::PayloadKind;
use crate::core_store::model::record::{OwnerKey, ProtectedRecord, RefreshRequest, RemovalRequest};

/// Number of lock stripes
pub const LOCK_STRIPES: usize = 64;

/// Local mutation handed to the broadcast router
#[derive(Debug, Clone)]
pub enum OutboundMutation {
    Publish {
        identity: PayloadHash,
        record: Arc<ProtectedRecord>,
    },
    Refresh {
        identity: PayloadHash,
        request: RefreshRequest,
        record: Arc<ProtectedRecord>,
    },
    Remove {
        request: RemovalRequest,
    },
}

/// Outbound broadcasts that have not been sent yet
pub trait PendingBroadcasts: Send + Sync {
    /// Withdraw the pending broadcast for `identity`. Returns whether one existed.
    fn cancel_pending(&self, identity: &PayloadHash) -> bool;
}

/// Striped per-identity mutation locks
struct IdentityLocks {
    stripes: Vec<Mutex<()>>,
}

impl IdentityLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, identity: &PayloadHash) -> MutexGuard<'_, ()> {
        self.stripes[identity.stripe(self.stripes.len())]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MutableRecordStore {
    records: RwLock<HashMap<PayloadHash, Arc<ProtectedRecord>>>,
    locks: IdentityLocks,
    tracker: Arc<SequenceTracker>,
    ctx: StoreContext,
    outbound: Option<mpsc::UnboundedSender<OutboundMutation>>,
    pending: RwLock<Option<Arc<dyn PendingBroadcasts>>>,
    max_ttl: Duration,
}

impl MutableRecordStore {
    pub fn new(ctx: StoreContext, tracker: Arc<SequenceTracker>, max_ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: IdentityLocks::new(LOCK_STRIPES),
            tracker,
            ctx,
            outbound: None,
            pending: RwLock::new(None),
            max_ttl,
        }
    }

    /// Route local mutations to the broadcast router
    pub fn with_outbound(mut self, outbound: mpsc::UnboundedSender<OutboundMutation>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    /// Broadcasts to withdraw when a record goes away. Replaces any earlier one.
    pub fn attach_pending(&self, pending: Arc<dyn PendingBroadcasts>) {
        *self.pending.write().unwrap_or_else(PoisonError::into_inner) = Some(pending);
    }

    pub fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.tracker
    }

    /// Add or replace a record.
    ///
    /// `Ok(false)` means this exact record is already stored.
    pub fn add(&self, record: ProtectedRecord, sender_is_self: bool) -> StoreResult<bool> {
        let kind = record.kind();
        let result = self.try_add(record, sender_is_self);
        self.account("add", kind, result)
    }

    /// Remove a record on behalf of its owner. Absent identities yield `Ok(false)`.
    pub fn remove(&self, request: RemovalRequest, sender_is_self: bool) -> StoreResult<bool> {
        let kind = self.get(&request.identity).map(|r| r.kind()).unwrap_or(PayloadKind::Unknown);
        let result = self.try_remove(request, sender_is_self);
        self.account("remove", kind, result)
    }

    /// Extend a record's TTL. Absent identities yield `Ok(false)`.
    pub fn refresh(&self, request: RefreshRequest, sender_is_self: bool) -> StoreResult<bool> {
        let kind = self.get(&request.identity).map(|r| r.kind()).unwrap_or(PayloadKind::Unknown);
        let result = self.try_refresh(request, sender_is_self);
        self.account("refresh", kind, result)
    }

    fn try_add(&self, record: ProtectedRecord, sender_is_self: bool) -> StoreResult<bool> {
        record.payload.validate()?;
        let identity = record
            .identity(self.ctx.hasher.as_ref())
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;

        let now = self.ctx.clock.now_millis();
        self.check_expiration(&identity, record.expiration_timestamp, now)?;
        self.verify(
            &identity,
            &record.signing_bytes(&identity),
            &record.signature,
            &record.owner_public_key,
        )?;

        let _guard = self.locks.lock(&identity);

        let stored = self.get(&identity);
        if let Some(stored) = &stored {
            if stored.as_ref() == &record {
                trace!(identity = %identity, seq = record.sequence_number, "Record already stored");
                return Ok(false);
            }
        }

        if let Verdict::Stale { stored } =
            self.tracker.check(&identity, record.sequence_number, now)
        {
            return Err(StoreError::StaleSequence {
                identity,
                stored,
                candidate: record.sequence_number,
            });
        }

        let record = Arc::new(record);
        let previous = self.write().insert(identity, record.clone());
        self.tracker.commit(identity, record.sequence_number, record.expiration_timestamp);

        if let Some(old) = previous {
            self.ctx.hub.publish(StoreEvent::Removed {
                identity,
                record: old,
                cause: RemovalCause::Replaced,
            });
        }
        self.ctx.hub.publish(StoreEvent::Added {
            identity,
            record: record.clone(),
        });
        if sender_is_self {
            self.send_outbound(OutboundMutation::Publish { identity, record: record.clone() });
        }

        debug!(
            identity = %identity,
            seq = record.sequence_number,
            kind = %record.kind(),
            local = sender_is_self,
            "Record added"
        );
        Ok(true)
    }

    fn try_remove(&self, request: RemovalRequest, sender_is_self: bool) -> StoreResult<bool> {
        let identity = request.identity;
        let now = self.ctx.clock.now_millis();
        let _guard = self.locks.lock(&identity);

        let Some(stored) = self.get(&identity) else {
            trace!(identity = %identity, "Removal of unknown record ignored");
            return Ok(false);
        };

        if request.owner_public_key != stored.owner_public_key {
            return Err(StoreError::NotOwner(identity));
        }
        self.verify(
            &identity,
            &request.signing_bytes(),
            &request.signature,
            &request.owner_public_key,
        )?;

        if let Verdict::Stale { stored } =
            self.tracker.check(&identity, request.sequence_number, now)
        {
            return Err(StoreError::StaleSequence {
                identity,
                stored,
                candidate: request.sequence_number,
            });
        }

        self.write().remove(&identity);
        self.tracker.commit(identity, request.sequence_number, stored.expiration_timestamp);
        self.cancel_pending(&identity);

        self.ctx.hub.publish(StoreEvent::Removed {
            identity,
            record: stored,
            cause: RemovalCause::Removed,
        });
        if sender_is_self {
            self.send_outbound(OutboundMutation::Remove { request: request.clone() });
        }

        debug!(identity = %identity, seq = request.sequence_number, "Record removed");
        Ok(true)
    }

    fn try_refresh(&self, request: RefreshRequest, sender_is_self: bool) -> StoreResult<bool> {
        let identity = request.identity;
        let now = self.ctx.clock.now_millis();
        self.check_expiration(&identity, request.expiration_timestamp, now)?;

        let _guard = self.locks.lock(&identity);

        let Some(stored) = self.get(&identity) else {
            trace!(identity = %identity, "Refresh of unknown record ignored");
            return Ok(false);
        };

        // Only the stored owner can produce a valid signature
        self.verify(
            &identity,
            &request.signing_bytes(),
            &request.signature,
            &stored.owner_public_key,
        )?;

        if let Verdict::Stale { stored } =
            self.tracker.check(&identity, request.sequence_number, now)
        {
            return Err(StoreError::StaleSequence {
                identity,
                stored,
                candidate: request.sequence_number,
            });
        }

        let refreshed = Arc::new(stored.refreshed(&request));
        self.write().insert(identity, refreshed.clone());
        self.tracker.commit(identity, request.sequence_number, request.expiration_timestamp);

        self.ctx.hub.publish(StoreEvent::Refreshed {
            identity,
            record: refreshed.clone(),
        });
        if sender_is_self {
            self.send_outbound(OutboundMutation::Refresh {
                identity,
                request: request.clone(),
                record: refreshed,
            });
        }

        debug!(
            identity = %identity,
            seq = request.sequence_number,
            expires = request.expiration_timestamp,
            "Record refreshed"
        );
        Ok(true)
    }

    /// Remove every record with `expiration_timestamp <= now`
    pub fn expiry_sweep(&self, now: u64) -> usize {
        let candidates: Vec<PayloadHash> = self
            .read()
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(identity, _)| *identity)
            .collect();

        let mut removed = 0;
        for identity in candidates {
            let _guard = self.locks.lock(&identity);

            // A refresh may have landed since the scan
            let mut records = self.write();
            let still_expired = records.get(&identity).is_some_and(|r| r.is_expired(now));
            if !still_expired {
                continue;
            }
            let record = records.remove(&identity);
            drop(records);
            self.cancel_pending(&identity);
            if let Some(record) = record {
                self.ctx.hub.publish(StoreEvent::Removed {
                    identity,
                    record,
                    cause: RemovalCause::Expired,
                });
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, now, "Expiry sweep removed records");
            crate::metrics::records_expired(removed);
            crate::metrics::set_store_records(self.len());
        }
        removed
    }

    pub fn get(&self, identity: &PayloadHash) -> Option<Arc<ProtectedRecord>> {
        self.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &PayloadHash) -> bool {
        self.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<(PayloadHash, Arc<ProtectedRecord>)> {
        self.read().iter().map(|(id, record)| (*id, record.clone())).collect()
    }

    pub fn records_of_kind(&self, kind: PayloadKind) -> Vec<(PayloadHash, Arc<ProtectedRecord>)> {
        self.read()
            .iter()
            .filter(|(_, record)| record.kind() == kind)
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    /// Record counts per kind, for inspection
    pub fn count_by_kind(&self) -> Vec<(PayloadKind, usize)> {
        let records = self.read();
        PayloadKind::ALL
            .iter()
            .map(|kind| (*kind, records.values().filter(|r| r.kind() == *kind).count()))
            .collect()
    }

    /// Plain copies for the snapshot blob
    pub fn snapshot_records(&self) -> Vec<ProtectedRecord> {
        self.read().values().map(|r| r.as_ref().clone()).collect()
    }

    /// Load restored records without publishing events. Expired records are dropped.
    ///
    /// Expects the sequence tracker to be restored first; entries lagging behind a
    /// restored record are raised to it.
    pub fn restore(&self, restored: Vec<ProtectedRecord>, now: u64) -> StoreResult<usize> {
        let mut loaded = HashMap::with_capacity(restored.len());
        let mut dropped = 0usize;

        for record in restored {
            if record.is_expired(now) {
                dropped += 1;
                continue;
            }
            let identity = record.identity(self.ctx.hasher.as_ref())?;
            let behind = self
                .tracker
                .current(&identity)
                .map_or(true, |entry| entry.sequence_number < record.sequence_number);
            if behind {
                self.tracker.commit(identity, record.sequence_number, record.expiration_timestamp);
            }
            loaded.insert(identity, Arc::new(record));
        }

        let count = loaded.len();
        *self.write() = loaded;
        if dropped > 0 {
            debug!(dropped, "Dropped expired records during restore");
        }
        crate::metrics::set_store_records(count);
        Ok(count)
    }

    fn check_expiration(&self, identity: &PayloadHash, expiration: u64, now: u64) -> StoreResult<()> {
        if expiration <= now {
            return Err(StoreError::ExpiredRecord {
                identity: *identity,
                expiration,
                now,
            });
        }
        let horizon = now.saturating_add(self.max_ttl.as_millis() as u64);
        if expiration > horizon {
            return Err(StoreError::InvalidRecord(format!(
                "{} expires at {}, beyond max ttl horizon {}",
                identity, expiration, horizon
            )));
        }
        Ok(())
    }

    fn verify(
        &self,
        identity: &PayloadHash,
        message: &[u8],
        signature: &[u8],
        owner: &OwnerKey,
    ) -> StoreResult<()> {
        self.ctx.verifier.verify(message, signature, owner).map_err(|err| match err {
            VerifyError::Mismatch => StoreError::InvalidSignature {
                identity: *identity,
                reason: err.to_string(),
            },
            VerifyError::MalformedKey(_) | VerifyError::MalformedSignature(_) => {
                StoreError::InvalidRecord(format!("{}: {}", identity, err))
            }
        })
    }

    fn cancel_pending(&self, identity: &PayloadHash) {
        let pending = self.pending.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(pending) = pending {
            if pending.cancel_pending(identity) {
                debug!(identity = %identity, "Pending broadcast withdrawn");
            }
        }
    }

    fn send_outbound(&self, mutation: OutboundMutation) {
        if let Some(outbound) = &self.outbound {
            if outbound.send(mutation).is_err() {
                debug!("Broadcast router stopped, outbound mutation dropped");
            }
        }
    }

    fn account(
        &self,
        op: &'static str,
        kind: PayloadKind,
        result: StoreResult<bool>,
    ) -> StoreResult<bool> {
        match &result {
            Ok(true) => {
                crate::metrics::mutation_accepted(op, kind.as_str());
                crate::metrics::set_store_records(self.len());
            }
            Ok(false) => {}
            Err(err) => {
                if let Some(reason) = err.rejection_reason() {
                    self.ctx.rejections.record(reason);
                }
                debug!(op, kind = %kind, error = %err, "Mutation rejected");
            }
        }
        result
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PayloadHash, Arc<ProtectedRecord>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PayloadHash, Arc<ProtectedRecord>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}
