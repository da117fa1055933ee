/*
    Store subsystem - replicated network data and its persistence
*/

use std::sync::Arc;

pub mod append_only;
pub mod claims;
pub mod errors;
pub mod migration;
pub mod mutable_store;
pub mod sequence_tracker;
pub mod snapshot;

pub use append_only::{AppendOnlyLedger, AppendOutcome};
pub use claims::{ClaimKey, ClaimRegistry};
pub use errors::{StoreError, StoreResult};
pub use mutable_store::{MutableRecordStore, OutboundMutation, PendingBroadcasts};
pub use sequence_tracker::{SequenceEntry, SequenceTracker, Verdict};
pub use snapshot::{PersistenceBridge, RestoreReport};

use super::clock::Clock;
use super::crypto::{ContentHasher, SignatureVerifier};
use super::listeners::ListenerHub;
use crate::metrics::RejectionCounters;

/// Capabilities shared by the stores
#[derive(Clone)]
pub struct StoreContext {
    pub verifier: Arc<dyn SignatureVerifier>,
    pub hasher: Arc<dyn ContentHasher>,
    pub clock: Arc<dyn Clock>,
    pub hub: Arc<ListenerHub>,
    pub rejections: Arc<RejectionCounters>,
}
