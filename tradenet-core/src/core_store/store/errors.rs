/*
    errors.rs - Error types for the store subsystem

    Defines the errors raised by:
    - the mutable record store (signature, sequence, ownership, expiry checks)
    - the append-only ledger (duplicate claims)
    - the persistence bridge (snapshot write/restore)
*/

use thiserror::Error;

use crate::core_store::model::hash::PayloadHash;
use crate::metrics::collector::RejectionReason;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Signature did not verify against the owner key
    #[error("Invalid signature for {identity}: {reason}")]
    InvalidSignature { identity: PayloadHash, reason: String },

    /// Sequence number not above the tracked one
    #[error("Stale sequence for {identity}: candidate {candidate} <= stored {stored}")]
    StaleSequence {
        identity: PayloadHash,
        stored: u64,
        candidate: u64,
    },

    /// Another immutable record already claims the secondary key
    #[error("Duplicate claim on {key} (held by {existing})")]
    DuplicateImmutableClaim { key: String, existing: PayloadHash },

    /// Structurally invalid record or payload
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Mutation already expired on arrival
    #[error("Expired record {identity}: expired at {expiration}, now {now}")]
    ExpiredRecord {
        identity: PayloadHash,
        expiration: u64,
        now: u64,
    },

    /// Request key does not own the stored record
    #[error("Not owner of {0}")]
    NotOwner(PayloadHash),

    /// Snapshot could not be written
    #[error("Persistence write failure: {0}")]
    PersistenceWriteFailure(String),

    /// Snapshot exists but could not be read back
    #[error("Persistence read failure: {0}")]
    PersistenceReadFailure(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Rejection bucket this error is counted under, if it is an input rejection
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            StoreError::InvalidSignature { .. } => Some(RejectionReason::InvalidSignature),
            StoreError::StaleSequence { .. } => Some(RejectionReason::StaleSequence),
            StoreError::DuplicateImmutableClaim { .. } => Some(RejectionReason::DuplicateClaim),
            StoreError::InvalidRecord(_) | StoreError::Serialization(_) => {
                Some(RejectionReason::InvalidRecord)
            }
            StoreError::ExpiredRecord { .. } => Some(RejectionReason::ExpiredRecord),
            StoreError::NotOwner(_) => Some(RejectionReason::NotOwner),
            StoreError::PersistenceWriteFailure(_) | StoreError::PersistenceReadFailure(_) => None,
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
