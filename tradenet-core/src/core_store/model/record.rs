/*
    Records - signed envelopes around protected payloads

    Responsibilities:
    `record.rs` defines the owner-signed mutable record and the two requests that
    act on an existing record (removal and TTL refresh), together with the
    canonical byte strings each signature covers.

    Identity:
    A record's identity hashes its payload together with the owner key, so the
    same payload published under two keys yields two unrelated records and no
    key can claim, shadow or resurrect another key's record.

    Signed messages:
    - record:  "tradenet/record/v1" | identity | sequence_number | expiration_timestamp
    - removal: "tradenet/remove/v1" | identity | sequence_number

    A refresh is signed over the record message for the new sequence number and
    expiration, so a refreshed record is still self-verifying when it is later
    handed to a peer inside a snapshot.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use super::hash::PayloadHash;
use super::payload::{PayloadKind, ProtectedPayload};
use crate::core_store::crypto::{ContentHasher, RecordSigner};
use crate::core_store::store::errors::StoreResult;

const RECORD_DOMAIN: &[u8] = b"tradenet/record/v1";
const REMOVAL_DOMAIN: &[u8] = b"tradenet/remove/v1";

/// Public key bytes of a record owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey(pub Vec<u8>);

impl OwnerKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let end = self.0.len().min(8);
        write!(f, "{}", hex::encode(&self.0[..end]))
    }
}

impl From<Vec<u8>> for OwnerKey {
    fn from(bytes: Vec<u8>) -> Self {
        OwnerKey(bytes)
    }
}

/// Identity of the record `owner` publishes for `payload`
pub fn record_identity(
    payload: &ProtectedPayload,
    owner: &OwnerKey,
    hasher: &dyn ContentHasher,
) -> StoreResult<PayloadHash> {
    let bytes = bincode::serialize(&(payload, owner))?;
    Ok(hasher.hash(&bytes))
}

/// Bytes covered by a record or refresh signature
pub fn record_signing_bytes(
    identity: &PayloadHash,
    sequence_number: u64,
    expiration_timestamp: u64,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(RECORD_DOMAIN.len() + 32 + 16);
    bytes.extend_from_slice(RECORD_DOMAIN);
    bytes.extend_from_slice(identity.as_bytes());
    bytes.extend_from_slice(&sequence_number.to_be_bytes());
    bytes.extend_from_slice(&expiration_timestamp.to_be_bytes());
    bytes
}

/// Bytes covered by a removal signature
pub fn removal_signing_bytes(identity: &PayloadHash, sequence_number: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(REMOVAL_DOMAIN.len() + 32 + 8);
    bytes.extend_from_slice(REMOVAL_DOMAIN);
    bytes.extend_from_slice(identity.as_bytes());
    bytes.extend_from_slice(&sequence_number.to_be_bytes());
    bytes
}

/// Owner-signed mutable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRecord {
    pub payload: ProtectedPayload,
    pub owner_public_key: OwnerKey,
    pub sequence_number: u64,
    /// Unix milliseconds after which the record may be swept
    pub expiration_timestamp: u64,
    pub signature: Vec<u8>,
}

impl ProtectedRecord {
    /// Build and sign a record for `payload`
    pub fn sign(
        payload: ProtectedPayload,
        sequence_number: u64,
        expiration_timestamp: u64,
        signer: &dyn RecordSigner,
        hasher: &dyn ContentHasher,
    ) -> StoreResult<Self> {
        let owner_public_key = signer.public_key();
        let identity = record_identity(&payload, &owner_public_key, hasher)?;
        let signature =
            signer.sign(&record_signing_bytes(&identity, sequence_number, expiration_timestamp));

        Ok(Self {
            payload,
            owner_public_key,
            sequence_number,
            expiration_timestamp,
            signature,
        })
    }

    pub fn identity(&self, hasher: &dyn ContentHasher) -> StoreResult<PayloadHash> {
        record_identity(&self.payload, &self.owner_public_key, hasher)
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn signing_bytes(&self, identity: &PayloadHash) -> Vec<u8> {
        record_signing_bytes(identity, self.sequence_number, self.expiration_timestamp)
    }

    /// Expired at `now` (inclusive boundary)
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration_timestamp <= now
    }

    /// Copy of this record carrying a refreshed sequence, expiration and signature
    pub fn refreshed(&self, request: &RefreshRequest) -> Self {
        Self {
            payload: self.payload.clone(),
            owner_public_key: self.owner_public_key.clone(),
            sequence_number: request.sequence_number,
            expiration_timestamp: request.expiration_timestamp,
            signature: request.signature.clone(),
        }
    }
}

/// Signed request to delete a mutable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRequest {
    pub identity: PayloadHash,
    pub sequence_number: u64,
    pub owner_public_key: OwnerKey,
    pub signature: Vec<u8>,
}

impl RemovalRequest {
    pub fn sign(identity: PayloadHash, sequence_number: u64, signer: &dyn RecordSigner) -> Self {
        let signature = signer.sign(&removal_signing_bytes(&identity, sequence_number));
        Self {
            identity,
            sequence_number,
            owner_public_key: signer.public_key(),
            signature,
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        removal_signing_bytes(&self.identity, self.sequence_number)
    }
}

/// Signed request to extend the TTL of a mutable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub identity: PayloadHash,
    pub sequence_number: u64,
    pub expiration_timestamp: u64,
    pub signature: Vec<u8>,
}

impl RefreshRequest {
    pub fn sign(
        identity: PayloadHash,
        sequence_number: u64,
        expiration_timestamp: u64,
        signer: &dyn RecordSigner,
    ) -> Self {
        let signature =
            signer.sign(&record_signing_bytes(&identity, sequence_number, expiration_timestamp));
        Self {
            identity,
            sequence_number,
            expiration_timestamp,
            signature,
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        record_signing_bytes(&self.identity, self.sequence_number, self.expiration_timestamp)
    }
}
