/*
    Envelope - wire format of broadcast messages

    Every message between nodes is a `NetworkEnvelope`:
      protocol_version: u32 | message_type: u8 | payload: bytes

    The payload is the bincode encoding of the message body selected by the
    type byte:
      1 add-mutable         ProtectedRecord
      2 remove-mutable      RemovalRequest
      3 refresh-ttl         RefreshRequest
      4 add-immutable       PersistablePayload
      5 snapshot-response   SnapshotBatch

    Decoding is split in two steps so the router can reject an unknown version
    or type, and consult its seen cache, before paying for payload decoding.
*/

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_store::model::payload::PersistablePayload;
use crate::core_store::model::record::{ProtectedRecord, RefreshRequest, RemovalRequest};
use crate::metrics::RejectionReason;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded envelope size (16 MB, same bound as snapshot batches)
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Unknown protocol version {0}")]
    UnknownProtocolVersion(u32),

    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("Envelope too large: {0} bytes")]
    TooLarge(usize),
}

impl EnvelopeError {
    pub fn rejection_reason(&self) -> RejectionReason {
        match self {
            EnvelopeError::Malformed(_) | EnvelopeError::TooLarge(_) => {
                RejectionReason::MalformedEnvelope
            }
            EnvelopeError::UnknownProtocolVersion(_) => RejectionReason::UnknownProtocolVersion,
            EnvelopeError::UnknownMessageType(_) => RejectionReason::UnknownMessageType,
        }
    }
}

impl From<bincode::Error> for EnvelopeError {
    fn from(err: bincode::Error) -> Self {
        EnvelopeError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    AddMutable = 1,
    RemoveMutable = 2,
    RefreshTtl = 3,
    AddImmutable = 4,
    SnapshotResponse = 5,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AddMutable => "add_mutable",
            MessageType::RemoveMutable => "remove_mutable",
            MessageType::RefreshTtl => "refresh_ttl",
            MessageType::AddImmutable => "add_immutable",
            MessageType::SnapshotResponse => "snapshot_response",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::AddMutable),
            2 => Ok(MessageType::RemoveMutable),
            3 => Ok(MessageType::RefreshTtl),
            4 => Ok(MessageType::AddImmutable),
            5 => Ok(MessageType::SnapshotResponse),
            other => Err(EnvelopeError::UnknownMessageType(other)),
        }
    }
}

/// Initial data handed to a newly connected peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    pub protected: Vec<ProtectedRecord>,
    pub persistable: Vec<PersistablePayload>,
}

impl SnapshotBatch {
    pub fn len(&self) -> usize {
        self.protected.len() + self.persistable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMessage {
    AddMutable(ProtectedRecord),
    RemoveMutable(RemovalRequest),
    RefreshTtl(RefreshRequest),
    AddImmutable(PersistablePayload),
    SnapshotResponse(SnapshotBatch),
}

impl BroadcastMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            BroadcastMessage::AddMutable(_) => MessageType::AddMutable,
            BroadcastMessage::RemoveMutable(_) => MessageType::RemoveMutable,
            BroadcastMessage::RefreshTtl(_) => MessageType::RefreshTtl,
            BroadcastMessage::AddImmutable(_) => MessageType::AddImmutable,
            BroadcastMessage::SnapshotResponse(_) => MessageType::SnapshotResponse,
        }
    }

    pub fn to_envelope(&self) -> Result<NetworkEnvelope, EnvelopeError> {
        let payload = match self {
            BroadcastMessage::AddMutable(record) => bincode::serialize(record)?,
            BroadcastMessage::RemoveMutable(request) => bincode::serialize(request)?,
            BroadcastMessage::RefreshTtl(request) => bincode::serialize(request)?,
            BroadcastMessage::AddImmutable(payload) => bincode::serialize(payload)?,
            BroadcastMessage::SnapshotResponse(batch) => bincode::serialize(batch)?,
        };
        if payload.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge(payload.len()));
        }

        Ok(NetworkEnvelope {
            protocol_version: PROTOCOL_VERSION,
            message_type: self.message_type() as u8,
            payload,
        })
    }

    pub fn from_envelope(envelope: &NetworkEnvelope) -> Result<Self, EnvelopeError> {
        let message_type = envelope.header()?;
        let bytes = &envelope.payload;

        let message = match message_type {
            MessageType::AddMutable => BroadcastMessage::AddMutable(bincode::deserialize(bytes)?),
            MessageType::RemoveMutable => {
                BroadcastMessage::RemoveMutable(bincode::deserialize(bytes)?)
            }
            MessageType::RefreshTtl => BroadcastMessage::RefreshTtl(bincode::deserialize(bytes)?),
            MessageType::AddImmutable => {
                BroadcastMessage::AddImmutable(bincode::deserialize(bytes)?)
            }
            MessageType::SnapshotResponse => {
                BroadcastMessage::SnapshotResponse(bincode::deserialize(bytes)?)
            }
        };
        Ok(message)
    }
}

/// Versioned, typed frame around an encoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEnvelope {
    pub protocol_version: u32,
    pub message_type: u8,
    pub payload: Vec<u8>,
}

impl NetworkEnvelope {
    /// Validate version and type without decoding the payload
    pub fn header(&self) -> Result<MessageType, EnvelopeError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnknownProtocolVersion(self.protocol_version));
        }
        MessageType::try_from(self.message_type)
    }

    /// Loop-prevention digest: identical messages from any peer collide
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.protocol_version.to_be_bytes());
        hasher.update(&[self.message_type]);
        hasher.update(&self.payload);
        *hasher.finalize().as_bytes()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::TooLarge(bytes.len()));
        }
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn encoded_len(&self) -> usize {
        // u32 version + u8 type + u64 length prefix + payload
        4 + 1 + 8 + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::crypto::{Blake3Hasher, Ed25519Signer};
    use crate::core_store::model::hash::PayloadHash;
    use crate::test_utils::fixtures::{offer_payload, trade_statistics};

    fn add_message() -> BroadcastMessage {
        let signer = Ed25519Signer::generate();
        let record =
            ProtectedRecord::sign(offer_payload("offer-1"), 1, 10_000, &signer, &Blake3Hasher)
                .unwrap();
        BroadcastMessage::AddMutable(record)
    }

    #[test]
    fn test_envelope_round_trip() {
        let message = add_message();
        let envelope = message.to_envelope().unwrap();
        assert_eq!(envelope.message_type, 1);

        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(bytes.len(), envelope.encoded_len());
        let decoded = NetworkEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(BroadcastMessage::from_envelope(&decoded).unwrap(), message);
    }

    #[test]
    fn test_unknown_version_rejected_before_decode() {
        let mut envelope = add_message().to_envelope().unwrap();
        envelope.protocol_version = 99;
        envelope.payload = vec![0xde, 0xad];

        assert_eq!(
            BroadcastMessage::from_envelope(&envelope),
            Err(EnvelopeError::UnknownProtocolVersion(99))
        );
    }

    #[test]
    fn test_unknown_message_type() {
        let envelope = NetworkEnvelope {
            protocol_version: PROTOCOL_VERSION,
            message_type: 42,
            payload: vec![],
        };
        let err = BroadcastMessage::from_envelope(&envelope).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownMessageType(42));
        assert_eq!(err.rejection_reason(), RejectionReason::UnknownMessageType);
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let envelope = NetworkEnvelope {
            protocol_version: PROTOCOL_VERSION,
            message_type: MessageType::RemoveMutable as u8,
            payload: vec![1, 2, 3],
        };
        assert!(matches!(
            BroadcastMessage::from_envelope(&envelope),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(NetworkEnvelope::from_bytes(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_digest_distinguishes_type() {
        let removal = BroadcastMessage::RemoveMutable(RemovalRequest {
            identity: PayloadHash::from_bytes([1; 32]),
            sequence_number: 1,
            owner_public_key: vec![0u8; 32].into(),
            signature: vec![],
        });
        let envelope = removal.to_envelope().unwrap();
        let mut retyped = envelope.clone();
        retyped.message_type = MessageType::RefreshTtl as u8;

        assert_eq!(envelope.digest(), removal.to_envelope().unwrap().digest());
        assert_ne!(envelope.digest(), retyped.digest());
    }

    #[test]
    fn test_snapshot_batch_round_trip() {
        let batch = SnapshotBatch {
            protected: vec![],
            persistable: vec![PersistablePayload::TradeStatistics(trade_statistics("o", 1))],
        };
        let message = BroadcastMessage::SnapshotResponse(batch.clone());
        let decoded = BroadcastMessage::from_envelope(&message.to_envelope().unwrap()).unwrap();

        assert_eq!(decoded, BroadcastMessage::SnapshotResponse(batch));
        assert_eq!(decoded.message_type(), MessageType::SnapshotResponse);
    }
}
