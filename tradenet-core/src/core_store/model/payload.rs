/*
    Payloads - the data carried by network records

    Responsibilities:
    `payload.rs` defines the two payload families the node stores:
    - `ProtectedPayload`: owner-signed, mutable, expiring data (offers, disputes,
      proposals, preference snapshots)
    - `PersistablePayload`: append-only data with no owner (trade statistics)

    Both families carry an `Unknown` variant so payload kinds introduced by newer
    nodes are stored and relayed by older ones instead of failing decode.

    Canonical bytes:
    The identity of an append-only payload is the hash of its bincode encoding;
    mutable records also bind their owner key (see `record.rs`). Every map in a
    payload is a `BTreeMap` so the encoding is deterministic.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::hash::PayloadHash;
use crate::core_store::crypto::ContentHasher;
use crate::core_store::store::errors::{StoreError, StoreResult};

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// Offer side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

/// An open trade offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub offer_id: String,
    pub direction: Direction,
    pub base_currency: String,
    pub counter_currency: String,
    pub payment_method_id: String,
    /// Fixed price in the counter currency's smallest unit
    pub price: u64,
    pub amount: u64,
    pub min_amount: u64,
    pub use_market_based_price: bool,
    pub market_price_margin_bps: i64,
    pub creation_date: u64,
    pub owner_node_address: String,
}

/// File attached to a dispute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// A dispute opened by one side of a trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeEntry {
    pub trade_id: String,
    pub trader_id: u32,
    pub opener_is_buyer: bool,
    pub opening_date: u64,
    pub summary: String,
    pub attachments: Vec<Attachment>,
}

/// A governance proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericProposal {
    pub uid: String,
    pub name: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub node_address: String,
    pub creation_date: u64,
}

/// Preferences a node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesSnapshot {
    pub owner_id: String,
    pub preferred_currency: String,
    pub entries: BTreeMap<String, String>,
}

/// Payload of an owner-signed mutable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectedPayload {
    Offer(OfferPayload),
    DisputeEntry(DisputeEntry),
    GenericProposal(GenericProposal),
    PreferencesSnapshot(PreferencesSnapshot),
    /// Kind this node does not understand; stored and relayed opaquely
    Unknown { type_tag: String, bytes: Vec<u8> },
}

/// Discriminant of `ProtectedPayload`, used for TTLs, filtering and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PayloadKind {
    Offer,
    DisputeEntry,
    GenericProposal,
    PreferencesSnapshot,
    Unknown,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 5] = [
        PayloadKind::Offer,
        PayloadKind::DisputeEntry,
        PayloadKind::GenericProposal,
        PayloadKind::PreferencesSnapshot,
        PayloadKind::Unknown,
    ];

    /// TTL applied when this node publishes a record of this kind
    pub fn default_ttl(&self) -> Duration {
        match self {
            PayloadKind::Offer => Duration::from_secs(9 * MINUTE),
            PayloadKind::DisputeEntry => Duration::from_secs(10 * DAY),
            PayloadKind::GenericProposal => Duration::from_secs(30 * DAY),
            PayloadKind::PreferencesSnapshot => Duration::from_secs(30 * DAY),
            PayloadKind::Unknown => Duration::from_secs(DAY),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Offer => "offer",
            PayloadKind::DisputeEntry => "dispute",
            PayloadKind::GenericProposal => "proposal",
            PayloadKind::PreferencesSnapshot => "preferences",
            PayloadKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProtectedPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ProtectedPayload::Offer(_) => PayloadKind::Offer,
            ProtectedPayload::DisputeEntry(_) => PayloadKind::DisputeEntry,
            ProtectedPayload::GenericProposal(_) => PayloadKind::GenericProposal,
            ProtectedPayload::PreferencesSnapshot(_) => PayloadKind::PreferencesSnapshot,
            ProtectedPayload::Unknown { .. } => PayloadKind::Unknown,
        }
    }

    /// Structural checks that do not depend on the store state
    pub fn validate(&self) -> StoreResult<()> {
        match self {
            ProtectedPayload::Offer(offer) => {
                if offer.offer_id.is_empty() {
                    return Err(StoreError::InvalidRecord("offer without id".to_string()));
                }
                if offer.min_amount > offer.amount {
                    return Err(StoreError::InvalidRecord(format!(
                        "offer {} min amount {} exceeds amount {}",
                        offer.offer_id, offer.min_amount, offer.amount
                    )));
                }
            }
            ProtectedPayload::DisputeEntry(dispute) => {
                if dispute.trade_id.is_empty() {
                    return Err(StoreError::InvalidRecord("dispute without trade id".to_string()));
                }
            }
            ProtectedPayload::GenericProposal(proposal) => {
                if proposal.uid.is_empty() {
                    return Err(StoreError::InvalidRecord("proposal without uid".to_string()));
                }
            }
            ProtectedPayload::PreferencesSnapshot(prefs) => {
                if prefs.owner_id.is_empty() {
                    return Err(StoreError::InvalidRecord(
                        "preferences without owner id".to_string(),
                    ));
                }
            }
            ProtectedPayload::Unknown { type_tag, .. } => {
                if type_tag.is_empty() {
                    return Err(StoreError::InvalidRecord("unknown payload without tag".to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn canonical_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Amount wrapper used by the legacy statistics shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyAmount {
    pub value: u64,
}

/// Completed trade, as published by current nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub direction: Direction,
    pub base_currency: String,
    pub counter_currency: String,
    pub payment_method_id: String,
    pub offer_date: u64,
    pub use_market_based_price: bool,
    pub market_price_margin_bps: i64,
    pub offer_amount: u64,
    pub offer_min_amount: u64,
    pub offer_id: String,
    pub trade_price: u64,
    pub trade_amount: u64,
    pub trade_date: u64,
    pub deposit_tx_id: String,
    pub extra_data: BTreeMap<String, String>,
}

/// Completed trade in the shape published by older nodes.
///
/// Older nodes signed statistics with their own key. Only ever seen on the
/// wire: the ledger converts it to `TradeStatistics` before storing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTradeStatistics {
    pub direction: Direction,
    pub base_currency: String,
    pub counter_currency: String,
    pub offer_payment_method: String,
    pub offer_date: u64,
    pub offer_use_market_based_price: bool,
    pub offer_market_price_margin: i64,
    pub offer_amount: LegacyAmount,
    pub offer_min_amount: LegacyAmount,
    pub offer_id: String,
    pub trade_price: LegacyAmount,
    pub trade_amount: LegacyAmount,
    pub trade_date: u64,
    pub deposit_tx_id: String,
    pub owner_public_key: Vec<u8>,
    pub extra_data: Option<BTreeMap<String, String>>,
}

/// Payload of an immutable, append-only record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistablePayload {
    TradeStatistics(TradeStatistics),
    LegacyTradeStatistics(LegacyTradeStatistics),
    Unknown { type_tag: String, bytes: Vec<u8> },
}

impl PersistablePayload {
    pub fn is_legacy(&self) -> bool {
        matches!(self, PersistablePayload::LegacyTradeStatistics(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PersistablePayload::TradeStatistics(_) => "trade_statistics",
            PersistablePayload::LegacyTradeStatistics(_) => "legacy_trade_statistics",
            PersistablePayload::Unknown { .. } => "unknown",
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        match self {
            PersistablePayload::TradeStatistics(stats) => {
                if stats.offer_id.is_empty() {
                    return Err(StoreError::InvalidRecord(
                        "trade statistics without offer id".to_string(),
                    ));
                }
                if stats.trade_amount == 0 || stats.trade_price == 0 {
                    return Err(StoreError::InvalidRecord(format!(
                        "trade statistics for offer {} with zero price or amount",
                        stats.offer_id
                    )));
                }
                Ok(())
            }
            PersistablePayload::LegacyTradeStatistics(stats) => {
                if stats.offer_id.is_empty() {
                    return Err(StoreError::InvalidRecord(
                        "legacy trade statistics without offer id".to_string(),
                    ));
                }
                Ok(())
            }
            PersistablePayload::Unknown { type_tag, .. } => {
                if type_tag.is_empty() {
                    return Err(StoreError::InvalidRecord("unknown payload without tag".to_string()));
                }
                Ok(())
            }
        }
    }

    pub fn canonical_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn identity(&self, hasher: &dyn ContentHasher) -> StoreResult<PayloadHash> {
        Ok(hasher.hash(&self.canonical_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::crypto::Blake3Hasher;
    use crate::test_utils::fixtures::{offer_payload, trade_statistics};

    #[test]
    fn test_identity_stable_across_clones() {
        let payload = PersistablePayload::TradeStatistics(trade_statistics("offer-1", 1_000));
        let hasher = Blake3Hasher;

        let a = payload.identity(&hasher).unwrap();
        let b = payload.clone().identity(&hasher).unwrap();
        assert_eq!(a, b);

        let other = PersistablePayload::TradeStatistics(trade_statistics("offer-2", 1_000))
            .identity(&hasher)
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_kind_and_ttl() {
        assert_eq!(offer_payload("o").kind(), PayloadKind::Offer);
        assert_eq!(PayloadKind::Offer.default_ttl(), Duration::from_secs(540));
        assert_eq!(PayloadKind::DisputeEntry.default_ttl(), Duration::from_secs(10 * DAY));
        assert_eq!(PayloadKind::Unknown.default_ttl(), Duration::from_secs(DAY));
    }

    #[test]
    fn test_offer_validation() {
        let mut payload = offer_payload("offer-1");
        assert!(payload.validate().is_ok());

        if let ProtectedPayload::Offer(offer) = &mut payload {
            offer.min_amount = offer.amount + 1;
        }
        assert!(matches!(payload.validate(), Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_unknown_payload_round_trips() {
        let payload = ProtectedPayload::Unknown {
            type_tag: "future_kind".to_string(),
            bytes: vec![1, 2, 3],
        };
        let bytes = payload.canonical_bytes().unwrap();
        let decoded: ProtectedPayload = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(decoded.kind(), PayloadKind::Unknown);
    }

    #[test]
    fn test_trade_statistics_validation() {
        let good = PersistablePayload::TradeStatistics(trade_statistics("offer-1", 1_000));
        assert!(good.validate().is_ok());

        let mut stats = trade_statistics("offer-2", 1_000);
        stats.trade_amount = 0;
        let bad = PersistablePayload::TradeStatistics(stats);
        assert!(bad.validate().is_err());
    }
}
