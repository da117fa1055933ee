//! Data model shared by the mutable store, the append-only ledger and the router

pub mod hash;
pub mod payload;
pub mod record;

pub use hash::PayloadHash;
pub use payload::{
    Attachment, Direction, DisputeEntry, GenericProposal, LegacyAmount, LegacyTradeStatistics,
    OfferPayload, PayloadKind, PersistablePayload, PreferencesSnapshot, ProtectedPayload,
    TradeStatistics,
};
pub use record::{
    record_signing_bytes, removal_signing_bytes, OwnerKey, ProtectedRecord, RefreshRequest,
    RemovalRequest,
};
