/*
    core_store - replicated, signed, expiring network state

    The data layer of a trading node. Handles:
    - Data model (protected payloads, immutable payloads, signed records)
    - Signature and content-hash capabilities
    - Sequence tracking and replay protection
    - Mutable and append-only stores
    - Ordered event fan-out to subscribers
    - Snapshot persistence
*/

pub mod clock;
pub mod crypto;
pub mod listeners;
pub mod model;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{Blake3Hasher, ContentHasher, Ed25519Signer, Ed25519Verifier, RecordSigner, SignatureVerifier};
pub use listeners::{ListenerHub, RemovalCause, StoreEvent, StoreListener, SubscriptionId};
pub use model::{PayloadHash, PayloadKind, PersistablePayload, ProtectedPayload, ProtectedRecord};
pub use store::{StoreError, StoreResult};
