pub mod envelope;
pub mod metrics;
pub mod outbox;
pub mod peer_guard;
pub mod router;
pub mod scheduler;
pub mod seen_cache;
pub mod tcp;
pub mod transport;

pub use envelope::{
    BroadcastMessage, EnvelopeError, MessageType, NetworkEnvelope, SnapshotBatch,
    MAX_ENVELOPE_SIZE, PROTOCOL_VERSION,
};
pub use outbox::OutboxSet;
pub use peer_guard::{GuardVerdict, PeerGuard, PeerGuardConfig};
pub use router::{
    BroadcastRouter, DropReason, InboundOutcome, RouterConfig, RouterError, RouterResult,
};
pub use scheduler::{BroadcastScheduler, BroadcastState, DelayWindow};
pub use seen_cache::SeenCache;
pub use tcp::{TcpTransport, TransportEvent};
pub use transport::{PeerId, PeerTransport, TransportError};
