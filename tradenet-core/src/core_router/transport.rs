//! Peer connection capability consumed by the router
//!
//! The router never touches sockets. It sends through a `PeerTransport` and is
//! handed inbound envelopes through `BroadcastRouter::on_receive`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::envelope::NetworkEnvelope;

/// Opaque peer address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("Send to {peer} failed: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver one envelope to one peer
    async fn send(&self, peer: &PeerId, envelope: &NetworkEnvelope) -> Result<(), TransportError>;

    /// Peers currently reachable
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Drop the connection to a peer.
    ///
    /// Must not block on the consumer of transport events; the caller releases
    /// its own per-peer state.
    async fn disconnect(&self, peer: &PeerId);
}
