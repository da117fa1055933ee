//! In-memory transports
//!
//! - `RecordingTransport`: a fixed peer list; every send is recorded. Sends
//!   can be held back to simulate a slow socket.
//! - `LoopbackNetwork`: connects several routers in one process. A send to a
//!   peer is delivered straight into that peer's `on_receive`.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::core_router::{BroadcastRouter, NetworkEnvelope, PeerId, PeerTransport, TransportError};

pub struct RecordingTransport {
    peers: Mutex<Vec<PeerId>>,
    sent: Mutex<Vec<(PeerId, NetworkEnvelope)>>,
    disconnected: Mutex<Vec<PeerId>>,
    gate: watch::Sender<bool>,
    progress: Notify,
}

impl RecordingTransport {
    pub fn with_peers(peers: &[&str]) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            peers: Mutex::new(peers.iter().map(|p| PeerId::new(*p)).collect()),
            sent: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            gate,
            progress: Notify::new(),
        }
    }

    /// Hold every send until `unblock_sends`
    pub fn block_sends(&self) {
        self.gate.send_replace(false);
    }

    pub fn unblock_sends(&self) {
        self.gate.send_replace(true);
    }

    pub fn sent(&self) -> Vec<(PeerId, NetworkEnvelope)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until at least `count` sends were recorded, or `limit` elapses
    pub async fn wait_for_sends(&self, count: usize, limit: Duration) {
        let _ = tokio::time::timeout(limit, async {
            loop {
                let notified = self.progress.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.sent.lock().unwrap_or_else(PoisonError::into_inner).len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn send(&self, peer: &PeerId, envelope: &NetworkEnvelope) -> Result<(), TransportError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if !self.peers.lock().unwrap_or_else(PoisonError::into_inner).contains(peer) {
            return Err(TransportError::NotConnected(peer.clone()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((peer.clone(), envelope.clone()));
        self.progress.notify_waiters();
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn disconnect(&self, peer: &PeerId) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p != peer);
        self.disconnected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(peer.clone());
    }
}

#[derive(Default)]
pub struct LoopbackNetwork {
    routers: Mutex<HashMap<PeerId, Weak<BroadcastRouter>>>,
    links: Mutex<BTreeSet<(PeerId, PeerId)>>,
    delivered: Mutex<usize>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node called `local`
    pub fn transport(self: &Arc<Self>, local: &str) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            local: PeerId::new(local),
            network: self.clone(),
        })
    }

    /// Make `router` reachable as `id`
    pub fn register(&self, id: &str, router: &Arc<BroadcastRouter>) {
        self.routers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(PeerId::new(id), Arc::downgrade(router));
    }

    /// Link two nodes in both directions
    pub fn connect(&self, a: &str, b: &str) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.insert((PeerId::new(a), PeerId::new(b)));
        links.insert((PeerId::new(b), PeerId::new(a)));
    }

    pub fn sever(&self, a: &str, b: &str) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links.remove(&(PeerId::new(a), PeerId::new(b)));
        links.remove(&(PeerId::new(b), PeerId::new(a)));
    }

    pub fn delivered(&self) -> usize {
        *self.delivered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn neighbours(&self, of: &PeerId) -> Vec<PeerId> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(from, _)| from == of)
            .map(|(_, to)| to.clone())
            .collect()
    }

    fn is_linked(&self, from: &PeerId, to: &PeerId) -> bool {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(from.clone(), to.clone()))
    }

    fn router(&self, id: &PeerId) -> Option<Arc<BroadcastRouter>> {
        self.routers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .and_then(Weak::upgrade)
    }
}

pub struct LoopbackTransport {
    local: PeerId,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, peer: &PeerId, envelope: &NetworkEnvelope) -> Result<(), TransportError> {
        if !self.network.is_linked(&self.local, peer) {
            return Err(TransportError::NotConnected(peer.clone()));
        }
        let router = self
            .network
            .router(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;

        *self
            .network
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        router.on_receive(&self.local, envelope.clone()).await;
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.network.neighbours(&self.local)
    }

    async fn disconnect(&self, peer: &PeerId) {
        self.network.sever(self.local.as_str(), peer.as_str());
        if let Some(router) = self.network.router(peer) {
            router.on_peer_disconnected(&self.local).await;
        }
    }
}
