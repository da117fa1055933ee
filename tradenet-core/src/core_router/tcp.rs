/*
  TcpTransport - length-prefixed envelopes over TCP

  Listens and dials plain TCP sockets. Each connection is split: the write
  half is kept for `send`, the read half gets a reader task that turns frames
  back into envelopes and reports them as events.

  Framing: 4-byte big-endian length prefix, then the bincode envelope.
  Frames above MAX_ENVELOPE_SIZE are treated as a protocol violation and the
  connection is closed.

  Outputs:
    TransportEvent::Connected(peer)          new inbound or outbound connection
    TransportEvent::Envelope(peer, envelope) decoded frame
    TransportEvent::DecodeError(peer, err)   frame that did not decode
    TransportEvent::Disconnected(peer)       connection closed by the remote
                                             side (not reported for `disconnect`)

  Peers are identified by their remote socket address.
*/

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::envelope::{EnvelopeError, NetworkEnvelope, MAX_ENVELOPE_SIZE};
use super::transport::{PeerId, PeerTransport, TransportError};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected(PeerId),
    Envelope(PeerId, NetworkEnvelope),
    DecodeError(PeerId, EnvelopeError),
    Disconnected(PeerId),
}

struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: AbortHandle,
}

pub struct TcpTransport {
    connections: StdMutex<HashMap<PeerId, Connection>>,
    listener: StdMutex<Option<AbortHandle>>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl TcpTransport {
    pub fn new(event_tx: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(TcpTransport {
            connections: StdMutex::new(HashMap::new()),
            listener: StdMutex::new(None),
            event_tx,
        })
    }

    /// Bind `addr` and accept connections in the background. Returns the bound address.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let transport = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, remote)) => {
                        let Some(transport) = transport.upgrade() else {
                            break;
                        };
                        transport.register(socket, PeerId::new(remote.to_string())).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        });

        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(addr = %local, "Listening for peers");
        Ok(local)
    }

    /// Connect to a peer
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<PeerId, TransportError> {
        let socket = TcpStream::connect(addr).await?;
        let peer = PeerId::new(socket.peer_addr()?.to_string());
        self.register(socket, peer.clone()).await;
        Ok(peer)
    }

    async fn register(self: &Arc<Self>, socket: TcpStream, peer: PeerId) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = socket.into_split();

        let transport = Arc::downgrade(self);
        let reader_peer = peer.clone();
        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            read_frames(read_half, &reader_peer, &event_tx).await;
            if let Some(transport) = transport.upgrade() {
                transport.forget(&reader_peer);
            }
            let _ = event_tx.send(TransportEvent::Disconnected(reader_peer)).await;
        });

        let previous = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                peer.clone(),
                Connection {
                    writer: Arc::new(Mutex::new(write_half)),
                    reader: reader.abort_handle(),
                },
            );
        if let Some(previous) = previous {
            previous.reader.abort();
        }

        if let Err(e) = self.event_tx.send(TransportEvent::Connected(peer.clone())).await {
            warn!(peer = %peer, error = %e, "Failed to send Connected event");
        }
    }

    fn forget(&self, peer: &PeerId) -> Option<Connection> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
    }

    /// Stop listening and close every connection
    pub fn close_all(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        let connections: Vec<Connection> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.reader.abort();
        }
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    peer: &PeerId,
    event_tx: &mpsc::Sender<TransportEvent>,
) {
    let mut len_buf = [0u8; 4];
    loop {
        if reader.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_ENVELOPE_SIZE {
            warn!(peer = %peer, len, "Oversized frame, closing connection");
            let _ = event_tx
                .send(TransportEvent::DecodeError(peer.clone(), EnvelopeError::TooLarge(len)))
                .await;
            return;
        }

        let mut frame = vec![0u8; len];
        if reader.read_exact(&mut frame).await.is_err() {
            return;
        }

        let event = match NetworkEnvelope::from_bytes(&frame) {
            Ok(envelope) => TransportEvent::Envelope(peer.clone(), envelope),
            Err(e) => TransportEvent::DecodeError(peer.clone(), e),
        };
        if event_tx.send(event).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn send(&self, peer: &PeerId, envelope: &NetworkEnvelope) -> Result<(), TransportError> {
        let writer = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|c| c.writer.clone())
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;

        let bytes = envelope.to_bytes().map_err(|e| TransportError::SendFailed {
            peer: peer.clone(),
            reason: e.to_string(),
        })?;

        // 4-byte length prefix + data
        let mut socket = writer.lock().await;
        socket.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        socket.write_all(&bytes).await?;
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    // The caller is usually the event consumer itself, so nothing here may wait
    // on the event channel. A writer held by an in-flight send closes once that
    // send's outbox worker is dropped.
    async fn disconnect(&self, peer: &PeerId) {
        if let Some(connection) = self.forget(peer) {
            connection.reader.abort();
            if let Ok(mut writer) = connection.writer.try_lock() {
                let _ = writer.shutdown().await;
            }
            debug!(peer = %peer, "Connection closed");
        }
    }
}
