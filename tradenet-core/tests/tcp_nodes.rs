/*
    tcp_nodes.rs - two nodes talking over real sockets on localhost
*/

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tradenet_core::config::Config;
use tradenet_core::core_node::{Collaborators, DataNode};
use tradenet_core::core_router::{TcpTransport, TransportEvent};
use tradenet_core::test_utils::{eventually, offer_payload, seeded_signer};

struct TcpPeer {
    node: Arc<DataNode>,
    transport: Arc<TcpTransport>,
    pump: JoinHandle<()>,
    _dir: TempDir,
}

async fn tcp_peer(name: &str) -> TcpPeer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.node.node_id = name.to_string();
    config.persistence.data_dir = dir.path().to_path_buf();
    config.statistics.republish_on_start = false;
    config.broadcast.min_delay = Duration::from_millis(1);
    config.broadcast.max_delay = Duration::from_millis(10);

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let transport = TcpTransport::new(event_tx);
    let node = Arc::new(DataNode::new(config, Collaborators::standard(transport.clone())));
    node.start().await.unwrap();

    let pump_node = node.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let router = pump_node.router();
            match event {
                TransportEvent::Connected(peer) => {
                    router.on_peer_connected(&peer).await.unwrap();
                }
                TransportEvent::Envelope(peer, envelope) => {
                    router.on_receive(&peer, envelope).await;
                }
                TransportEvent::DecodeError(peer, error) => {
                    router.on_decode_error(&peer, error).await;
                }
                TransportEvent::Disconnected(peer) => {
                    router.on_peer_disconnected(&peer).await;
                }
            }
        }
    });

    TcpPeer {
        node,
        transport,
        pump,
        _dir: dir,
    }
}

async fn stop(peer: TcpPeer) {
    peer.node.shutdown().await.unwrap();
    peer.transport.close_all();
    peer.pump.abort();
}

#[tokio::test]
async fn test_snapshot_then_live_updates_over_tcp() {
    let server = tcp_peer("server").await;
    let client = tcp_peer("client").await;
    let owner = seeded_signer(3);

    // Known before the client connects: arrives in the initial snapshot
    let early = server.node.add_local(offer_payload("offer-early"), &owner).unwrap();

    let addr = server.transport.listen("127.0.0.1:0").await.unwrap();
    client.transport.dial(&addr.to_string()).await.unwrap();

    assert!(eventually(Duration::from_secs(5), || client.node.store().contains(&early)).await);

    // Published afterwards: arrives through the regular broadcast
    let late = server.node.add_local(offer_payload("offer-late"), &owner).unwrap();
    assert!(eventually(Duration::from_secs(5), || client.node.store().contains(&late)).await);

    // And back the other way
    let reply = client.node.add_local(offer_payload("offer-reply"), &owner).unwrap();
    assert!(eventually(Duration::from_secs(5), || server.node.store().contains(&reply)).await);

    stop(client).await;
    stop(server).await;
}
