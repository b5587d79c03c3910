//! Two real nodes talking over localhost TCP.

use std::sync::Arc;
use std::time::Duration;

use junction_net::protocol::{CHAT_TOPIC, MIME_TEXT_PLAIN};
use junction_net::{
    Direction, FileAnnouncement, FileStore, NetworkError, NodeEvent, NodeHandle, PeerConfig,
    PeerNode,
};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("junction_net=debug")
        .with_test_writer()
        .try_init();
}

async fn start_node() -> (PeerNode, NodeHandle) {
    init_tracing();
    let config = PeerConfig {
        discovery_interval: Duration::from_millis(200),
        ..PeerConfig::local()
    };
    let node = PeerNode::new(config, Arc::new(FileStore::new())).unwrap();
    let handle = node.start().await.unwrap();
    (node, handle)
}

async fn listen_addr(handle: &NodeHandle) -> Multiaddr {
    timeout(TIMEOUT, async {
        loop {
            if let Some(addr) = handle.self_addresses().await.into_iter().next() {
                return addr.with(Protocol::P2p(handle.local_peer_id()));
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never reported a listen address")
}

/// Start two nodes and connect the second to the first.
async fn connected_pair() -> ((PeerNode, NodeHandle), (PeerNode, NodeHandle)) {
    let (node_a, a) = start_node().await;
    let (node_b, b) = start_node().await;
    let addr = listen_addr(&a).await;
    let peer = timeout(TIMEOUT, b.connect(addr)).await.unwrap().unwrap();
    assert_eq!(peer, a.local_peer_id());
    ((node_a, a), (node_b, b))
}

#[tokio::test]
async fn test_connect_reports_connection() {
    let (node_a, a) = start_node().await;
    let (node_b, b) = start_node().await;
    let mut events = b.subscribe_events();

    let addr = listen_addr(&a).await;
    b.connect(addr).await.unwrap();

    let opened = timeout(TIMEOUT, async {
        loop {
            if let Ok(NodeEvent::ConnectionOpened(conn)) = events.recv().await {
                return conn;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(opened.remote_peer, a.local_peer_id());
    assert_eq!(opened.direction, Direction::Outbound);
    assert!(opened.protocols().contains(&"tcp".to_string()));

    let connections = b.connections().await;
    assert!(connections
        .iter()
        .any(|c| c.remote_peer == a.local_peer_id()));

    assert!(b.disconnect(a.local_peer_id()).await.unwrap());
    let closed = timeout(TIMEOUT, async {
        loop {
            if let Ok(NodeEvent::ConnectionClosed(conn)) = events.recv().await {
                return conn;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closed.remote_peer, a.local_peer_id());

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_unreachable_address_fails() {
    let (node, handle) = start_node().await;
    let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
    let result = timeout(TIMEOUT, handle.connect(addr)).await.unwrap();
    assert!(matches!(result, Err(NetworkError::Dial { .. })));
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_over_connection_limit_fails() {
    let (node_a, a) = start_node().await;
    let config = PeerConfig {
        max_connections: 0,
        ..PeerConfig::local()
    };
    let node_b = PeerNode::new(config, Arc::new(FileStore::new())).unwrap();
    let b = node_b.start().await.unwrap();

    let addr = listen_addr(&a).await;
    let result = timeout(TIMEOUT, b.connect(addr)).await.unwrap();
    assert!(matches!(result, Err(NetworkError::Dial { .. })));
    assert!(b.connections().await.is_empty());

    node_b.stop().await.unwrap();
    node_a.stop().await.unwrap();
}

#[tokio::test]
async fn test_direct_message_exchange() {
    let ((node_a, a), (node_b, b)) = connected_pair().await;
    let mut inbox = a.direct_messages().subscribe();

    assert!(b.direct_messages().send(a.local_peer_id(), "hello").await);

    let msg = timeout(TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(msg.from, b.local_peer_id());
    assert_eq!(msg.mime_type, MIME_TEXT_PLAIN);
    assert_eq!(msg.data, "hello");

    // Receiving a direct message proves the sender speaks the protocol.
    assert!(a.direct_messages().is_dm_capable(&b.local_peer_id()).await);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_direct_message_to_unreachable_peer_returns_false() {
    let (node, handle) = start_node().await;
    assert!(!handle.direct_messages().send(PeerId::random(), "hello").await);
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_file_round_trip() {
    let ((node_a, a), (node_b, b)) = connected_pair().await;
    let body = b"file body bytes".to_vec();

    let record = a.files().offer("f1", body.clone()).await;
    assert_eq!(record.sender_peer, a.local_peer_id());

    let fetched = timeout(TIMEOUT, b.files().fetch(a.local_peer_id(), "f1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, body);

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_fetch_unknown_file_fails() {
    let ((node_a, a), (node_b, b)) = connected_pair().await;

    let result = timeout(TIMEOUT, b.files().fetch(a.local_peer_id(), "missing"))
        .await
        .unwrap();
    assert!(matches!(result, Err(NetworkError::FileNotFound { id }) if id == "missing"));

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_chat_and_file_announcement_broadcast() {
    let ((node_a, a), (node_b, b)) = connected_pair().await;
    let mut received = a.broadcast().subscribe();

    // Wait until the subscription exchange has reached b.
    timeout(TIMEOUT, async {
        loop {
            let receipt = b.broadcast().publish(CHAT_TOPIC, "hello all").await.unwrap();
            if receipt.recipient_count > 0 {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();

    let msg = timeout(TIMEOUT, received.recv()).await.unwrap().unwrap();
    assert_eq!(msg.topic, CHAT_TOPIC);
    assert_eq!(msg.text(), "hello all");
    assert_eq!(msg.origin_peer, Some(b.local_peer_id()));
    assert!(msg.signed);

    b.files().offer("f2", b"x".to_vec()).await;
    let announcement = timeout(TIMEOUT, async {
        loop {
            if let Ok(msg) = received.recv().await {
                if let Some(announcement) = FileAnnouncement::from_message(&msg) {
                    return announcement;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(announcement.id, "f2");
    assert_eq!(announcement.sender, b.local_peer_id());

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_records_become_discovery_events() {
    let (node_a, a) = start_node().await;
    let (node_b, b) = start_node().await;
    let mut events = b.subscribe_events();
    b.connect(listen_addr(&a).await).await.unwrap();

    let (peer_id, addresses) = timeout(TIMEOUT, async {
        loop {
            if let Ok(NodeEvent::PeerDiscovered { peer_id, addresses }) = events.recv().await {
                return (peer_id, addresses);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(peer_id, a.local_peer_id());
    assert!(!addresses.is_empty());

    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_without_peers_succeeds() {
    let (node, handle) = start_node().await;
    let receipt = handle.broadcast().publish(CHAT_TOPIC, "alone").await.unwrap();
    assert_eq!(receipt.recipient_count, 0);

    handle.broadcast().unsubscribe(CHAT_TOPIC).await.unwrap();
    handle.broadcast().unsubscribe(CHAT_TOPIC).await.unwrap();
    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_node_rejects_operations() {
    let (node, handle) = start_node().await;
    node.stop().await.unwrap();
    node.stop().await.unwrap();

    assert!(matches!(
        handle.broadcast().publish(CHAT_TOPIC, "late").await,
        Err(NetworkError::NotRunning)
    ));
    assert!(!handle.direct_messages().send(PeerId::random(), "late").await);
    assert!(handle.connections().await.is_empty());
}
