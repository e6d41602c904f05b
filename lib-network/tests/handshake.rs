//! Two live nodes register each other through the REG / REG_VERIFY
//! double-connection handshake and then exchange chain messages.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use lib_network::message::{envelope, MSG_BLOCK, BLOCK_BROADCAST};
use lib_network::{start, NetworkEvent, NodeConfig, NodeHandle};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_node(port: u16) -> (NodeHandle, mpsc::UnboundedReceiver<NetworkEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = start(
        NodeConfig {
            host: "127.0.0.1".into(),
            port,
            max_passive_conn: 8,
            max_active_conn: 8,
        },
        events_tx,
    )
    .await
    .unwrap();

    (handle, events_rx)
}

async fn wait_registered(node: &NodeHandle) {
    timeout(Duration::from_secs(10), async {
        while node.registered_count() == 0 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("registration should complete");
}

#[tokio::test(flavor = "multi_thread")]
async fn nodes_register_and_exchange_messages() {
    let port_a = free_port().await;
    let port_b = free_port().await;

    let (node_a, _events_a) = spawn_node(port_a).await;
    let (node_b, mut events_b) = spawn_node(port_b).await;

    // A learns B's address; the connect loop does the rest
    node_a.add_known_peer("127.0.0.1", port_b);

    wait_registered(&node_a).await;
    wait_registered(&node_b).await;

    // a chain-level message flows A -> B and surfaces as an event
    let mut doc = envelope(MSG_BLOCK, BLOCK_BROADCAST);
    doc.insert("hash".into(), json!("test-payload"));
    node_a.broadcast(&Value::Object(doc));

    let event = timeout(Duration::from_secs(5), events_b.recv())
        .await
        .expect("no event within deadline")
        .expect("channel open");

    let NetworkEvent::PeerMessage { peer, doc } = event;
    assert_eq!(doc["msg_type"], MSG_BLOCK);
    assert_eq!(doc["hash"], "test-payload");
    assert_eq!(peer.key(), format!("127.0.0.1:{port_a}"));

    node_a.stop();
    node_b.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn banned_address_is_not_dialed() {
    let port_a = free_port().await;
    let port_b = free_port().await;

    let (node_a, _events_a) = spawn_node(port_a).await;
    let (node_b, _events_b) = spawn_node(port_b).await;

    // ban B first, then teach A its address: no registration may happen
    let key = format!("127.0.0.1:{port_b}");
    {
        // ban through the punish path of a synthetic handle
        let (peer, _out, _ctrl) = lib_network::PeerHandle::loopback(&key);
        node_a.punish(&peer);
    }
    node_a.add_known_peer("127.0.0.1", port_b);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(node_a.registered_count(), 0);
    assert!(node_a.is_banned(&key));

    node_a.stop();
    node_b.stop();
}
