//! Integration tests for the QUIC transport over loopback sockets.

use std::sync::Once;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use tradenet::{
    KeyRing, Keypair, NetworkMessage, NodeAddress, OwnedPayload, P2PService, QuicTransport,
    ServiceConfig, StorageEvent, Transport, TransportEvent,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback_transport() -> QuicTransport {
    QuicTransport::new(
        "127.0.0.1:0".parse().expect("socket address"),
        None,
        &Keypair::generate(),
    )
    .expect("transport")
}

async fn started(transport: &QuicTransport) -> (NodeAddress, mpsc::Receiver<TransportEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    transport.start(tx).await.expect("start");
    assert!(matches!(rx.recv().await, Some(TransportEvent::Ready)));
    let Some(TransportEvent::HiddenServicePublished(address)) = rx.recv().await else {
        panic!("expected published address");
    };
    (address, rx)
}

async fn next_message(
    rx: &mut mpsc::Receiver<TransportEvent>,
) -> (tradenet::ConnectionId, Option<NodeAddress>, NetworkMessage) {
    timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(TransportEvent::Message {
                    connection,
                    peer,
                    message,
                }) => return (connection, peer, message),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no message arrived")
}

#[tokio::test]
async fn message_and_reply_over_loopback() {
    init_tracing();
    let a = loopback_transport();
    let b = loopback_transport();
    let (_a_address, mut a_rx) = started(&a).await;
    let (b_address, mut b_rx) = started(&b).await;
    assert_eq!(b.local_address(), Some(b_address.clone()));
    assert!(b.bound_addr().is_some());

    let sent_on = a
        .send(&b_address, NetworkMessage::GetDataSet { nonce: 11 })
        .await
        .expect("send");
    let (connection, peer, message) = next_message(&mut b_rx).await;
    assert_eq!(peer, None);
    assert_eq!(message, NetworkMessage::GetDataSet { nonce: 11 });

    b.reply(
        connection,
        NetworkMessage::DataSet {
            request_nonce: 11,
            entries: Vec::new(),
        },
    )
    .await
    .expect("reply");
    let (reply_connection, peer, message) = next_message(&mut a_rx).await;
    assert_eq!(reply_connection, sent_on);
    assert_eq!(peer, Some(b_address.clone()));
    assert!(matches!(message, NetworkMessage::DataSet { request_nonce: 11, .. }));

    // the cached connection is reused
    let again = a
        .send(&b_address, NetworkMessage::GetDataSet { nonce: 12 })
        .await
        .expect("send");
    assert_eq!(again, sent_on);

    a.shutdown().await;
    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_fails() {
    init_tracing();
    let a = loopback_transport();
    let (_address, _rx) = started(&a).await;
    let result = a
        .send(
            &NodeAddress::new("nonexistent.invalid", 1),
            NetworkMessage::GetDataSet { nonce: 1 },
        )
        .await;
    assert!(result.is_err());
    a.shutdown().await;
}

#[tokio::test]
async fn services_bootstrap_and_replicate_over_quic() {
    init_tracing();
    let config = ServiceConfig {
        retry_delay_min: Duration::from_millis(10),
        retry_delay_max: Duration::from_millis(20),
        ..ServiceConfig::default()
    };

    let seed_keys = KeyRing::generate();
    let seed_transport =
        QuicTransport::new("127.0.0.1:0".parse().unwrap(), None, &seed_keys.signature).unwrap();
    let seed = P2PService::new(config.clone(), seed_keys, seed_transport, Vec::<NodeAddress>::new());
    seed.start().await.expect("seed start");
    let seed_address = seed.local_address().expect("seed address");

    let node_keys = KeyRing::generate();
    let node_pub = node_keys.pub_key_ring();
    let node_transport =
        QuicTransport::new("127.0.0.1:0".parse().unwrap(), None, &node_keys.signature).unwrap();
    let node = P2PService::new(config, node_keys, node_transport, vec![seed_address.clone()]);
    node.start().await.expect("node start");

    timeout(TEST_TIMEOUT, node.wait_for_authenticated())
        .await
        .expect("node authentication timed out")
        .expect("shut down");
    timeout(TEST_TIMEOUT, seed.wait_for_authenticated())
        .await
        .expect("seed authentication timed out")
        .expect("shut down");

    let mut seed_storage = seed.subscribe_storage();
    let payload = OwnedPayload {
        owner_pub_key: node_pub.signature_pub_key,
        ttl_ms: 60_000,
        data: b"quic offer".to_vec(),
        owner_address: None,
    };
    assert_eq!(node.add_data(payload), Ok(true));

    let event = timeout(TEST_TIMEOUT, seed_storage.recv())
        .await
        .expect("replication timed out")
        .expect("bus closed");
    assert!(matches!(event, StorageEvent::Added(_)));
    assert_eq!(seed.get_data_map().len(), 1);

    node.shut_down().await;
    seed.shut_down().await;
}
