//! Integration tests for the P2PService public API.
//!
//! Every scenario runs several services on one in-process network so that
//! bootstrap, authentication, replication and mailbox delivery can be observed
//! end to end without sockets.

use std::sync::Once;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use tradenet::{
    AppMessage, BootstrapState, DirectMessage, KeyRing, MailboxMessage, MemoryNetwork,
    MemoryTransport, NetworkMessage, NodeAddress, OwnedPayload, P2PService, ProtectedEntry,
    PubKeyRing, SendOutcome, ServiceConfig, ServiceError, ServiceEvent, StorageEvent,
    Subscription, Transport, TransportEvent,
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

fn address(name: &str) -> NodeAddress {
    NodeAddress::new(format!("{}.onion", name), 9999)
}

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        retry_delay_min: Duration::from_millis(10),
        retry_delay_max: Duration::from_millis(20),
        authentication_timeout: Duration::from_secs(2),
        ..ServiceConfig::default()
    }
}

struct TestNode {
    service: P2PService<MemoryTransport>,
    keys: PubKeyRing,
    address: NodeAddress,
}

fn node(network: &MemoryNetwork, name: &str, seeds: Vec<NodeAddress>) -> TestNode {
    let key_ring = KeyRing::generate();
    let keys = key_ring.pub_key_ring();
    let transport = MemoryTransport::new(network.clone(), address(name));
    TestNode {
        service: P2PService::new(fast_config(), key_ring, transport, seeds),
        keys,
        address: address(name),
    }
}

async fn authenticated(node: &TestNode) {
    timeout(TEST_TIMEOUT, node.service.wait_for_authenticated())
        .await
        .expect("authentication timed out")
        .expect("service shut down");
}

/// Seed S plus two nodes bootstrapping from it, all authenticated.
async fn small_network() -> (MemoryNetwork, TestNode, TestNode, TestNode) {
    init_tracing();
    let network = MemoryNetwork::new();
    let seed = node(&network, "seed", vec![]);
    let alice = node(&network, "alice", vec![address("seed")]);
    let bob = node(&network, "bob", vec![address("seed")]);

    seed.service.start().await.expect("seed start");
    alice.service.start().await.expect("alice start");
    bob.service.start().await.expect("bob start");
    authenticated(&alice).await;
    authenticated(&bob).await;
    authenticated(&seed).await;
    knows_peers(&seed, &[&alice.address, &bob.address]).await;
    (network, seed, alice, bob)
}

/// Waits until `node` counts every address in `peers` as authenticated.
async fn knows_peers(node: &TestNode, peers: &[&NodeAddress]) {
    timeout(TEST_TIMEOUT, async {
        loop {
            let snapshot = node.service.network_snapshot().await.expect("snapshot");
            if peers
                .iter()
                .all(|p| snapshot.authenticated_peers.contains(*p))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers were not authenticated in time")
}

async fn next_matching<T, F>(subscription: &mut Subscription<T>, mut predicate: F) -> T
where
    F: FnMut(&T) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            let event = subscription.recv().await.expect("event bus closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

fn owned(owner: &PubKeyRing, data: &[u8]) -> OwnedPayload {
    OwnedPayload {
        owner_pub_key: owner.signature_pub_key,
        ttl_ms: 60_000,
        data: data.to_vec(),
        owner_address: None,
    }
}

#[tokio::test]
async fn unauthenticated_node_rejects_sends_and_mutations() {
    init_tracing();
    let network = MemoryNetwork::new();
    let lonely = node(&network, "lonely", vec![]);
    let mut lifecycle = lonely.service.start().await.expect("start");

    next_matching(&mut lifecycle, |e| matches!(e, ServiceEvent::HiddenServicePublished(_))).await;
    assert!(!lonely.service.is_authenticated());

    let peer = KeyRing::generate().pub_key_ring();
    let outcome = lonely
        .service
        .send_encrypted_mail_message(
            &address("someone"),
            &peer,
            AppMessage::Direct(DirectMessage { payload: b"hi".to_vec() }),
        )
        .await;
    assert_eq!(outcome, Err(ServiceError::NotAuthenticated));

    let outcome = lonely
        .service
        .send_encrypted_mailbox_message(
            &address("someone"),
            &peer,
            MailboxMessage::new(lonely.address.clone(), b"hi".to_vec()),
        )
        .await;
    assert_eq!(outcome, Err(ServiceError::NotAuthenticated));

    assert_eq!(
        lonely.service.add_data(owned(&lonely.keys, b"offer")),
        Err(ServiceError::NotAuthenticated)
    );
    assert!(lonely.service.transport().sent_messages().is_empty());
    assert!(lonely.service.get_data_map().is_empty());
}

#[tokio::test]
async fn zero_seed_nodes_reports_data_and_waits_for_peers() {
    init_tracing();
    let network = MemoryNetwork::new();
    let genesis = node(&network, "genesis", vec![]);
    let mut lifecycle = genesis.service.start().await.expect("start");

    next_matching(&mut lifecycle, |e| *e == ServiceEvent::RequestingDataCompleted).await;
    next_matching(&mut lifecycle, |e| *e == ServiceEvent::AllDataReceived).await;

    let state = timeout(
        TEST_TIMEOUT,
        genesis.service.wait_for_state(|s| s.local_ready),
    )
    .await
    .expect("timed out")
    .expect("shut down");
    assert!(state.data_received);
    assert!(!state.authenticated);
    assert_eq!(state.bootstrap, BootstrapState::Authenticating);
}

#[tokio::test]
async fn bootstrap_authenticates_both_sides() {
    let (_network, seed, alice, bob) = small_network().await;

    let snapshot = alice.service.network_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state.bootstrap, BootstrapState::Authenticated);
    assert_eq!(snapshot.connected_seed_nodes, vec![seed.address.clone()]);
    assert!(snapshot.authenticated_peers.contains(&seed.address));

    let seed_snapshot = seed.service.network_snapshot().await.expect("snapshot");
    assert!(seed_snapshot.authenticated_peers.contains(&alice.address));
    assert!(seed_snapshot.authenticated_peers.contains(&bob.address));
}

#[tokio::test]
async fn added_data_replicates_through_the_seed() {
    let (_network, seed, alice, bob) = small_network().await;
    let mut seed_storage = seed.service.subscribe_storage();
    let mut bob_storage = bob.service.subscribe_storage();

    assert_eq!(alice.service.add_data(owned(&alice.keys, b"offer-1")), Ok(true));
    assert_eq!(alice.service.get_data_map().len(), 1);

    next_matching(&mut seed_storage, |e| matches!(e, StorageEvent::Added(_))).await;
    let event = next_matching(&mut bob_storage, |e| matches!(e, StorageEvent::Added(_))).await;
    let StorageEvent::Added(ProtectedEntry::Data(data)) = event else {
        panic!("expected an owned entry");
    };
    assert_eq!(data.owner_pub_key, alice.keys.signature_pub_key);

    // only the owner may remove it
    assert_eq!(bob.service.remove_data(owned(&alice.keys, b"offer-1")), Ok(false));
    assert_eq!(alice.service.remove_data(owned(&alice.keys, b"offer-1")), Ok(true));
    next_matching(&mut bob_storage, |e| matches!(e, StorageEvent::Removed(_))).await;
    assert!(bob.service.get_data_map().is_empty());
}

#[tokio::test]
async fn direct_message_arrives_and_is_decrypted() {
    let (_network, _seed, alice, bob) = small_network().await;
    let mut bob_inbox = bob.service.subscribe_decrypted_direct();

    let outcome = alice
        .service
        .send_encrypted_mail_message(
            &bob.address,
            &bob.keys,
            AppMessage::Direct(DirectMessage { payload: b"bid 42".to_vec() }),
        )
        .await
        .expect("send");
    assert_eq!(outcome, SendOutcome::Arrived);

    let received = next_matching(&mut bob_inbox, |_| true).await;
    assert_eq!(received.peer, alice.address);
    assert_eq!(received.message.sender_pub_key, alice.keys.signature_pub_key);
    assert_eq!(received.message.message.payload(), b"bid 42");
}

#[tokio::test]
async fn mailbox_message_to_online_peer_is_delivered_directly() {
    let (_network, _seed, alice, bob) = small_network().await;
    let mut bob_inbox = bob.service.subscribe_decrypted_direct();

    let outcome = alice
        .service
        .send_encrypted_mailbox_message(
            &bob.address,
            &bob.keys,
            MailboxMessage::new(alice.address.clone(), b"trade accepted".to_vec()),
        )
        .await
        .expect("send");
    assert_eq!(outcome, SendOutcome::Arrived);

    let received = next_matching(&mut bob_inbox, |_| true).await;
    assert!(received.message.message.as_mailbox().is_some());
    assert!(alice.service.get_data_map().is_empty());
}

#[tokio::test]
async fn offline_receiver_gets_message_from_mailbox() {
    init_tracing();
    let network = MemoryNetwork::new();
    let seed = node(&network, "seed", vec![]);
    let alice = node(&network, "alice", vec![address("seed")]);
    let carol = node(&network, "carol", vec![address("seed")]);

    seed.service.start().await.expect("seed start");
    alice.service.start().await.expect("alice start");
    authenticated(&alice).await;
    knows_peers(&seed, &[&alice.address]).await;
    let mut seed_storage = seed.service.subscribe_storage();

    let message = MailboxMessage::new(alice.address.clone(), b"while you were away".to_vec());
    let uid = message.uid;
    let outcome = alice
        .service
        .send_encrypted_mailbox_message(&carol.address, &carol.keys, message)
        .await
        .expect("send");
    assert_eq!(outcome, SendOutcome::StoredInMailbox);
    next_matching(&mut seed_storage, |e| {
        matches!(e, StorageEvent::Added(ProtectedEntry::Mailbox(_)))
    })
    .await;

    // carol comes online and pulls the mailbox entry with the dataset
    let mut carol_mailbox = carol.service.subscribe_decrypted_mailbox();
    carol.service.start().await.expect("carol start");
    let received = next_matching(&mut carol_mailbox, |_| true).await;
    assert_eq!(received.sender, alice.address);
    assert_eq!(received.message.sender_pub_key, alice.keys.signature_pub_key);
    assert_eq!(received.message.message.as_mailbox().map(|m| m.uid), Some(uid));

    authenticated(&carol).await;
    knows_peers(&seed, &[&carol.address]).await;
    assert_eq!(
        carol.service.remove_entry_from_mailbox(&received.message).await,
        Ok(true)
    );
    next_matching(&mut seed_storage, |e| {
        matches!(e, StorageEvent::Removed(ProtectedEntry::Mailbox(_)))
    })
    .await;
    assert!(carol.service.get_data_map().is_empty());

    // a second removal finds nothing to remove
    assert_eq!(
        carol.service.remove_entry_from_mailbox(&received.message).await,
        Ok(false)
    );
}

#[tokio::test]
async fn direct_send_to_offline_peer_is_a_fault() {
    let (_network, _seed, alice, _bob) = small_network().await;
    let dave = KeyRing::generate().pub_key_ring();

    let outcome = alice
        .service
        .send_encrypted_mail_message(
            &address("dave"),
            &dave,
            AppMessage::Direct(DirectMessage { payload: vec![1, 2, 3] }),
        )
        .await
        .expect("send");
    assert!(matches!(outcome, SendOutcome::Fault(_)));
    assert!(alice.service.get_data_map().is_empty());
}

#[tokio::test]
async fn own_alias_in_seed_list_is_detected() {
    init_tracing();
    let network = MemoryNetwork::new();
    network.register_alias(address("mirror"), address("solo"));
    let solo = node(&network, "solo", vec![address("mirror")]);
    let mut messages = solo.service.subscribe_messages();
    let mut lifecycle = solo.service.start().await.expect("start");

    next_matching(&mut lifecycle, |e| *e == ServiceEvent::RequestingDataCompleted).await;
    let request = next_matching(&mut messages, |m| {
        matches!(m.message, NetworkMessage::GetDataSet { .. })
    })
    .await;
    assert!(request.peer.is_none());

    let state = timeout(TEST_TIMEOUT, solo.service.wait_for_state(|s| s.local_ready))
        .await
        .expect("timed out")
        .expect("shut down");
    assert!(state.data_received);

    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(inbound) = messages.try_recv() {
        assert!(
            !matches!(inbound.message, NetworkMessage::DataSet { .. }),
            "must not answer its own data request"
        );
    }
    assert_eq!(network.connection_count(), 0);
    let snapshot = solo.service.network_snapshot().await.expect("snapshot");
    assert!(snapshot.connected_seed_nodes.is_empty());
}

#[tokio::test]
async fn shut_down_is_idempotent_under_concurrency() {
    let (network, _seed, alice, _bob) = small_network().await;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let service = alice.service.clone();
            tokio::spawn(async move { service.shut_down().await })
        })
        .collect();
    for handle in handles {
        timeout(TEST_TIMEOUT, handle)
            .await
            .expect("shutdown timed out")
            .expect("shutdown task panicked");
    }
    alice.service.shut_down().await;

    assert!(alice.service.state().shut_down);
    assert!(!network.is_online(&alice.address));
    assert_eq!(
        alice.service.add_data(owned(&alice.keys, b"late")),
        Err(ServiceError::ShutDown)
    );
    assert!(alice.service.start().await.is_err());
    assert!(alice.service.network_snapshot().await.is_err());
}

#[tokio::test]
async fn oversized_application_payload_is_rejected() {
    let (_network, _seed, alice, bob) = small_network().await;
    let payload = vec![0u8; tradenet::MAX_APP_PAYLOAD_SIZE + 1];

    let outcome = alice
        .service
        .send_encrypted_mail_message(
            &bob.address,
            &bob.keys,
            AppMessage::Direct(DirectMessage { payload }),
        )
        .await;
    assert_eq!(
        outcome,
        Err(ServiceError::PayloadTooLarge(tradenet::MAX_APP_PAYLOAD_SIZE + 1))
    );
}

/// A bare transport on the network, without a service behind it.
async fn raw_endpoint(
    network: &MemoryNetwork,
    name: &str,
) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
    let transport = MemoryTransport::new(network.clone(), address(name));
    let (tx, rx) = mpsc::channel(64);
    transport.start(tx).await.expect("raw endpoint start");
    (transport, rx)
}

#[tokio::test]
async fn claiming_another_address_does_not_authenticate() {
    init_tracing();
    let network = MemoryNetwork::new();
    let genesis = node(&network, "genesis", vec![]);
    genesis.service.start().await.expect("start");
    timeout(TEST_TIMEOUT, genesis.service.wait_for_state(|s| s.local_ready))
        .await
        .expect("timed out")
        .expect("shut down");

    let (_honest, mut honest_events) = raw_endpoint(&network, "honest").await;
    let (impostor, _impostor_events) = raw_endpoint(&network, "impostor").await;

    impostor
        .send(
            &genesis.address,
            NetworkMessage::AuthenticationRequest {
                sender: address("honest"),
                nonce: 42,
            },
        )
        .await
        .expect("send");

    // the callback reaches the claimed address, not the impostor
    let challenge = timeout(TEST_TIMEOUT, async {
        loop {
            match honest_events.recv().await {
                Some(TransportEvent::Message {
                    message:
                        NetworkMessage::AuthenticationResponse {
                            requester_nonce: 42,
                            challenge,
                            ..
                        },
                    ..
                }) => return challenge,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no callback to the claimed address");

    impostor
        .send(
            &genesis.address,
            NetworkMessage::AuthenticationConfirm {
                sender: address("honest"),
                challenge: challenge.wrapping_add(1),
            },
        )
        .await
        .expect("send");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!genesis.service.is_authenticated());
    let snapshot = genesis.service.network_snapshot().await.expect("snapshot");
    assert!(snapshot.authenticated_peers.is_empty());
}

#[tokio::test]
async fn echoed_challenge_from_the_claimed_address_authenticates() {
    init_tracing();
    let network = MemoryNetwork::new();
    let genesis = node(&network, "genesis", vec![]);
    genesis.service.start().await.expect("start");
    timeout(TEST_TIMEOUT, genesis.service.wait_for_state(|s| s.local_ready))
        .await
        .expect("timed out")
        .expect("shut down");

    let (honest, mut honest_events) = raw_endpoint(&network, "honest").await;
    honest
        .send(
            &genesis.address,
            NetworkMessage::AuthenticationRequest {
                sender: address("honest"),
                nonce: 7,
            },
        )
        .await
        .expect("send");

    let challenge = timeout(TEST_TIMEOUT, async {
        loop {
            match honest_events.recv().await {
                Some(TransportEvent::Message {
                    message: NetworkMessage::AuthenticationResponse { challenge, .. },
                    ..
                }) => return challenge,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no callback to the claimed address");
    assert!(!genesis.service.is_authenticated());

    honest
        .send(
            &genesis.address,
            NetworkMessage::AuthenticationConfirm {
                sender: address("honest"),
                challenge,
            },
        )
        .await
        .expect("send");

    authenticated(&genesis).await;
    let snapshot = genesis.service.network_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.authenticated_peers, vec![address("honest")]);
}

#[tokio::test]
async fn mailbox_message_to_ourselves_is_refused() {
    let (_network, _seed, alice, _bob) = small_network().await;

    let outcome = alice
        .service
        .send_encrypted_mailbox_message(
            &alice.address,
            &alice.keys,
            MailboxMessage::new(alice.address.clone(), b"note to self".to_vec()),
        )
        .await
        .expect("send");
    assert!(matches!(outcome, SendOutcome::Fault(_)));

    // our own keys under another address are refused as well
    let outcome = alice
        .service
        .send_encrypted_mailbox_message(
            &address("elsewhere"),
            &alice.keys,
            MailboxMessage::new(alice.address.clone(), b"note to self".to_vec()),
        )
        .await
        .expect("send");
    assert!(matches!(outcome, SendOutcome::Fault(_)));
    assert!(alice.service.get_data_map().is_empty());
}
