//! # P2P Service Facade
//!
//! [`P2PService`] is the public entry point. It wires the protected data
//! store, the bootstrap coordinator, the authentication layer and the mailbox
//! inbox to a [`Transport`] and a [`CryptoService`].
//!
//! ## Architecture
//!
//! The handle is cheap to clone. All mutable service state lives in a single
//! private actor task which processes, one at a time:
//!
//! - commands from handles (authenticate a peer, remove a mailbox entry, ...)
//! - transport events (readiness, inbound messages, disconnects)
//! - internal notifications (completed sends, retry timers, store changes)
//! - a periodic maintenance tick (expiry, stale authentication attempts)
//!
//! Transport I/O never runs on the actor: every send is spawned and reports
//! back through the internal channel.
//!
//! ## Authentication Gate
//!
//! Until the first peer is authenticated, encrypted sends and store mutations
//! fail with [`ServiceError::NotAuthenticated`] and nothing is transmitted.
//!
//! ## Shutdown
//!
//! [`P2PService::shut_down`] is idempotent. Pending bootstrap retries are
//! cancelled, then the store, the authentication layer and the transport are
//! stopped, in that order. Every concurrent caller returns once the whole
//! sequence completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::auth::PeerAuthentication;
use crate::bootstrap::{
    BootstrapAction, BootstrapConfig, BootstrapCoordinator, BootstrapEvent, BootstrapState,
    DEFAULT_MIN_CONNECTED_SEED_NODES, DEFAULT_RETRY_DELAY_MAX, DEFAULT_RETRY_DELAY_MIN,
};
use crate::crypto::EncryptionService;
use crate::events::{
    DecryptedDirectMessage, DecryptedMailboxMessage, InboundMessage, ServiceEvent, ServiceEvents,
    StorageEvent, Subscription,
};
use crate::identity::{KeyRing, NodeAddress, PubKeyRing, PublicKeyBytes};
use crate::mailbox::{DEFAULT_RESOLVED_CAPACITY, Inbox, SendOutcome, open_sealed};
use crate::messages::{
    AppMessage, DecryptedMessageWithPubKey, MAX_APP_PAYLOAD_SIZE, MailboxMessage, MessageUid,
    NetworkMessage, PrefixedSealedMessage,
};
use crate::protocols::{ConnectionId, CryptoService, SeedNodeRepository, Transport, TransportEvent};
use crate::storage::{
    Broadcaster, MailboxPayload, OwnedPayload, PayloadHash, ProtectedDataStore, ProtectedEntry,
    ProtectedMailboxData, StoragePayload, StoreListener,
};

// ============================================================================
// Configuration
// ============================================================================

/// How long a send waits for an on-demand authentication.
pub const DEFAULT_AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the expiry sweep and stale-attempt cleanup.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Command channel capacity for the service actor.
const SERVICE_COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of the transport event channel.
const TRANSPORT_EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Seed nodes that must answer a dataset request before bootstrap stops asking.
    pub min_connected_seed_nodes: usize,
    /// Bounds of the randomized delay between seed node requests.
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
    pub authentication_timeout: Duration,
    pub maintenance_interval: Duration,
    /// Number of removed mailbox uids remembered to suppress duplicates.
    pub resolved_mailbox_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            min_connected_seed_nodes: DEFAULT_MIN_CONNECTED_SEED_NODES,
            retry_delay_min: DEFAULT_RETRY_DELAY_MIN,
            retry_delay_max: DEFAULT_RETRY_DELAY_MAX,
            authentication_timeout: DEFAULT_AUTHENTICATION_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            resolved_mailbox_capacity: DEFAULT_RESOLVED_CAPACITY,
        }
    }
}

impl ServiceConfig {
    fn bootstrap(&self) -> BootstrapConfig {
        BootstrapConfig {
            min_connected_seed_nodes: self.min_connected_seed_nodes,
            retry_delay_min: self.retry_delay_min,
            retry_delay_max: self.retry_delay_max,
        }
    }
}

// ============================================================================
// Errors and State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// No peer has been authenticated yet.
    NotAuthenticated,
    /// The local endpoint has no address yet.
    NotReady,
    /// The service was shut down.
    ShutDown,
    /// Application payload exceeds [`MAX_APP_PAYLOAD_SIZE`].
    PayloadTooLarge(usize),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NotAuthenticated => {
                write!(f, "not authenticated to any peer yet")
            }
            ServiceError::NotReady => write!(f, "local address not known yet"),
            ServiceError::ShutDown => write!(f, "service is shut down"),
            ServiceError::PayloadTooLarge(len) => write!(
                f,
                "payload of {} bytes exceeds {} bytes",
                len, MAX_APP_PAYLOAD_SIZE
            ),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Observable service state, published after every actor step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceState {
    pub bootstrap: BootstrapState,
    pub data_received: bool,
    pub local_ready: bool,
    pub authenticated: bool,
    pub shut_down: bool,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapState::Init,
            data_received: false,
            local_ready: false,
            authenticated: false,
            shut_down: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NetworkSnapshot {
    pub state: ServiceState,
    pub local_address: Option<NodeAddress>,
    pub connected_seed_nodes: Vec<NodeAddress>,
    pub authenticated_peers: Vec<NodeAddress>,
    pub stored_entries: usize,
    pub pending_mailbox_messages: usize,
}

// ============================================================================
// Actor Messages
// ============================================================================

enum Command {
    AuthenticatePeer(NodeAddress, oneshot::Sender<bool>),
    RemoveEntryFromMailbox(MessageUid, oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<NetworkSnapshot>),
    ShutDown(oneshot::Sender<()>),
}

enum Internal {
    DataRequestSent {
        target: NodeAddress,
        result: std::result::Result<ConnectionId, String>,
    },
    RetryDataRequest,
    AuthenticationRequestFailed {
        nonce: u64,
    },
    AuthenticationChallengeFailed {
        challenge: u64,
    },
    Broadcast {
        message: NetworkMessage,
        exclude: Option<NodeAddress>,
    },
    MailboxObserved(ProtectedMailboxData),
    MailboxRemoved(ProtectedMailboxData),
}

/// Forwards store propagation requests to the actor.
struct ActorBroadcaster {
    tx: mpsc::UnboundedSender<Internal>,
}

impl Broadcaster for ActorBroadcaster {
    fn broadcast(&self, message: NetworkMessage, exclude: Option<&NodeAddress>) {
        let _ = self.tx.send(Internal::Broadcast {
            message,
            exclude: exclude.cloned(),
        });
    }
}

/// Publishes store changes and hands mailbox entries to the actor.
struct StoreForwarder {
    events: Arc<ServiceEvents>,
    tx: mpsc::UnboundedSender<Internal>,
}

impl StoreListener for StoreForwarder {
    fn on_added(&self, entry: &ProtectedEntry) {
        self.events.storage.emit(StorageEvent::Added(entry.clone()));
        if let Some(mailbox) = entry.as_mailbox() {
            let _ = self.tx.send(Internal::MailboxObserved(mailbox.clone()));
        }
    }

    fn on_removed(&self, entry: &ProtectedEntry) {
        self.events.storage.emit(StorageEvent::Removed(entry.clone()));
        if let Some(mailbox) = entry.as_mailbox() {
            let _ = self.tx.send(Internal::MailboxRemoved(mailbox.clone()));
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct P2PService<T: Transport> {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ServiceState>,
    transport: Arc<T>,
    transport_events: mpsc::Sender<TransportEvent>,
    crypto: Arc<dyn CryptoService>,
    key_ring: KeyRing,
    store: Arc<ProtectedDataStore>,
    events: Arc<ServiceEvents>,
    config: ServiceConfig,
    started: Arc<AtomicBool>,
}

impl<T: Transport> Clone for P2PService<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_rx.clone(),
            transport: self.transport.clone(),
            transport_events: self.transport_events.clone(),
            crypto: self.crypto.clone(),
            key_ring: self.key_ring.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            started: self.started.clone(),
        }
    }
}

impl<T: Transport> P2PService<T> {
    /// Creates a service using [`EncryptionService`] over `key_ring`.
    /// Must be called within a tokio runtime.
    pub fn new(
        config: ServiceConfig,
        key_ring: KeyRing,
        transport: T,
        seed_nodes: impl SeedNodeRepository,
    ) -> Self {
        let crypto = Arc::new(EncryptionService::new(key_ring.clone()));
        Self::with_crypto(config, key_ring, transport, crypto, seed_nodes)
    }

    pub fn with_crypto(
        config: ServiceConfig,
        key_ring: KeyRing,
        transport: T,
        crypto: Arc<dyn CryptoService>,
        seed_nodes: impl SeedNodeRepository,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(SERVICE_COMMAND_CHANNEL_SIZE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transport_events, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ServiceState::default());

        let transport = Arc::new(transport);
        let events = Arc::new(ServiceEvents::default());
        let store = Arc::new(ProtectedDataStore::new(Arc::new(ActorBroadcaster {
            tx: internal_tx.clone(),
        })));
        store.add_listener(Arc::new(StoreForwarder {
            events: events.clone(),
            tx: internal_tx.clone(),
        }));

        let actor = ServiceActor {
            transport: transport.clone(),
            crypto: crypto.clone(),
            key_ring: key_ring.clone(),
            store: store.clone(),
            events: events.clone(),
            seed_nodes: Arc::new(seed_nodes),
            bootstrap: BootstrapCoordinator::new(config.bootstrap()),
            auth: PeerAuthentication::new(),
            inbox: Inbox::new(config.resolved_mailbox_capacity),
            config: config.clone(),
            rng: StdRng::from_entropy(),
            retry_task: None,
            state_tx,
            internal_tx,
            shut_down: false,
        };
        tokio::spawn(actor.run(cmd_rx, internal_rx, transport_rx));

        Self {
            cmd_tx,
            state_rx,
            transport,
            transport_events,
            crypto,
            key_ring,
            store,
            events,
            config,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribes a lifecycle listener and starts the transport.
    pub async fn start(&self) -> Result<Subscription<ServiceEvent>> {
        if self.state_rx.borrow().shut_down {
            bail!("service is shut down");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("service already started");
        }
        let lifecycle = self.events.lifecycle.subscribe();
        self.transport
            .start(self.transport_events.clone())
            .await
            .context("failed to start transport")?;
        info!(
            signature_key = %hex::encode(self.key_ring.signature.public_key_bytes()),
            "P2P service started"
        );
        Ok(lifecycle)
    }

    /// Stops the service. Safe to call repeatedly and concurrently.
    pub async fn shut_down(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ShutDown(tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn local_address(&self) -> Option<NodeAddress> {
        self.transport.local_address()
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        self.key_ring.pub_key_ring()
    }

    pub fn state(&self) -> ServiceState {
        self.state_rx.borrow().clone()
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.state_rx.borrow().bootstrap
    }

    pub fn is_authenticated(&self) -> bool {
        self.state_rx.borrow().authenticated
    }

    /// Waits until `predicate` holds for the published state.
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(&ServiceState) -> bool,
    ) -> std::result::Result<ServiceState, ServiceError> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|state| predicate(state) || state.shut_down)
            .await
            .map(|state| state.clone())
            .map_err(|_| ServiceError::ShutDown)?;
        Ok(state)
    }

    pub async fn wait_for_authenticated(&self) -> std::result::Result<(), ServiceError> {
        let state = self.wait_for_state(|s| s.authenticated).await?;
        if state.shut_down {
            return Err(ServiceError::ShutDown);
        }
        Ok(())
    }

    pub async fn network_snapshot(&self) -> std::result::Result<NetworkSnapshot, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| ServiceError::ShutDown)?;
        rx.await.map_err(|_| ServiceError::ShutDown)
    }

    pub fn get_data_map(&self) -> HashMap<PayloadHash, ProtectedEntry> {
        self.store.get_map()
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn subscribe_lifecycle(&self) -> Subscription<ServiceEvent> {
        self.events.lifecycle.subscribe()
    }

    pub fn subscribe_messages(&self) -> Subscription<InboundMessage> {
        self.events.messages.subscribe()
    }

    pub fn subscribe_decrypted_direct(&self) -> Subscription<DecryptedDirectMessage> {
        self.events.decrypted_direct.subscribe()
    }

    pub fn subscribe_decrypted_mailbox(&self) -> Subscription<DecryptedMailboxMessage> {
        self.events.decrypted_mailbox.subscribe()
    }

    pub fn subscribe_storage(&self) -> Subscription<StorageEvent> {
        self.events.storage.subscribe()
    }

    // ------------------------------------------------------------------------
    // Encrypted messaging
    // ------------------------------------------------------------------------

    fn ensure_authenticated(&self) -> std::result::Result<(), ServiceError> {
        let state = self.state_rx.borrow();
        if state.shut_down {
            return Err(ServiceError::ShutDown);
        }
        if !state.authenticated {
            return Err(ServiceError::NotAuthenticated);
        }
        Ok(())
    }

    /// Resolves to `true` once `peer` is authenticated, starting an attempt
    /// if needed.
    async fn authenticate_peer(&self, peer: &NodeAddress) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::AuthenticatePeer(peer.clone(), tx))
            .await
            .is_err()
        {
            return false;
        }
        matches!(
            tokio::time::timeout(self.config.authentication_timeout, rx).await,
            Ok(Ok(true))
        )
    }

    fn seal(
        &self,
        own_address: NodeAddress,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
        message: &AppMessage,
    ) -> std::result::Result<PrefixedSealedMessage, String> {
        self.crypto
            .seal_and_sign(peer_keys, message)
            .map(|sealed| PrefixedSealedMessage::new(own_address, sealed, peer))
            .map_err(|e| {
                error!(peer = %peer, error = %e, "failed to seal message");
                format!("failed to seal message: {}", e)
            })
    }

    fn prepare(&self, message: &AppMessage) -> std::result::Result<NodeAddress, ServiceError> {
        self.ensure_authenticated()?;
        let len = message.payload().len();
        if len > MAX_APP_PAYLOAD_SIZE {
            return Err(ServiceError::PayloadTooLarge(len));
        }
        self.transport.local_address().ok_or(ServiceError::NotReady)
    }

    /// Rejects messages addressed to this node, which would otherwise end up
    /// in our own mailbox.
    fn reject_self(
        &self,
        own_address: &NodeAddress,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
    ) -> Option<SendOutcome> {
        if own_address != peer && *peer_keys != self.key_ring.pub_key_ring() {
            return None;
        }
        warn!(peer = %peer, "refusing to send a message to ourselves");
        Some(SendOutcome::Fault("cannot send a message to ourselves".to_string()))
    }

    /// Sends a sealed message directly. There is no mailbox fallback.
    pub async fn send_encrypted_mail_message(
        &self,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
        message: AppMessage,
    ) -> std::result::Result<SendOutcome, ServiceError> {
        let own_address = self.prepare(&message)?;
        if let Some(fault) = self.reject_self(&own_address, peer, peer_keys) {
            return Ok(fault);
        }
        let prefixed = match self.seal(own_address, peer, peer_keys, &message) {
            Ok(prefixed) => prefixed,
            Err(reason) => return Ok(SendOutcome::Fault(reason)),
        };

        if !self.authenticate_peer(peer).await {
            debug!(peer = %peer, "direct message not sent, peer not authenticated");
            return Ok(SendOutcome::Fault(format!("could not authenticate {}", peer)));
        }
        match self.transport.send(peer, NetworkMessage::Sealed(prefixed)).await {
            Ok(_) => Ok(SendOutcome::Arrived),
            Err(e) => {
                debug!(peer = %peer, error = %e, "direct message send failed");
                Ok(SendOutcome::Fault(e.to_string()))
            }
        }
    }

    /// Sends a sealed message directly, or parks it in the receiver's mailbox
    /// if the direct route fails.
    pub async fn send_encrypted_mailbox_message(
        &self,
        peer: &NodeAddress,
        peer_keys: &PubKeyRing,
        message: MailboxMessage,
    ) -> std::result::Result<SendOutcome, ServiceError> {
        let message = AppMessage::Mailbox(message);
        let own_address = self.prepare(&message)?;
        if let Some(fault) = self.reject_self(&own_address, peer, peer_keys) {
            return Ok(fault);
        }
        let prefixed = match self.seal(own_address, peer, peer_keys, &message) {
            Ok(prefixed) => prefixed,
            Err(reason) => return Ok(SendOutcome::Fault(reason)),
        };

        if self.authenticate_peer(peer).await {
            match self
                .transport
                .send(peer, NetworkMessage::Sealed(prefixed.clone()))
                .await
            {
                Ok(_) => return Ok(SendOutcome::Arrived),
                Err(e) => {
                    info!(peer = %peer, error = %e, "direct send failed, storing in mailbox");
                }
            }
        } else {
            info!(peer = %peer, "peer not reachable, storing in mailbox");
        }

        Ok(self.store_in_mailbox(prefixed, peer_keys))
    }

    fn store_in_mailbox(&self, prefixed: PrefixedSealedMessage, peer_keys: &PubKeyRing) -> SendOutcome {
        let payload = MailboxPayload {
            sealed_message: prefixed,
            sender_storage_pub_key: self.key_ring.signature.public_key_bytes(),
            receiver_storage_pub_key: peer_keys.signature_pub_key,
        };
        let data = match self.store.get_mailbox_data_with_signed_seq_nr(
            payload,
            &self.key_ring.signature,
            peer_keys.signature_pub_key,
        ) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "failed to sign mailbox entry");
                return SendOutcome::Fault(format!("failed to sign mailbox entry: {}", e));
            }
        };
        if self.store.add_mailbox_data(data, None) {
            SendOutcome::StoredInMailbox
        } else {
            SendOutcome::Fault("data already exists in our local database".to_string())
        }
    }

    /// Removes a received mailbox message from the replicated store.
    pub async fn remove_entry_from_mailbox(
        &self,
        decrypted: &DecryptedMessageWithPubKey,
    ) -> std::result::Result<bool, ServiceError> {
        self.ensure_authenticated()?;
        let Some(mailbox) = decrypted.message.as_mailbox() else {
            return Ok(false);
        };
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RemoveEntryFromMailbox(mailbox.uid, tx))
            .await
            .map_err(|_| ServiceError::ShutDown)?;
        Ok(rx.await.unwrap_or(false))
    }

    // ------------------------------------------------------------------------
    // Store mutations
    // ------------------------------------------------------------------------

    pub fn add_data(&self, payload: OwnedPayload) -> std::result::Result<bool, ServiceError> {
        self.ensure_authenticated()?;
        match self
            .store
            .get_data_with_signed_seq_nr(StoragePayload::Owned(payload), &self.key_ring.signature)
        {
            Ok(data) => Ok(self.store.add(data, None)),
            Err(e) => {
                error!(error = %e, "failed to sign data");
                Ok(false)
            }
        }
    }

    pub fn remove_data(&self, payload: OwnedPayload) -> std::result::Result<bool, ServiceError> {
        self.ensure_authenticated()?;
        match self
            .store
            .get_data_with_signed_seq_nr(StoragePayload::Owned(payload), &self.key_ring.signature)
        {
            Ok(data) => Ok(self.store.remove(data, None)),
            Err(e) => {
                error!(error = %e, "failed to sign data removal");
                Ok(false)
            }
        }
    }

    pub fn add_mailbox_data(
        &self,
        payload: MailboxPayload,
        receiver_pub_key: PublicKeyBytes,
    ) -> std::result::Result<bool, ServiceError> {
        self.ensure_authenticated()?;
        match self.store.get_mailbox_data_with_signed_seq_nr(
            payload,
            &self.key_ring.signature,
            receiver_pub_key,
        ) {
            Ok(data) => Ok(self.store.add_mailbox_data(data, None)),
            Err(e) => {
                error!(error = %e, "failed to sign mailbox data");
                Ok(false)
            }
        }
    }

    pub fn remove_mailbox_data(
        &self,
        payload: MailboxPayload,
        receiver_pub_key: PublicKeyBytes,
    ) -> std::result::Result<bool, ServiceError> {
        self.ensure_authenticated()?;
        match self.store.get_mailbox_data_with_signed_seq_nr(
            payload,
            &self.key_ring.signature,
            receiver_pub_key,
        ) {
            Ok(data) => Ok(self.store.remove_mailbox_data(data, None)),
            Err(e) => {
                error!(error = %e, "failed to sign mailbox removal");
                Ok(false)
            }
        }
    }

    /// Extends the lifetime of an owned entry we published.
    pub fn refresh_ttl(&self, payload: OwnedPayload) -> std::result::Result<bool, ServiceError> {
        self.ensure_authenticated()?;
        match self
            .store
            .get_refresh_ttl_message(&StoragePayload::Owned(payload), &self.key_ring.signature)
        {
            Ok(message) => Ok(self.store.refresh_ttl(message, None)),
            Err(e) => {
                error!(error = %e, "failed to sign ttl refresh");
                Ok(false)
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for P2PService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PService")
            .field("local_address", &self.transport.local_address())
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct ServiceActor<T: Transport> {
    transport: Arc<T>,
    crypto: Arc<dyn CryptoService>,
    key_ring: KeyRing,
    store: Arc<ProtectedDataStore>,
    events: Arc<ServiceEvents>,
    seed_nodes: Arc<dyn SeedNodeRepository>,
    config: ServiceConfig,
    bootstrap: BootstrapCoordinator,
    auth: PeerAuthentication,
    inbox: Inbox,
    rng: StdRng,
    retry_task: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ServiceState>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    shut_down: bool,
}

impl<T: Transport> ServiceActor<T> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        maintenance.tick().await; // Skip initial tick

        loop {
            // internal notifications first: completions of our own sends are
            // applied before transport events they may have caused
            tokio::select! {
                biased;
                Some(internal) = internal_rx.recv() => {
                    self.handle_internal(internal);
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // every handle dropped
                        self.shut_down_components().await;
                        break;
                    };
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(event) = transport_rx.recv() => {
                    self.handle_transport_event(event);
                }
                _ = maintenance.tick() => {
                    self.maintain();
                }
            }
        }
        debug!("service actor stopped");
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(ServiceState {
            bootstrap: self.bootstrap.state(),
            data_received: self.bootstrap.is_data_received(),
            local_ready: self.bootstrap.is_local_ready(),
            authenticated: self.bootstrap.is_authenticated(),
            shut_down: self.shut_down,
        });
    }

    /// Returns `true` when the actor must stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AuthenticatePeer(peer, reply) => {
                if self.shut_down {
                    let _ = reply.send(false);
                } else if self.auth.is_authenticated(&peer) {
                    let _ = reply.send(true);
                } else {
                    match self.transport.local_address() {
                        Some(own) if own != peer => {
                            self.auth.add_waiter(&peer, reply);
                            self.start_authentication(&peer);
                        }
                        _ => {
                            let _ = reply.send(false);
                        }
                    }
                }
                false
            }
            Command::RemoveEntryFromMailbox(uid, reply) => {
                let removed = !self.shut_down && self.remove_entry_from_mailbox(uid);
                let _ = reply.send(removed);
                false
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(NetworkSnapshot {
                    state: self.state_tx.borrow().clone(),
                    local_address: self.transport.local_address(),
                    connected_seed_nodes: self.bootstrap.connected_seed_nodes().to_vec(),
                    authenticated_peers: self.auth.authenticated_peers(),
                    stored_entries: self.store.len(),
                    pending_mailbox_messages: self.inbox.len(),
                });
                false
            }
            Command::ShutDown(reply) => {
                self.shut_down_components().await;
                let _ = reply.send(());
                true
            }
        }
    }

    async fn shut_down_components(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("shutting down P2P service");

        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.store.shut_down();
        self.auth.shut_down();
        self.transport.shutdown().await;

        self.publish_state();
        info!("P2P service shut down");
    }

    fn maintain(&mut self) {
        if self.shut_down {
            return;
        }
        self.store.remove_expired();
        let expired = self.auth.expire_pending(self.config.authentication_timeout);
        if expired > 0 {
            debug!(expired, "expired stale authentication attempts");
        }
    }

    // ------------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------------

    fn apply(&mut self, event: BootstrapEvent) {
        let actions = self.bootstrap.handle(event, &mut self.rng);
        for action in actions {
            self.execute(action);
        }
        self.publish_state();
    }

    fn execute(&mut self, action: BootstrapAction) {
        match action {
            BootstrapAction::SendDataRequest { target, nonce } => {
                debug!(seed = %target, "requesting data set");
                let transport = self.transport.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = transport
                        .send(&target, NetworkMessage::GetDataSet { nonce })
                        .await
                        .map_err(|e| e.to_string());
                    let _ = tx.send(Internal::DataRequestSent { target, result });
                });
            }
            BootstrapAction::ScheduleRetry(delay) => {
                trace!(delay_ms = delay.as_millis() as u64, "scheduling next seed node request");
                if let Some(previous) = self.retry_task.take() {
                    previous.abort();
                }
                let tx = self.internal_tx.clone();
                self.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Internal::RetryDataRequest);
                }));
            }
            BootstrapAction::DataReceived => {
                info!(entries = self.store.len(), "requesting data completed");
                self.events.lifecycle.emit(ServiceEvent::RequestingDataCompleted);
            }
            BootstrapAction::AllDataReceived => {
                self.events.lifecycle.emit(ServiceEvent::AllDataReceived);
            }
            BootstrapAction::NoSeedNodeAvailable => {
                self.events.lifecycle.emit(ServiceEvent::NoSeedNodeAvailable);
            }
            BootstrapAction::Authenticate(peers) => {
                for peer in peers {
                    self.start_authentication(&peer);
                }
            }
            BootstrapAction::Authenticated => {
                self.store.set_authenticated(true);
                self.events.lifecycle.emit(ServiceEvent::Authenticated);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    fn start_authentication(&mut self, peer: &NodeAddress) {
        let Some(own) = self.transport.local_address() else {
            return;
        };
        if &own == peer {
            return;
        }
        let Some(nonce) = self.auth.begin(peer, &mut self.rng) else {
            return;
        };
        debug!(peer = %peer, "authenticating");
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let request = NetworkMessage::AuthenticationRequest { sender: own, nonce };
            if let Err(e) = transport.send(&peer, request).await {
                debug!(peer = %peer, error = %e, "authentication request failed");
                let _ = tx.send(Internal::AuthenticationRequestFailed { nonce });
            }
        });
    }

    fn on_peer_authenticated(&mut self, peer: NodeAddress) {
        self.apply(BootstrapEvent::PeerAuthenticated(peer));
    }

    // ------------------------------------------------------------------------
    // Mailbox
    // ------------------------------------------------------------------------

    fn observe_mailbox_entry(&mut self, entry: &ProtectedMailboxData) {
        let Some(own) = self.transport.local_address() else {
            return;
        };
        if let Some((message, sender)) = self.inbox.observe(self.crypto.as_ref(), &own, entry) {
            self.events
                .decrypted_mailbox
                .emit(DecryptedMailboxMessage { message, sender });
        }
    }

    fn rescan_mailbox(&mut self) {
        for entry in self.store.entries() {
            if let ProtectedEntry::Mailbox(mailbox) = entry {
                self.observe_mailbox_entry(&mailbox);
            }
        }
    }

    fn remove_entry_from_mailbox(&mut self, uid: MessageUid) -> bool {
        let Some(entry) = self.inbox.get(&uid).cloned() else {
            debug!(uid = %uid, "no decrypted mailbox entry for uid");
            return false;
        };
        let own_key = self.key_ring.signature.public_key_bytes();
        if entry.receiver_pub_key != own_key {
            error!(uid = %uid, "mailbox entry is not addressed to our signature key");
            return false;
        }
        let Some(payload) = entry.mailbox_payload().cloned() else {
            return false;
        };

        match self
            .store
            .get_mailbox_data_with_signed_seq_nr(payload, &self.key_ring.signature, own_key)
        {
            Ok(removal) => {
                let removed = self.store.remove_mailbox_data(removal, None);
                if removed {
                    debug!(uid = %uid, "mailbox entry removed");
                    self.inbox.resolve(uid);
                }
                removed
            }
            Err(e) => {
                error!(uid = %uid, error = %e, "failed to sign mailbox removal");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internal notifications
    // ------------------------------------------------------------------------

    fn handle_internal(&mut self, internal: Internal) {
        if self.shut_down {
            return;
        }
        match internal {
            Internal::DataRequestSent { target, result } => match result {
                Ok(_) => self.apply(BootstrapEvent::RequestSent(target)),
                Err(e) => {
                    debug!(seed = %target, error = %e, "data set request failed");
                    self.apply(BootstrapEvent::RequestFailed(target));
                }
            },
            Internal::RetryDataRequest => {
                self.retry_task = None;
                self.apply(BootstrapEvent::RetryTimerElapsed);
            }
            Internal::AuthenticationRequestFailed { nonce } => {
                self.auth.on_failed(nonce);
            }
            Internal::AuthenticationChallengeFailed { challenge } => {
                self.auth.on_challenge_failed(challenge);
            }
            Internal::Broadcast { message, exclude } => {
                let peers: Vec<NodeAddress> = self
                    .auth
                    .authenticated_peers()
                    .into_iter()
                    .filter(|peer| Some(peer) != exclude.as_ref())
                    .collect();
                trace!(kind = message.kind(), peers = peers.len(), "broadcasting");
                for peer in peers {
                    let transport = self.transport.clone();
                    let message = message.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.send(&peer, message).await {
                            debug!(peer = %peer, error = %e, "broadcast send failed");
                        }
                    });
                }
            }
            Internal::MailboxObserved(entry) => {
                self.observe_mailbox_entry(&entry);
            }
            Internal::MailboxRemoved(entry) => {
                if let Some(uid) = self.inbox.forget(&entry) {
                    debug!(uid = %uid, "mailbox entry left the store");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.shut_down {
            return;
        }
        match event {
            TransportEvent::Ready => {
                info!("transport ready");
                self.events.lifecycle.emit(ServiceEvent::TransportReady);
                let local_address = self.transport.local_address();
                let seed_nodes = self.seed_nodes.seed_node_addresses();
                self.apply(BootstrapEvent::TransportReady {
                    local_address,
                    seed_nodes,
                });
            }
            TransportEvent::HiddenServicePublished(address) => {
                info!(address = %address, "local endpoint published");
                self.events
                    .lifecycle
                    .emit(ServiceEvent::HiddenServicePublished(address));
                self.rescan_mailbox();
                self.apply(BootstrapEvent::LocalReady);
            }
            TransportEvent::SetupFailed(reason) => {
                error!(reason = %reason, "transport setup failed");
                self.events.lifecycle.emit(ServiceEvent::SetupFailed(reason));
            }
            TransportEvent::Connected { connection, peer } => {
                trace!(connection = %connection, peer = ?peer, "connection opened");
            }
            TransportEvent::Message {
                connection,
                peer,
                message,
            } => {
                trace!(connection = %connection, kind = message.kind(), "message received");
                self.events.messages.emit(InboundMessage {
                    connection,
                    peer: peer.clone(),
                    message: message.clone(),
                });
                self.handle_message(connection, peer, message);
            }
            TransportEvent::Disconnected {
                connection,
                peer,
                intended,
            } => {
                let lost = self.auth.on_disconnect(connection, peer.as_ref());
                if !intended && let Some(peer) = lost.as_ref().or(peer.as_ref()) {
                    self.store.on_peer_disconnected(peer);
                }
            }
        }
    }

    fn handle_message(
        &mut self,
        connection: ConnectionId,
        peer: Option<NodeAddress>,
        message: NetworkMessage,
    ) {
        match message {
            NetworkMessage::GetDataSet { nonce } => {
                if self.bootstrap.is_own_nonce(nonce) {
                    warn!(connection = %connection, "received our own data request, closing loopback connection");
                    let transport = self.transport.clone();
                    tokio::spawn(async move { transport.close(connection).await });
                    self.apply(BootstrapEvent::LoopbackDetected { nonce });
                    return;
                }
                let entries = self.store.entries();
                debug!(connection = %connection, entries = entries.len(), "serving data set");
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let reply = NetworkMessage::DataSet {
                        request_nonce: nonce,
                        entries,
                    };
                    if let Err(e) = transport.reply(connection, reply).await {
                        debug!(connection = %connection, error = %e, "failed to send data set");
                    }
                });
            }
            NetworkMessage::DataSet {
                request_nonce,
                entries,
            } => {
                if !self.bootstrap.is_own_nonce(request_nonce) {
                    debug!(connection = %connection, "ignoring unsolicited data set");
                    return;
                }
                let mailbox_entries: Vec<ProtectedMailboxData> = entries
                    .iter()
                    .filter_map(|entry| entry.as_mailbox().cloned())
                    .collect();
                self.store.merge(entries, peer.as_ref());
                for entry in &mailbox_entries {
                    self.observe_mailbox_entry(entry);
                }
                if let Some(seed) = peer {
                    // the reply can overtake the send completion
                    self.apply(BootstrapEvent::RequestSent(seed));
                }
                self.apply(BootstrapEvent::DataSetReceived);
            }
            NetworkMessage::AuthenticationRequest { sender, nonce } => {
                let Some(own) = self.transport.local_address() else {
                    debug!(peer = %sender, "authentication request before local address is known");
                    return;
                };
                if sender == own {
                    debug!("ignoring authentication request from ourselves");
                    return;
                }
                let Some(challenge) = self.auth.challenge(&sender, connection, &mut self.rng)
                else {
                    return;
                };
                // the claimed address is called back, never the requesting connection
                let transport = self.transport.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let response = NetworkMessage::AuthenticationResponse {
                        sender: own,
                        requester_nonce: nonce,
                        challenge,
                    };
                    if let Err(e) = transport.send(&sender, response).await {
                        debug!(peer = %sender, error = %e, "claimed address unreachable");
                        let _ = tx.send(Internal::AuthenticationChallengeFailed { challenge });
                    }
                });
            }
            NetworkMessage::AuthenticationResponse {
                sender,
                requester_nonce,
                challenge,
            } => {
                let Some(peer) = self.auth.on_response(&sender, requester_nonce, connection) else {
                    return;
                };
                debug!(peer = %peer, "peer authenticated");
                if let Some(own) = self.transport.local_address() {
                    let transport = self.transport.clone();
                    let target = peer.clone();
                    tokio::spawn(async move {
                        let confirm = NetworkMessage::AuthenticationConfirm {
                            sender: own,
                            challenge,
                        };
                        if let Err(e) = transport.send(&target, confirm).await {
                            debug!(peer = %target, error = %e, "failed to confirm authentication");
                        }
                    });
                }
                self.on_peer_authenticated(peer);
            }
            NetworkMessage::AuthenticationConfirm { sender, challenge } => {
                if let Some(peer) = self.auth.on_confirm(&sender, challenge, connection) {
                    debug!(peer = %peer, "peer authenticated");
                    self.on_peer_authenticated(peer);
                }
            }
            NetworkMessage::Sealed(prefixed) => {
                let Some(own) = self.transport.local_address() else {
                    return;
                };
                if let Some(message) = open_sealed(self.crypto.as_ref(), &own, &prefixed) {
                    debug!(peer = %prefixed.sender_address, "direct message received");
                    self.events.decrypted_direct.emit(DecryptedDirectMessage {
                        message,
                        peer: prefixed.sender_address,
                    });
                }
            }
            update @ (NetworkMessage::AddData(_)
            | NetworkMessage::RemoveData(_)
            | NetworkMessage::RemoveMailboxData(_)
            | NetworkMessage::RefreshTtl(_)) => {
                let sender = self.auth.peer_for(connection).cloned().or(peer);
                let Some(sender) = sender.filter(|s| self.auth.is_authenticated(s)) else {
                    debug!(connection = %connection, kind = update.kind(), "store update from unauthenticated peer ignored");
                    return;
                };
                self.apply_store_update(update, &sender);
            }
        }
    }

    fn apply_store_update(&mut self, update: NetworkMessage, sender: &NodeAddress) {
        let accepted = match update {
            NetworkMessage::AddData(entry) => self.store.add_entry(entry, Some(sender)),
            NetworkMessage::RemoveData(data) => self.store.remove(data, Some(sender)),
            NetworkMessage::RemoveMailboxData(data) => {
                self.store.remove_mailbox_data(data, Some(sender))
            }
            NetworkMessage::RefreshTtl(message) => self.store.refresh_ttl(message, Some(sender)),
            other => {
                debug!(kind = other.kind(), "not a store update");
                return;
            }
        };
        trace!(peer = %sender, accepted, "store update applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MAILBOX_TTL;
    use std::time::Instant;

    struct NoBroadcast;

    impl Broadcaster for NoBroadcast {
        fn broadcast(&self, _message: NetworkMessage, _exclude: Option<&NodeAddress>) {}
    }

    #[test]
    fn expired_mailbox_entry_leaves_the_inbox() {
        let sender = KeyRing::generate();
        let receiver = KeyRing::generate();
        let sender_address = NodeAddress::new("sender.onion", 9002);
        let receiver_address = NodeAddress::new("receiver.onion", 9001);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = ProtectedDataStore::new(Arc::new(NoBroadcast));
        store.add_listener(Arc::new(StoreForwarder {
            events: Arc::new(ServiceEvents::default()),
            tx,
        }));

        let message = AppMessage::Mailbox(MailboxMessage::new(
            sender_address.clone(),
            b"while you were away".to_vec(),
        ));
        let sealed = EncryptionService::new(sender.clone())
            .seal_and_sign(&receiver.pub_key_ring(), &message)
            .unwrap();
        let payload = MailboxPayload {
            sealed_message: PrefixedSealedMessage::new(sender_address, sealed, &receiver_address),
            sender_storage_pub_key: sender.signature.public_key_bytes(),
            receiver_storage_pub_key: receiver.signature.public_key_bytes(),
        };
        let data = store
            .get_mailbox_data_with_signed_seq_nr(
                payload,
                &sender.signature,
                receiver.signature.public_key_bytes(),
            )
            .unwrap();
        assert!(store.add_mailbox_data(data, None));

        let crypto = EncryptionService::new(receiver);
        let mut inbox = Inbox::new(16);
        let Ok(Internal::MailboxObserved(added)) = rx.try_recv() else {
            panic!("expected the added mailbox entry");
        };
        assert!(inbox.observe(&crypto, &receiver_address, &added).is_some());
        assert_eq!(inbox.len(), 1);

        let later = Instant::now() + MAILBOX_TTL + Duration::from_secs(1);
        assert_eq!(store.remove_expired_at(later), 1);
        let Ok(Internal::MailboxRemoved(expired)) = rx.try_recv() else {
            panic!("expected the expired mailbox entry");
        };
        assert!(inbox.forget(&expired).is_some());
        assert_eq!(inbox.len(), 0);
    }
}
