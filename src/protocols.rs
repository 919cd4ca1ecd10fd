//! Boundary traits for the collaborators the service core consumes.
//!
//! The core never touches sockets, ciphers or configuration files directly.
//! Each external concern is reached through one trait defined here.
//!
//! ## Traits
//!
//! | Concern | Trait | Shipped implementation |
//! |---------|-------|------------------------|
//! | Connections, framing, readiness | [`Transport`] | `QuicTransport`, `MemoryTransport` |
//! | Sealing and opening messages | [`CryptoService`] | `EncryptionService` |
//! | Seed node directory | [`SeedNodeRepository`] | `Vec<NodeAddress>` |

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::crypto::{CryptoError, SealedMessage};
use crate::identity::{NodeAddress, PubKeyRing};
use crate::messages::{AppMessage, DecryptedMessageWithPubKey, NetworkMessage};

/// Opaque handle of one transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events a transport reports to the service.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Listening; outbound connections may be opened.
    Ready,
    /// The local endpoint is reachable by peers under this address.
    HiddenServicePublished(NodeAddress),
    /// Startup failed. Not retried.
    SetupFailed(String),
    Connected {
        connection: ConnectionId,
        /// Known for connections we opened, `None` for inbound ones.
        peer: Option<NodeAddress>,
    },
    Message {
        connection: ConnectionId,
        peer: Option<NodeAddress>,
        message: NetworkMessage,
    },
    Disconnected {
        connection: ConnectionId,
        peer: Option<NodeAddress>,
        /// `true` when closed locally on purpose.
        intended: bool,
    },
}

/// Message transport between peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts listening and begins delivering events on `events`.
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Sends `message` to `to`, opening a connection if needed.
    async fn send(&self, to: &NodeAddress, message: NetworkMessage) -> Result<ConnectionId>;

    /// Sends `message` back over an existing connection.
    async fn reply(&self, connection: ConnectionId, message: NetworkMessage) -> Result<()>;

    /// Closes a connection. Unknown connections are ignored.
    async fn close(&self, connection: ConnectionId);

    /// Address peers reach us under, once published.
    fn local_address(&self) -> Option<NodeAddress>;

    /// Closes every connection and stops listening. Completes when the
    /// transport is fully stopped.
    async fn shutdown(&self);
}

/// Hybrid encryption plus signing of application messages.
pub trait CryptoService: Send + Sync + 'static {
    fn seal_and_sign(
        &self,
        receiver: &PubKeyRing,
        message: &AppMessage,
    ) -> std::result::Result<SealedMessage, CryptoError>;

    fn decrypt_and_verify(
        &self,
        sealed: &SealedMessage,
    ) -> std::result::Result<DecryptedMessageWithPubKey, CryptoError>;
}

/// Source of the well-known seed node addresses.
pub trait SeedNodeRepository: Send + Sync + 'static {
    fn seed_node_addresses(&self) -> Vec<NodeAddress>;
}

impl SeedNodeRepository for Vec<NodeAddress> {
    fn seed_node_addresses(&self) -> Vec<NodeAddress> {
        self.clone()
    }
}
