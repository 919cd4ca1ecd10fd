//! # tradenet - P2P Core of a Decentralized Trading Network
//!
//! tradenet keeps a replicated, signature-protected data store in sync across
//! peers and delivers end-to-end encrypted messages between them:
//!
//! - **Protected store**: Signed entries with monotonic sequence numbers,
//!   flooded to authenticated peers
//! - **Bootstrap**: Fetches the current dataset from seed nodes, then
//!   authenticates to them
//! - **Messaging**: Sealed direct messages, with store-and-forward mailbox
//!   entries for offline receivers
//! - **Transport**: Pluggable; QUIC for real deployments, in-memory for tests
//!
//! ## Architecture
//!
//! [`P2PService`] is a cheap handle to a private actor that owns all
//! mutable service state and processes commands, transport events and timers
//! sequentially. Bootstrap and authentication are plain state machines driven
//! by that actor; the store is shared and internally synchronized.
//!
//! ## Security Model
//!
//! - Every store entry is signed by its owner over `payload hash ‖ sequence`
//! - Only the owner may replace or remove an entry, only with a higher sequence
//! - Mailbox entries can only be removed by their receiver
//! - Sealed messages are readable by the receiver only and carry the sender's
//!   signature over the plaintext
//! - Store updates are accepted from authenticated peers only
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `service` | [`P2PService`] facade and its actor |
//! | `storage` | Protected data store, signed records, expiry |
//! | `bootstrap` | Seed node data request and authentication state machine |
//! | `auth` | Address-proof handshake bookkeeping |
//! | `mailbox` | Opening sealed messages, received mailbox tracking |
//! | `identity` | Addresses, signature and encryption keys |
//! | `crypto` | Domain-separated signatures, message sealing, TLS |
//! | `messages` | Wire types and bounded serialization |
//! | `events` | Listener subscriptions |
//! | `protocols` | Transport, crypto and seed node traits |
//! | `transport` | QUIC transport |
//! | `memory` | In-process transport |

mod auth;
mod bootstrap;
mod crypto;
mod events;
mod identity;
mod mailbox;
mod memory;
mod messages;
mod protocols;
mod service;
mod storage;
mod transport;

pub use bootstrap::{BootstrapState, DEFAULT_MIN_CONNECTED_SEED_NODES};
pub use crypto::{CryptoError, EncryptionService, SealedMessage, SignatureError};
pub use events::{
    DecryptedDirectMessage, DecryptedMailboxMessage, InboundMessage, ServiceEvent, StorageEvent,
    Subscription,
};
pub use identity::{
    AddressParseError, EncryptionKeypair, KeyRing, Keypair, NodeAddress, PubKeyRing,
    PublicKeyBytes,
};
pub use mailbox::SendOutcome;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{
    AppMessage, DecryptedMessageWithPubKey, DirectMessage, MAX_APP_PAYLOAD_SIZE, MailboxMessage,
    MessageUid, NetworkMessage, PrefixedSealedMessage,
};
pub use protocols::{ConnectionId, CryptoService, SeedNodeRepository, Transport, TransportEvent};
pub use service::{NetworkSnapshot, P2PService, ServiceConfig, ServiceError, ServiceState};
pub use storage::{
    MAILBOX_TTL, MAX_PAYLOAD_DATA_SIZE, MAX_PAYLOAD_TTL, MailboxPayload, OwnedPayload,
    PayloadHash, ProtectedData, ProtectedEntry, ProtectedMailboxData, RefreshTtlMessage,
    StoragePayload,
};
pub use transport::QuicTransport;
