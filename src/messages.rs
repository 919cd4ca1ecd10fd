//! # Wire Protocol Messages
//!
//! This module defines every serializable message exchanged between tradenet
//! peers and the plaintext carried inside sealed messages. Messages are
//! serialized using bincode with size limits to prevent memory exhaustion.
//!
//! ## Message Types
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `GetDataSet` | peer → seed | request the full protected dataset, tagged with a nonce |
//! | `DataSet` | seed → peer | reply with every stored entry |
//! | `AuthenticationRequest` | peer → peer | claim an address, ask the peer to call back |
//! | `AuthenticationResponse` | peer → claimed address | echo the nonce, carry a fresh challenge |
//! | `AuthenticationConfirm` | claimed address → peer | echo the challenge, completing the handshake |
//! | `Sealed` | peer → peer | encrypted direct message |
//! | `AddData` / `RemoveData` / `RemoveMailboxData` / `RefreshTtl` | flooding | replicated store updates |
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: Maximum size of one framed message on the wire
//! - `MAX_DESERIALIZE_SIZE`: Maximum deserialization buffer (prevents OOM)
//! - All deserialization uses `deserialize_bounded()` with size limits

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::crypto::SealedMessage;
use crate::identity::{NodeAddress, PublicKeyBytes};
use crate::storage::{ProtectedData, ProtectedEntry, ProtectedMailboxData, RefreshTtlMessage};

/// Maximum size of one framed message (16 MiB).
/// A `DataSet` reply carries the whole store and dominates this bound.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_FRAME_SIZE as u64;

/// Maximum size of an application payload inside a sealed message (256 KiB).
pub const MAX_APP_PAYLOAD_SIZE: usize = 256 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message(message: &NetworkMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn deserialize_message(data: &[u8]) -> Result<NetworkMessage, bincode::Error> {
    deserialize_bounded(data)
}

// ============================================================================
// Network Messages
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NetworkMessage {
    GetDataSet {
        nonce: u64,
    },
    DataSet {
        request_nonce: u64,
        entries: Vec<ProtectedEntry>,
    },
    AuthenticationRequest {
        sender: NodeAddress,
        nonce: u64,
    },
    AuthenticationResponse {
        sender: NodeAddress,
        requester_nonce: u64,
        challenge: u64,
    },
    AuthenticationConfirm {
        sender: NodeAddress,
        challenge: u64,
    },
    Sealed(PrefixedSealedMessage),
    AddData(ProtectedEntry),
    RemoveData(ProtectedData),
    RemoveMailboxData(ProtectedMailboxData),
    RefreshTtl(RefreshTtlMessage),
}

impl NetworkMessage {
    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::GetDataSet { .. } => "get_data_set",
            NetworkMessage::DataSet { .. } => "data_set",
            NetworkMessage::AuthenticationRequest { .. } => "authentication_request",
            NetworkMessage::AuthenticationResponse { .. } => "authentication_response",
            NetworkMessage::AuthenticationConfirm { .. } => "authentication_confirm",
            NetworkMessage::Sealed(_) => "sealed",
            NetworkMessage::AddData(_) => "add_data",
            NetworkMessage::RemoveData(_) => "remove_data",
            NetworkMessage::RemoveMailboxData(_) => "remove_mailbox_data",
            NetworkMessage::RefreshTtl(_) => "refresh_ttl",
        }
    }
}

/// A sealed message plus the routing information a receiver needs before
/// attempting decryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixedSealedMessage {
    pub sender_address: NodeAddress,
    pub sealed: SealedMessage,
    pub address_prefix_hash: [u8; 32],
}

impl PrefixedSealedMessage {
    pub fn new(sender_address: NodeAddress, sealed: SealedMessage, receiver: &NodeAddress) -> Self {
        Self {
            sender_address,
            sealed,
            address_prefix_hash: receiver.address_prefix_hash(),
        }
    }

    /// Cheap pre-filter: could this message be addressed to `own_address`?
    pub fn matches_prefix_of(&self, own_address: &NodeAddress) -> bool {
        self.address_prefix_hash == own_address.address_prefix_hash()
    }
}

// ============================================================================
// Application Plaintext
// ============================================================================

/// Unique identifier of a mailbox message, chosen by its sender.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageUid(pub [u8; 16]);

impl MessageUid {
    /// Generate a random uid.
    ///
    /// Falls back to a BLAKE3 digest of the current time and a process-local
    /// counter if the OS random source is unavailable.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        if getrandom::getrandom(&mut bytes).is_err() {
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let mut hasher = blake3::Hasher::new();
            hasher.update(&crate::identity::now_ms().to_le_bytes());
            hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
            bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        }
        Self(bytes)
    }
}

impl std::fmt::Debug for MessageUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageUid({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for MessageUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub payload: Vec<u8>,
}

/// A message that may be stored for an offline receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub uid: MessageUid,
    pub sender_address: NodeAddress,
    pub payload: Vec<u8>,
}

impl MailboxMessage {
    pub fn new(sender_address: NodeAddress, payload: Vec<u8>) -> Self {
        Self {
            uid: MessageUid::random(),
            sender_address,
            payload,
        }
    }
}

/// Plaintext carried inside a [`SealedMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMessage {
    Direct(DirectMessage),
    Mailbox(MailboxMessage),
}

impl AppMessage {
    pub fn payload(&self) -> &[u8] {
        match self {
            AppMessage::Direct(m) => &m.payload,
            AppMessage::Mailbox(m) => &m.payload,
        }
    }

    pub fn as_mailbox(&self) -> Option<&MailboxMessage> {
        match self {
            AppMessage::Mailbox(m) => Some(m),
            AppMessage::Direct(_) => None,
        }
    }
}

/// Result of a successful `decrypt_and_verify`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessageWithPubKey {
    pub message: AppMessage,
    /// Ed25519 key the sender signed the plaintext with.
    pub sender_pub_key: PublicKeyBytes,
}
