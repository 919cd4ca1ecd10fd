//! # Node Identity and Key Material
//!
//! This module defines the identity types shared by every tradenet component:
//!
//! - [`NodeAddress`]: network-level name of a peer (`host:port`)
//! - [`Keypair`]: Ed25519 signing keypair (storage records, sealed messages)
//! - [`EncryptionKeypair`]: X25519 static keypair (sealed message receipt)
//! - [`KeyRing`] / [`PubKeyRing`]: the private and public halves a node holds
//!
//! ## Identity Model
//!
//! A peer is *reached* through its [`NodeAddress`] and *recognized* through its
//! Ed25519 public key. The two are deliberately decoupled: the address of a
//! node may change (new hidden service, new port) while records it owns in the
//! protected data store stay bound to its signature key.
//!
//! ## Address Prefix Hash
//!
//! Sealed messages carry a hash of the first two characters of the receiver's
//! `host:port` string. Receivers use it as a cheap pre-filter before trying to
//! decrypt. Two characters leak almost nothing about the receiver while still
//! discarding most foreign messages.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};

/// Raw 32-byte public key (Ed25519 verifying key or X25519 public key).
pub type PublicKeyBytes = [u8; 32];

/// Number of leading characters of `host:port` covered by the prefix hash.
pub const ADDRESS_PREFIX_LEN: usize = 2;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Short hex rendering of a key for log fields.
#[inline]
pub(crate) fn short_hex(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(8)])
}

// ============================================================================
// Node Address
// ============================================================================

/// Network address of a peer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used for display, dialing and prefix hashing.
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// BLAKE3 hash of the first [`ADDRESS_PREFIX_LEN`] characters of the full address.
    pub fn address_prefix_hash(&self) -> [u8; 32] {
        let full = self.full_address();
        let prefix: String = full.chars().take(ADDRESS_PREFIX_LEN).collect();
        *blake3::hash(prefix.as_bytes()).as_bytes()
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeAddress({}:{})", self.host, self.port)
    }
}

/// Error returned when parsing a [`NodeAddress`] from `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    /// No `:` separator present.
    MissingPort,
    /// Host part is empty.
    EmptyHost,
    /// Port is not a valid u16.
    InvalidPort(String),
}

impl std::fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressParseError::MissingPort => write!(f, "address must have the form host:port"),
            AddressParseError::EmptyHost => write!(f, "address host is empty"),
            AddressParseError::InvalidPort(port) => write!(f, "invalid port: {}", port),
        }
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(port.to_string()))?;
        Ok(NodeAddress::new(host, port))
    }
}

// ============================================================================
// Signing Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Fallible signing. Storage and sealed-message code paths go through this
    /// so that a failing signer surfaces as an error instead of a panic.
    pub fn try_sign(&self, message: &[u8]) -> Result<Signature, ed25519_dalek::SignatureError> {
        self.signing_key.try_sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Encryption Keypair
// ============================================================================

/// Static X25519 keypair used to receive sealed messages.
#[derive(Clone)]
pub struct EncryptionKeypair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EncryptionKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        self.public.to_bytes()
    }

    pub(crate) fn diffie_hellman(&self, their_public: &PublicKeyBytes) -> SharedSecret {
        self.secret
            .diffie_hellman(&X25519PublicKey::from(*their_public))
    }
}

impl std::fmt::Debug for EncryptionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeypair")
            .field("public_key", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Key Rings
// ============================================================================

/// Private key material of a node.
#[derive(Clone, Debug)]
pub struct KeyRing {
    pub signature: Keypair,
    pub encryption: EncryptionKeypair,
}

impl KeyRing {
    pub fn generate() -> Self {
        Self {
            signature: Keypair::generate(),
            encryption: EncryptionKeypair::generate(),
        }
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        PubKeyRing {
            signature_pub_key: self.signature.public_key_bytes(),
            encryption_pub_key: self.encryption.public_key_bytes(),
        }
    }
}

/// Public keys a sender needs to seal a message for a node and to address
/// its mailbox records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    pub signature_pub_key: PublicKeyBytes,
    pub encryption_pub_key: PublicKeyBytes,
}

impl std::fmt::Debug for PubKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubKeyRing")
            .field("signature", &short_hex(&self.signature_pub_key))
            .field("encryption", &short_hex(&self.encryption_pub_key))
            .finish()
    }
}
