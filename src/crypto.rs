//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic primitives tradenet relies on:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Sealed messages**: [`EncryptionService`], the default [`CryptoService`]
//! - **TLS**: Certificate generation and verification for the QUIC transport
//!
//! ## Sealed Message Construction
//!
//! | Step | Primitive |
//! |------|-----------|
//! | Key agreement | X25519, fresh ephemeral key per message, receiver's static key |
//! | Key derivation | BLAKE3 `derive_key(shared ‖ ephemeral_pub ‖ receiver_pub)` |
//! | Encryption | ChaCha20-Poly1305, random 96-bit nonce |
//! | Authentication | Ed25519 over `message ‖ receiver_pub` inside the ciphertext |
//!
//! The inner signature binds the plaintext to its intended receiver, so a
//! receiver cannot re-seal a signed message to a third party and pass it off
//! as addressed to them. Anyone may attempt decryption; only the receiver
//! succeeds, and a failed attempt is an ordinary, expected outcome.
//!
//! ## TLS
//!
//! QUIC connections present a self-signed Ed25519 certificate derived from the
//! node's signature key. The client accepts any well-formed Ed25519
//! certificate: peers are recognized at the application layer (address
//! handshake, signed records), not by the TLS chain.

use std::sync::Arc;

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::identity::{KeyRing, Keypair, PubKeyRing, PublicKeyBytes};
use crate::messages::{self, AppMessage, DecryptedMessageWithPubKey};
use crate::protocols::CryptoService;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature creation and verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// The local signer refused to produce a signature.
    SigningFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::SigningFailed => write!(f, "signing failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Each signed data type uses a unique prefix so that a signature
// cannot be replayed in a different context.

/// Domain separation prefix for protected storage records (`payload ‖ seq`).
pub const STORAGE_SIGNATURE_DOMAIN: &[u8] = b"tradenet-storage-v1:";

/// Domain separation prefix for the signature inside a sealed message.
pub const SEALED_MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"tradenet-sealed-v1:";

/// BLAKE3 key derivation context for sealed message keys.
const SEALED_MESSAGE_KEY_CONTEXT: &str = "tradenet 2024-01 sealed message key";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Returns the 64-byte Ed25519 signature, or [`SignatureError::SigningFailed`]
/// if the signer errors.
pub fn sign_with_domain(
    keypair: &Keypair,
    domain: &[u8],
    data: &[u8],
) -> std::result::Result<Vec<u8>, SignatureError> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair
        .try_sign(&prefixed)
        .map(|sig| sig.to_bytes().to_vec())
        .map_err(|_| SignatureError::SigningFailed)
}

/// Verify a signature with domain separation.
///
/// Uses `verify_strict` to reject malleable signatures and small-order keys.
pub fn verify_with_domain(
    public_key: &PublicKeyBytes,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Sealed Messages
// ============================================================================

/// Error type for sealing and opening messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encoding the plaintext failed.
    Serialization(String),
    /// The AEAD refused to encrypt.
    Encryption,
    /// Wrong receiver, corrupted ciphertext, or degenerate key agreement.
    Decryption,
    /// The decrypted envelope is not a valid signed message.
    Malformed(String),
    /// The inner signature does not verify.
    Signature(SignatureError),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Serialization(e) => write!(f, "failed to encode message: {}", e),
            CryptoError::Encryption => write!(f, "encryption failed"),
            CryptoError::Decryption => write!(f, "decryption failed"),
            CryptoError::Malformed(e) => write!(f, "malformed sealed message: {}", e),
            CryptoError::Signature(e) => write!(f, "sealed message signature invalid: {}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Ciphertext of a signed [`AppMessage`], addressed to one receiver.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub ephemeral_pub_key: PublicKeyBytes,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedMessage")
            .field("ephemeral", &hex::encode(&self.ephemeral_pub_key[..8]))
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// Plaintext inside a [`SealedMessage`].
#[derive(Serialize, Deserialize)]
struct SignedEnvelope {
    sender_signature_pub_key: PublicKeyBytes,
    message: Vec<u8>,
    signature: Vec<u8>,
}

fn envelope_signed_bytes(message: &[u8], receiver_encryption_pub_key: &PublicKeyBytes) -> Vec<u8> {
    let mut data = Vec::with_capacity(message.len() + 32);
    data.extend_from_slice(message);
    data.extend_from_slice(receiver_encryption_pub_key);
    data
}

fn derive_message_key(
    shared: &[u8; 32],
    ephemeral_pub_key: &PublicKeyBytes,
    receiver_pub_key: &PublicKeyBytes,
) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral_pub_key);
    material[64..].copy_from_slice(receiver_pub_key);
    blake3::derive_key(SEALED_MESSAGE_KEY_CONTEXT, &material)
}

/// Default [`CryptoService`]: seals with the receiver's encryption key and
/// signs with our signature key.
pub struct EncryptionService {
    key_ring: KeyRing,
}

impl EncryptionService {
    pub fn new(key_ring: KeyRing) -> Self {
        Self { key_ring }
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("key_ring", &self.key_ring.pub_key_ring())
            .finish()
    }
}

impl CryptoService for EncryptionService {
    fn seal_and_sign(
        &self,
        receiver: &PubKeyRing,
        message: &AppMessage,
    ) -> std::result::Result<SealedMessage, CryptoError> {
        let message_bytes =
            bincode::serialize(message).map_err(|e| CryptoError::Serialization(e.to_string()))?;

        let signature = sign_with_domain(
            &self.key_ring.signature,
            SEALED_MESSAGE_SIGNATURE_DOMAIN,
            &envelope_signed_bytes(&message_bytes, &receiver.encryption_pub_key),
        )
        .map_err(CryptoError::Signature)?;

        let envelope = SignedEnvelope {
            sender_signature_pub_key: self.key_ring.signature.public_key_bytes(),
            message: message_bytes,
            signature,
        };
        let plaintext =
            bincode::serialize(&envelope).map_err(|e| CryptoError::Serialization(e.to_string()))?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub_key = X25519PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(receiver.encryption_pub_key));
        if !shared.was_contributory() {
            return Err(CryptoError::Encryption);
        }
        let key = derive_message_key(
            shared.as_bytes(),
            &ephemeral_pub_key,
            &receiver.encryption_pub_key,
        );

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CryptoError::Encryption)?;

        Ok(SealedMessage {
            ephemeral_pub_key,
            nonce,
            ciphertext,
        })
    }

    fn decrypt_and_verify(
        &self,
        sealed: &SealedMessage,
    ) -> std::result::Result<DecryptedMessageWithPubKey, CryptoError> {
        let own_pub_key = self.key_ring.encryption.public_key_bytes();
        let shared = self.key_ring.encryption.diffie_hellman(&sealed.ephemeral_pub_key);
        if !shared.was_contributory() {
            return Err(CryptoError::Decryption);
        }
        let key = derive_message_key(shared.as_bytes(), &sealed.ephemeral_pub_key, &own_pub_key);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption)?;

        let envelope: SignedEnvelope = messages::deserialize_bounded(&plaintext)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;

        verify_with_domain(
            &envelope.sender_signature_pub_key,
            SEALED_MESSAGE_SIGNATURE_DOMAIN,
            &envelope_signed_bytes(&envelope.message, &own_pub_key),
            &envelope.signature,
        )
        .map_err(CryptoError::Signature)?;

        let message: AppMessage = messages::deserialize_bounded(&envelope.message)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;

        Ok(DecryptedMessageWithPubKey {
            message,
            sender_pub_key: envelope.sender_signature_pub_key,
        })
    }
}

// ============================================================================
// TLS for the QUIC transport
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for tradenet connections.
pub const ALPN: &[u8] = b"tradenet";

/// Server name presented in the certificate and used for SNI.
pub const TLS_SERVER_NAME: &str = "tradenet";

/// Idle timeout after which a silent QUIC connection is dropped.
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Keep-alive interval on outbound connections.
const KEEP_ALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    // PKCS#8 v1 OneAsymmetricKey wrapping the raw 32-byte seed
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(IDLE_TIMEOUT.try_into().ok());
    transport.max_concurrent_uni_streams(256u32.into());
    transport.max_concurrent_bidi_streams(0u32.into());
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

pub fn create_client_config() -> Result<quinn::ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519CertVerifier))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(IDLE_TIMEOUT.try_into().ok());
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

#[derive(Debug)]
struct Ed25519CertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if VerifyingKey::from_bytes(&public_key).is_err() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
