//! # Protected Data Store
//!
//! Replicated map of signed, sequence-numbered, expiring records.
//!
//! Every entry is bound to an owner's Ed25519 key. A record is replaced only
//! by a newer record (strictly higher sequence number) signed by the same
//! owner; removal is itself a signed record with a higher sequence number.
//! Mailbox entries are additionally bound to a receiver, and only the
//! receiver may remove them.
//!
//! ## Validation Gate
//!
//! | Operation | Key binding | Signature | Sequence | Stored entry |
//! |-----------|-------------|-----------|----------|--------------|
//! | add | payload owner == signer | over `(hash, seq)` | `>` last seen | same owner if present |
//! | add (mailbox) | payload sender == signer, receivers agree | over `(hash, seq)` | `>` last seen | same owner if present |
//! | remove | payload owner == signer | over `(hash, seq)` | `>` last seen | must exist, same owner |
//! | remove (mailbox) | signer == receiver | over `(hash, seq)` | `>` last seen | must exist, same receiver |
//! | refresh TTL | stored owner | over `(hash, seq)` | `>` last seen | must exist, owned payload |
//!
//! Rejections are reported as `false`, logged at debug level, and never
//! propagated to peers.
//!
//! ## Replay Protection
//!
//! Sequence numbers outlive the entries they belong to: after a removal or an
//! expiry, a replayed copy of the old record is still stale. Once more than
//! [`SEQUENCE_NUMBER_PURGE_THRESHOLD`] numbers are tracked, those older than
//! [`SEQUENCE_NUMBER_RETENTION`] are dropped.
//!
//! ## Concurrency
//!
//! Map and sequence numbers live behind one mutex, so validation and
//! replacement of a record happen atomically. Listeners are held in a
//! copy-on-write list and invoked synchronously after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::crypto::{STORAGE_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};
use crate::identity::{Keypair, NodeAddress, PublicKeyBytes, now_ms, short_hex};
use crate::messages::{NetworkMessage, PrefixedSealedMessage};

// ============================================================================
// Limits
// ============================================================================

/// Lifetime of a mailbox entry (10 days).
pub const MAILBOX_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Upper bound on the TTL an owner may request (30 days).
pub const MAX_PAYLOAD_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Maximum size of the data carried by an owned payload (128 KiB).
/// SECURITY: Bounds the memory a single peer can pin in every replica.
pub const MAX_PAYLOAD_DATA_SIZE: usize = 128 * 1024;

/// Age after which a tracked sequence number may be purged (10 days).
pub const SEQUENCE_NUMBER_RETENTION: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Number of tracked sequence numbers above which old ones are purged.
pub const SEQUENCE_NUMBER_PURGE_THRESHOLD: usize = 1000;

// ============================================================================
// Payloads and Records
// ============================================================================

/// Content identity of a payload: BLAKE3 over its bincode encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadHash(pub [u8; 32]);

impl std::fmt::Debug for PayloadHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PayloadHash({})", short_hex(&self.0))
    }
}

impl std::fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Data published by its owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedPayload {
    pub owner_pub_key: PublicKeyBytes,
    pub ttl_ms: u64,
    pub data: Vec<u8>,
    /// When set, replicas drop the entry as soon as the owner at this address
    /// disconnects unexpectedly.
    pub owner_address: Option<NodeAddress>,
}

/// A sealed message parked in the store for an offline receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxPayload {
    pub sealed_message: PrefixedSealedMessage,
    pub sender_storage_pub_key: PublicKeyBytes,
    pub receiver_storage_pub_key: PublicKeyBytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoragePayload {
    Owned(OwnedPayload),
    Mailbox(MailboxPayload),
}

impl StoragePayload {
    pub fn hash(&self) -> Result<PayloadHash, StorageError> {
        let bytes =
            bincode::serialize(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(PayloadHash(*blake3::hash(&bytes).as_bytes()))
    }

    pub fn ttl(&self) -> Duration {
        match self {
            StoragePayload::Owned(p) => Duration::from_millis(p.ttl_ms).min(MAX_PAYLOAD_TTL),
            StoragePayload::Mailbox(_) => MAILBOX_TTL,
        }
    }

    fn owner_address(&self) -> Option<&NodeAddress> {
        match self {
            StoragePayload::Owned(p) => p.owner_address.as_ref(),
            StoragePayload::Mailbox(_) => None,
        }
    }
}

/// A payload signed by its owner together with a sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedData {
    pub payload: StoragePayload,
    pub owner_pub_key: PublicKeyBytes,
    pub sequence_number: i64,
    pub signature: Vec<u8>,
}

/// A mailbox record: signed by the sender to add, by the receiver to remove.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedMailboxData {
    pub data: ProtectedData,
    pub receiver_pub_key: PublicKeyBytes,
}

impl ProtectedMailboxData {
    pub fn mailbox_payload(&self) -> Option<&MailboxPayload> {
        match &self.data.payload {
            StoragePayload::Mailbox(p) => Some(p),
            StoragePayload::Owned(_) => None,
        }
    }
}

/// Value type of the replicated map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectedEntry {
    Data(ProtectedData),
    Mailbox(ProtectedMailboxData),
}

impl ProtectedEntry {
    pub fn data(&self) -> &ProtectedData {
        match self {
            ProtectedEntry::Data(d) => d,
            ProtectedEntry::Mailbox(m) => &m.data,
        }
    }

    pub fn as_mailbox(&self) -> Option<&ProtectedMailboxData> {
        match self {
            ProtectedEntry::Mailbox(m) => Some(m),
            ProtectedEntry::Data(_) => None,
        }
    }
}

/// Extends the lifetime of an owned entry without resending its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTtlMessage {
    pub payload_hash: PayloadHash,
    pub sequence_number: i64,
    pub signature: Vec<u8>,
}

fn signed_bytes(hash: &PayloadHash, sequence_number: i64) -> [u8; 40] {
    let mut bytes = [0u8; 40];
    bytes[..32].copy_from_slice(&hash.0);
    bytes[32..].copy_from_slice(&sequence_number.to_be_bytes());
    bytes
}

fn verify_record(
    owner: &PublicKeyBytes,
    hash: &PayloadHash,
    sequence_number: i64,
    signature: &[u8],
) -> Result<(), Rejection> {
    verify_with_domain(
        owner,
        STORAGE_SIGNATURE_DOMAIN,
        &signed_bytes(hash, sequence_number),
        signature,
    )
    .map_err(Rejection::Signature)
}

// ============================================================================
// Errors
// ============================================================================

/// Failure to build a signed record locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Serialization(String),
    Signing(SignatureError),
    SequenceNumberExhausted,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Serialization(e) => write!(f, "failed to encode payload: {}", e),
            StorageError::Signing(e) => write!(f, "failed to sign record: {}", e),
            StorageError::SequenceNumberExhausted => write!(f, "sequence number exhausted"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Why the store refused a record. Only surfaces in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    ShutDown,
    Encoding,
    PayloadTooLarge(usize),
    WrongEntryKind,
    KeyMismatch,
    Signature(SignatureError),
    StaleSequenceNumber { stored: i64, received: i64 },
    OwnerMismatch,
    ReceiverMismatch,
    NotFound,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::ShutDown => write!(f, "store is shut down"),
            Rejection::Encoding => write!(f, "payload cannot be encoded"),
            Rejection::PayloadTooLarge(len) => write!(f, "payload data too large ({} bytes)", len),
            Rejection::WrongEntryKind => write!(f, "entry kind does not match payload"),
            Rejection::KeyMismatch => write!(f, "signer key does not match payload keys"),
            Rejection::Signature(e) => write!(f, "{}", e),
            Rejection::StaleSequenceNumber { stored, received } => {
                write!(f, "sequence number {} not above {}", received, stored)
            }
            Rejection::OwnerMismatch => write!(f, "stored entry has a different owner"),
            Rejection::ReceiverMismatch => write!(f, "stored entry has a different receiver"),
            Rejection::NotFound => write!(f, "no such entry"),
        }
    }
}

// ============================================================================
// Listener and Broadcast Seams
// ============================================================================

/// Synchronous observer of store mutations.
pub trait StoreListener: Send + Sync {
    fn on_added(&self, entry: &ProtectedEntry);
    fn on_removed(&self, entry: &ProtectedEntry);
}

/// Propagates accepted mutations to connected peers.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: NetworkMessage, exclude: Option<&NodeAddress>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ============================================================================
// Store
// ============================================================================

struct StoredRecord {
    entry: ProtectedEntry,
    expires_at: Instant,
}

struct SequenceRecord {
    sequence_number: i64,
    recorded_at_ms: u64,
}

#[derive(Default)]
struct StoreState {
    map: HashMap<PayloadHash, StoredRecord>,
    sequence_numbers: HashMap<PayloadHash, SequenceRecord>,
}

impl StoreState {
    fn check_sequence_number(&self, hash: &PayloadHash, received: i64) -> Result<(), Rejection> {
        match self.sequence_numbers.get(hash) {
            Some(record) if received <= record.sequence_number => {
                Err(Rejection::StaleSequenceNumber {
                    stored: record.sequence_number,
                    received,
                })
            }
            _ => Ok(()),
        }
    }

    fn record_sequence_number(&mut self, hash: PayloadHash, sequence_number: i64) {
        self.sequence_numbers.insert(
            hash,
            SequenceRecord {
                sequence_number,
                recorded_at_ms: now_ms(),
            },
        );
    }

    fn purge_sequence_numbers(&mut self) -> usize {
        if self.sequence_numbers.len() <= SEQUENCE_NUMBER_PURGE_THRESHOLD {
            return 0;
        }
        let cutoff = now_ms().saturating_sub(SEQUENCE_NUMBER_RETENTION.as_millis() as u64);
        let before = self.sequence_numbers.len();
        let map = &self.map;
        self.sequence_numbers
            .retain(|hash, record| record.recorded_at_ms > cutoff || map.contains_key(hash));
        before - self.sequence_numbers.len()
    }
}

type ListenerList = Arc<Vec<(ListenerId, Arc<dyn StoreListener>)>>;

pub struct ProtectedDataStore {
    state: Mutex<StoreState>,
    listeners: RwLock<ListenerList>,
    next_listener_id: AtomicU64,
    broadcaster: Arc<dyn Broadcaster>,
    authenticated: AtomicBool,
    shut_down: AtomicBool,
}

impl ProtectedDataStore {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            broadcaster,
            authenticated: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn StoreListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let mut guard = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        let next: Vec<_> = guard.iter().filter(|(lid, _)| *lid != id).cloned().collect();
        *guard = Arc::new(next);
    }

    fn listeners_snapshot(&self) -> ListenerList {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn notify_added(&self, entry: &ProtectedEntry) {
        for (_, listener) in self.listeners_snapshot().iter() {
            listener.on_added(entry);
        }
    }

    fn notify_removed(&self, entry: &ProtectedEntry) {
        for (_, listener) in self.listeners_snapshot().iter() {
            listener.on_removed(entry);
        }
    }

    fn propagate(&self, message: NetworkMessage, sender: Option<&NodeAddress>) {
        if self.authenticated.load(Ordering::Acquire) {
            self.broadcaster.broadcast(message, sender);
        }
    }

    // ------------------------------------------------------------------------
    // State flags
    // ------------------------------------------------------------------------

    /// Enables propagation of accepted mutations to peers.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Stops accepting mutations. Idempotent.
    pub fn shut_down(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(entries = self.len(), "protected data store shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_map(&self) -> HashMap<PayloadHash, ProtectedEntry> {
        self.state()
            .map
            .iter()
            .map(|(hash, record)| (*hash, record.entry.clone()))
            .collect()
    }

    pub fn entries(&self) -> Vec<ProtectedEntry> {
        self.state().map.values().map(|r| r.entry.clone()).collect()
    }

    pub fn get(&self, hash: &PayloadHash) -> Option<ProtectedEntry> {
        self.state().map.get(hash).map(|r| r.entry.clone())
    }

    pub fn contains(&self, hash: &PayloadHash) -> bool {
        self.state().map.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.state().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last accepted sequence number for a payload, including removed ones.
    pub fn sequence_number(&self, hash: &PayloadHash) -> Option<i64> {
        self.state()
            .sequence_numbers
            .get(hash)
            .map(|r| r.sequence_number)
    }

    // ------------------------------------------------------------------------
    // Building signed records
    // ------------------------------------------------------------------------

    fn next_sequence_number(&self, hash: &PayloadHash) -> Result<i64, StorageError> {
        match self.sequence_number(hash) {
            Some(last) => last
                .checked_add(1)
                .ok_or(StorageError::SequenceNumberExhausted),
            None => Ok(0),
        }
    }

    /// Signs `payload` with the next sequence number for its identity.
    pub fn get_data_with_signed_seq_nr(
        &self,
        payload: StoragePayload,
        keypair: &Keypair,
    ) -> Result<ProtectedData, StorageError> {
        let hash = payload.hash()?;
        let sequence_number = self.next_sequence_number(&hash)?;
        let signature = sign_with_domain(
            keypair,
            STORAGE_SIGNATURE_DOMAIN,
            &signed_bytes(&hash, sequence_number),
        )
        .map_err(StorageError::Signing)?;
        Ok(ProtectedData {
            payload,
            owner_pub_key: keypair.public_key_bytes(),
            sequence_number,
            signature,
        })
    }

    /// Like [`get_data_with_signed_seq_nr`](Self::get_data_with_signed_seq_nr)
    /// for a mailbox payload addressed to `receiver_pub_key`.
    pub fn get_mailbox_data_with_signed_seq_nr(
        &self,
        payload: MailboxPayload,
        keypair: &Keypair,
        receiver_pub_key: PublicKeyBytes,
    ) -> Result<ProtectedMailboxData, StorageError> {
        let data = self.get_data_with_signed_seq_nr(StoragePayload::Mailbox(payload), keypair)?;
        Ok(ProtectedMailboxData {
            data,
            receiver_pub_key,
        })
    }

    pub fn get_refresh_ttl_message(
        &self,
        payload: &StoragePayload,
        keypair: &Keypair,
    ) -> Result<RefreshTtlMessage, StorageError> {
        let payload_hash = payload.hash()?;
        let sequence_number = self.next_sequence_number(&payload_hash)?;
        let signature = sign_with_domain(
            keypair,
            STORAGE_SIGNATURE_DOMAIN,
            &signed_bytes(&payload_hash, sequence_number),
        )
        .map_err(StorageError::Signing)?;
        Ok(RefreshTtlMessage {
            payload_hash,
            sequence_number,
            signature,
        })
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    pub fn add(&self, data: ProtectedData, sender: Option<&NodeAddress>) -> bool {
        self.add_internal(ProtectedEntry::Data(data), sender, true)
    }

    pub fn add_mailbox_data(&self, data: ProtectedMailboxData, sender: Option<&NodeAddress>) -> bool {
        self.add_internal(ProtectedEntry::Mailbox(data), sender, true)
    }

    /// Adds an entry of either kind, as received from the network.
    pub fn add_entry(&self, entry: ProtectedEntry, sender: Option<&NodeAddress>) -> bool {
        self.add_internal(entry, sender, true)
    }

    /// Applies a dataset received during bootstrap. Accepted entries are not
    /// re-broadcast. Returns the number of accepted entries.
    pub fn merge(&self, entries: Vec<ProtectedEntry>, sender: Option<&NodeAddress>) -> usize {
        let total = entries.len();
        let accepted = entries
            .into_iter()
            .map(|entry| self.add_internal(entry, sender, false))
            .filter(|accepted| *accepted)
            .count();
        debug!(total, accepted, "merged data set");
        accepted
    }

    fn add_internal(
        &self,
        entry: ProtectedEntry,
        sender: Option<&NodeAddress>,
        propagate: bool,
    ) -> bool {
        match self.try_add(&entry) {
            Ok(hash) => {
                trace!(hash = %hash, seq = entry.data().sequence_number, "entry added");
                if propagate {
                    self.propagate(NetworkMessage::AddData(entry.clone()), sender);
                }
                self.notify_added(&entry);
                true
            }
            Err(reason) => {
                debug!(
                    reason = %reason,
                    owner = %short_hex(&entry.data().owner_pub_key),
                    seq = entry.data().sequence_number,
                    "rejected add"
                );
                false
            }
        }
    }

    fn try_add(&self, entry: &ProtectedEntry) -> Result<PayloadHash, Rejection> {
        if self.is_shut_down() {
            return Err(Rejection::ShutDown);
        }
        let data = entry.data();
        match (entry, &data.payload) {
            (ProtectedEntry::Data(d), StoragePayload::Owned(p)) => {
                if p.owner_pub_key != d.owner_pub_key {
                    return Err(Rejection::KeyMismatch);
                }
                if p.data.len() > MAX_PAYLOAD_DATA_SIZE {
                    return Err(Rejection::PayloadTooLarge(p.data.len()));
                }
            }
            (ProtectedEntry::Mailbox(m), StoragePayload::Mailbox(p)) => {
                if p.sender_storage_pub_key != m.data.owner_pub_key
                    || p.receiver_storage_pub_key != m.receiver_pub_key
                {
                    return Err(Rejection::KeyMismatch);
                }
            }
            _ => return Err(Rejection::WrongEntryKind),
        }

        let hash = data.payload.hash().map_err(|_| Rejection::Encoding)?;
        verify_record(&data.owner_pub_key, &hash, data.sequence_number, &data.signature)?;

        let mut state = self.state();
        state.check_sequence_number(&hash, data.sequence_number)?;
        if let Some(stored) = state.map.get(&hash)
            && stored.entry.data().owner_pub_key != data.owner_pub_key
        {
            return Err(Rejection::OwnerMismatch);
        }

        state.map.insert(
            hash,
            StoredRecord {
                entry: entry.clone(),
                expires_at: Instant::now() + data.payload.ttl(),
            },
        );
        state.record_sequence_number(hash, data.sequence_number);
        Ok(hash)
    }

    pub fn remove(&self, data: ProtectedData, sender: Option<&NodeAddress>) -> bool {
        match self.try_remove(&data) {
            Ok(removed) => {
                trace!(seq = data.sequence_number, "entry removed");
                self.propagate(NetworkMessage::RemoveData(data), sender);
                self.notify_removed(&removed);
                true
            }
            Err(reason) => {
                debug!(reason = %reason, seq = data.sequence_number, "rejected remove");
                false
            }
        }
    }

    fn try_remove(&self, data: &ProtectedData) -> Result<ProtectedEntry, Rejection> {
        if self.is_shut_down() {
            return Err(Rejection::ShutDown);
        }
        let StoragePayload::Owned(payload) = &data.payload else {
            return Err(Rejection::WrongEntryKind);
        };
        if payload.owner_pub_key != data.owner_pub_key {
            return Err(Rejection::KeyMismatch);
        }

        let hash = data.payload.hash().map_err(|_| Rejection::Encoding)?;
        verify_record(&data.owner_pub_key, &hash, data.sequence_number, &data.signature)?;

        let mut state = self.state();
        let Some(stored) = state.map.get(&hash) else {
            return Err(Rejection::NotFound);
        };
        if stored.entry.data().owner_pub_key != data.owner_pub_key {
            return Err(Rejection::OwnerMismatch);
        }
        state.check_sequence_number(&hash, data.sequence_number)?;

        let removed = state.map.remove(&hash).ok_or(Rejection::NotFound)?;
        state.record_sequence_number(hash, data.sequence_number);
        Ok(removed.entry)
    }

    /// Removes a mailbox entry. Only the receiver named in the payload may
    /// sign the removal.
    pub fn remove_mailbox_data(
        &self,
        data: ProtectedMailboxData,
        sender: Option<&NodeAddress>,
    ) -> bool {
        match self.try_remove_mailbox(&data) {
            Ok(removed) => {
                trace!(seq = data.data.sequence_number, "mailbox entry removed");
                self.propagate(NetworkMessage::RemoveMailboxData(data), sender);
                self.notify_removed(&removed);
                true
            }
            Err(reason) => {
                debug!(
                    reason = %reason,
                    signer = %short_hex(&data.data.owner_pub_key),
                    "rejected mailbox remove"
                );
                false
            }
        }
    }

    fn try_remove_mailbox(&self, data: &ProtectedMailboxData) -> Result<ProtectedEntry, Rejection> {
        if self.is_shut_down() {
            return Err(Rejection::ShutDown);
        }
        let Some(payload) = data.mailbox_payload() else {
            return Err(Rejection::WrongEntryKind);
        };
        let signer = &data.data.owner_pub_key;
        if data.receiver_pub_key != *signer || payload.receiver_storage_pub_key != *signer {
            return Err(Rejection::KeyMismatch);
        }

        let hash = data.data.payload.hash().map_err(|_| Rejection::Encoding)?;
        verify_record(signer, &hash, data.data.sequence_number, &data.data.signature)?;

        let mut state = self.state();
        let Some(stored) = state.map.get(&hash) else {
            return Err(Rejection::NotFound);
        };
        match &stored.entry {
            ProtectedEntry::Mailbox(m) if m.receiver_pub_key == data.receiver_pub_key => {}
            _ => return Err(Rejection::ReceiverMismatch),
        }
        state.check_sequence_number(&hash, data.data.sequence_number)?;

        let removed = state.map.remove(&hash).ok_or(Rejection::NotFound)?;
        state.record_sequence_number(hash, data.data.sequence_number);
        Ok(removed.entry)
    }

    /// Restarts the expiry of an owned entry.
    pub fn refresh_ttl(&self, message: RefreshTtlMessage, sender: Option<&NodeAddress>) -> bool {
        match self.try_refresh_ttl(&message) {
            Ok(()) => {
                trace!(hash = %message.payload_hash, seq = message.sequence_number, "ttl refreshed");
                self.propagate(NetworkMessage::RefreshTtl(message), sender);
                true
            }
            Err(reason) => {
                debug!(reason = %reason, hash = %message.payload_hash, "rejected ttl refresh");
                false
            }
        }
    }

    fn try_refresh_ttl(&self, message: &RefreshTtlMessage) -> Result<(), Rejection> {
        if self.is_shut_down() {
            return Err(Rejection::ShutDown);
        }
        let hash = message.payload_hash;
        let mut state = self.state();
        state.check_sequence_number(&hash, message.sequence_number)?;
        let Some(stored) = state.map.get_mut(&hash) else {
            return Err(Rejection::NotFound);
        };
        let ProtectedEntry::Data(data) = &mut stored.entry else {
            return Err(Rejection::WrongEntryKind);
        };
        verify_record(
            &data.owner_pub_key,
            &hash,
            message.sequence_number,
            &message.signature,
        )?;

        // The refresh signature covers (hash, seq) exactly like a full record,
        // so the stored record stays self-verifying.
        data.sequence_number = message.sequence_number;
        data.signature = message.signature.clone();
        stored.expires_at = Instant::now() + data.payload.ttl();
        state.record_sequence_number(hash, message.sequence_number);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Drops expired entries and purges old sequence numbers.
    /// Returns the number of entries removed.
    pub fn remove_expired(&self) -> usize {
        self.remove_expired_at(Instant::now())
    }

    pub(crate) fn remove_expired_at(&self, now: Instant) -> usize {
        let (removed, purged) = {
            let mut state = self.state();
            let expired: Vec<PayloadHash> = state
                .map
                .iter()
                .filter(|(_, record)| record.expires_at <= now)
                .map(|(hash, _)| *hash)
                .collect();
            let removed: Vec<ProtectedEntry> = expired
                .iter()
                .filter_map(|hash| state.map.remove(hash))
                .map(|record| record.entry)
                .collect();
            let purged = state.purge_sequence_numbers();
            (removed, purged)
        };

        if !removed.is_empty() || purged > 0 {
            debug!(
                expired = removed.len(),
                purged_sequence_numbers = purged,
                "store maintenance"
            );
        }
        for entry in &removed {
            self.notify_removed(entry);
        }
        removed.len()
    }

    /// Drops entries whose owner must stay online and just disconnected.
    /// Returns the number of entries removed.
    pub fn on_peer_disconnected(&self, peer: &NodeAddress) -> usize {
        let removed: Vec<ProtectedEntry> = {
            let mut state = self.state();
            let owned_by_peer: Vec<PayloadHash> = state
                .map
                .iter()
                .filter(|(_, record)| record.entry.data().payload.owner_address() == Some(peer))
                .map(|(hash, _)| *hash)
                .collect();
            owned_by_peer
                .iter()
                .filter_map(|hash| state.map.remove(hash))
                .map(|record| record.entry)
                .collect()
        };

        if !removed.is_empty() {
            debug!(peer = %peer, removed = removed.len(), "dropped data of disconnected owner");
        }
        for entry in &removed {
            self.notify_removed(entry);
        }
        removed.len()
    }
}

impl std::fmt::Debug for ProtectedDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedDataStore")
            .field("entries", &self.len())
            .field("authenticated", &self.is_authenticated())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealedMessage;

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: Mutex<Vec<(NetworkMessage, Option<NodeAddress>)>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast(&self, message: NetworkMessage, exclude: Option<&NodeAddress>) {
            self.sent.lock().unwrap().push((message, exclude.cloned()));
        }
    }

    impl RecordingBroadcaster {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        added: Mutex<Vec<ProtectedEntry>>,
        removed: Mutex<Vec<ProtectedEntry>>,
    }

    impl StoreListener for RecordingListener {
        fn on_added(&self, entry: &ProtectedEntry) {
            self.added.lock().unwrap().push(entry.clone());
        }
        fn on_removed(&self, entry: &ProtectedEntry) {
            self.removed.lock().unwrap().push(entry.clone());
        }
    }

    fn store() -> (ProtectedDataStore, Arc<RecordingBroadcaster>) {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        (ProtectedDataStore::new(broadcaster.clone()), broadcaster)
    }

    fn owned(keypair: &Keypair, data: &[u8]) -> StoragePayload {
        StoragePayload::Owned(OwnedPayload {
            owner_pub_key: keypair.public_key_bytes(),
            ttl_ms: 60_000,
            data: data.to_vec(),
            owner_address: None,
        })
    }

    fn mailbox_payload(sender: &Keypair, receiver: &Keypair) -> MailboxPayload {
        MailboxPayload {
            sealed_message: PrefixedSealedMessage::new(
                NodeAddress::new("sender.onion", 1),
                SealedMessage {
                    ephemeral_pub_key: [7u8; 32],
                    nonce: [0u8; 12],
                    ciphertext: vec![1, 2, 3],
                },
                &NodeAddress::new("receiver.onion", 2),
            ),
            sender_storage_pub_key: sender.public_key_bytes(),
            receiver_storage_pub_key: receiver.public_key_bytes(),
        }
    }

    fn resign(mut data: ProtectedData, keypair: &Keypair, seq: i64) -> ProtectedData {
        let hash = data.payload.hash().unwrap();
        data.sequence_number = seq;
        data.signature =
            sign_with_domain(keypair, STORAGE_SIGNATURE_DOMAIN, &signed_bytes(&hash, seq)).unwrap();
        data
    }

    #[test]
    fn replayed_or_older_sequence_numbers_are_rejected() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let payload = owned(&owner, b"offer");

        let first = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert_eq!(first.sequence_number, 0);
        assert!(store.add(first.clone(), None));
        assert!(!store.add(first.clone(), None), "equal sequence number must be rejected");

        let newer = resign(first.clone(), &owner, 5);
        assert!(store.add(newer, None));
        let older = resign(first, &owner, 3);
        assert!(!store.add(older, None), "lower sequence number must be rejected");

        let hash = payload.hash().unwrap();
        assert_eq!(store.sequence_number(&hash), Some(5));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn invalid_signatures_are_rejected() {
        let (store, broadcaster) = store();
        store.set_authenticated(true);
        let listener = Arc::new(RecordingListener::default());
        store.add_listener(listener.clone());
        let owner = Keypair::generate();
        let mut data = store
            .get_data_with_signed_seq_nr(owner_payload(&owner), &owner)
            .unwrap();
        data.signature[0] ^= 0xff;

        assert!(!store.add(data, None));
        assert!(store.is_empty());
        assert_eq!(broadcaster.count(), 0, "rejected records are not propagated");
        assert!(listener.added.lock().unwrap().is_empty());
    }

    #[test]
    fn tampered_removal_keeps_the_entry() {
        let (store, broadcaster) = store();
        store.set_authenticated(true);
        let listener = Arc::new(RecordingListener::default());
        store.add_listener(listener.clone());
        let owner = Keypair::generate();
        let payload = owner_payload(&owner);

        let data = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert!(store.add(data, None));
        assert_eq!(broadcaster.count(), 1);

        let mut removal = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        removal.signature[10] ^= 0x01;
        assert!(!store.remove(removal, None));

        let hash = payload.hash().unwrap();
        assert!(store.contains(&hash));
        assert_eq!(store.sequence_number(&hash), Some(0));
        assert_eq!(broadcaster.count(), 1, "rejected removal is not propagated");
        assert_eq!(listener.added.lock().unwrap().len(), 1);
        assert!(listener.removed.lock().unwrap().is_empty());
    }

    fn owner_payload(owner: &Keypair) -> StoragePayload {
        owned(owner, b"payload")
    }

    #[test]
    fn signer_must_match_payload_owner() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let intruder = Keypair::generate();

        let forged = store
            .get_data_with_signed_seq_nr(owned(&owner, b"x"), &intruder)
            .unwrap();
        assert!(!store.add(forged, None));
    }

    #[test]
    fn mailbox_payload_requires_mailbox_entry() {
        let (store, _) = store();
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let data = store
            .get_data_with_signed_seq_nr(
                StoragePayload::Mailbox(mailbox_payload(&sender, &receiver)),
                &sender,
            )
            .unwrap();
        assert!(!store.add(data, None));
    }

    #[test]
    fn oversized_owned_payload_is_rejected() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let data = store
            .get_data_with_signed_seq_nr(owned(&owner, &vec![0u8; MAX_PAYLOAD_DATA_SIZE + 1]), &owner)
            .unwrap();
        assert!(!store.add(data, None));
    }

    #[test]
    fn removal_requires_owner_and_existing_entry() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let payload = owned(&owner, b"offer");

        let removal_of_missing = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert!(!store.remove(removal_of_missing, None));

        let data = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert!(store.add(data.clone(), None));

        let removal = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert_eq!(removal.sequence_number, 1);
        assert!(store.remove(removal, None));
        assert!(store.is_empty());

        // the original add replayed after removal stays stale
        assert!(!store.add(data, None));
    }

    #[test]
    fn removal_with_stale_sequence_number_is_rejected() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let payload = owned(&owner, b"offer");
        let data = store.get_data_with_signed_seq_nr(payload, &owner).unwrap();
        assert!(store.add(data.clone(), None));

        assert!(!store.remove(data, None));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn mailbox_removal_requires_receiver_key() {
        let (store, _) = store();
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let payload = mailbox_payload(&sender, &receiver);

        let added = store
            .get_mailbox_data_with_signed_seq_nr(payload.clone(), &sender, receiver.public_key_bytes())
            .unwrap();
        assert!(store.add_mailbox_data(added, None));

        // the sender cannot remove it
        let by_sender = store
            .get_mailbox_data_with_signed_seq_nr(payload.clone(), &sender, sender.public_key_bytes())
            .unwrap();
        assert!(!store.remove_mailbox_data(by_sender, None));

        // a third party naming the real receiver cannot remove it either
        let outsider = Keypair::generate();
        let by_outsider = store
            .get_mailbox_data_with_signed_seq_nr(payload.clone(), &outsider, receiver.public_key_bytes())
            .unwrap();
        assert!(!store.remove_mailbox_data(by_outsider, None));
        assert_eq!(store.len(), 1);

        let by_receiver = store
            .get_mailbox_data_with_signed_seq_nr(payload, &receiver, receiver.public_key_bytes())
            .unwrap();
        assert!(store.remove_mailbox_data(by_receiver, None));
        assert!(store.is_empty());
    }

    #[test]
    fn mailbox_add_requires_sender_to_sign() {
        let (store, _) = store();
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let payload = mailbox_payload(&sender, &receiver);
        let forged = store
            .get_mailbox_data_with_signed_seq_nr(payload, &receiver, receiver.public_key_bytes())
            .unwrap();
        assert!(!store.add_mailbox_data(forged, None));
    }

    #[test]
    fn broadcast_only_when_authenticated_and_excludes_sender() {
        let (store, broadcaster) = store();
        let owner = Keypair::generate();
        let peer = NodeAddress::new("peer.onion", 9000);

        let first = store.get_data_with_signed_seq_nr(owned(&owner, b"a"), &owner).unwrap();
        assert!(store.add(first, Some(&peer)));
        assert_eq!(broadcaster.count(), 0);

        store.set_authenticated(true);
        let second = store.get_data_with_signed_seq_nr(owned(&owner, b"b"), &owner).unwrap();
        assert!(store.add(second, Some(&peer)));

        let sent = broadcaster.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].0, NetworkMessage::AddData(_)));
        assert_eq!(sent[0].1.as_ref(), Some(&peer));
    }

    #[test]
    fn merge_does_not_broadcast() {
        let (store, broadcaster) = store();
        store.set_authenticated(true);
        let owner = Keypair::generate();
        let a = store.get_data_with_signed_seq_nr(owned(&owner, b"a"), &owner).unwrap();
        let b = store.get_data_with_signed_seq_nr(owned(&owner, b"b"), &owner).unwrap();

        let accepted = store.merge(
            vec![ProtectedEntry::Data(a.clone()), ProtectedEntry::Data(b), ProtectedEntry::Data(a)],
            None,
        );
        assert_eq!(accepted, 2);
        assert_eq!(broadcaster.count(), 0);
    }

    #[test]
    fn listeners_observe_mutations_until_removed() {
        let (store, _) = store();
        let listener = Arc::new(RecordingListener::default());
        let id = store.add_listener(listener.clone());
        let owner = Keypair::generate();
        let payload = owned(&owner, b"offer");

        let data = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert!(store.add(data, None));
        let removal = store.get_data_with_signed_seq_nr(payload, &owner).unwrap();
        assert!(store.remove(removal, None));

        assert_eq!(listener.added.lock().unwrap().len(), 1);
        assert_eq!(listener.removed.lock().unwrap().len(), 1);

        store.remove_listener(id);
        let other = store.get_data_with_signed_seq_nr(owned(&owner, b"next"), &owner).unwrap();
        assert!(store.add(other, None));
        assert_eq!(listener.added.lock().unwrap().len(), 1);
    }

    #[test]
    fn expired_entries_are_dropped_but_stay_stale() {
        let (store, _) = store();
        let listener = Arc::new(RecordingListener::default());
        store.add_listener(listener.clone());
        let owner = Keypair::generate();
        let payload = StoragePayload::Owned(OwnedPayload {
            owner_pub_key: owner.public_key_bytes(),
            ttl_ms: 0,
            data: b"short lived".to_vec(),
            owner_address: None,
        });

        let data = store.get_data_with_signed_seq_nr(payload, &owner).unwrap();
        assert!(store.add(data.clone(), None));
        assert_eq!(store.remove_expired(), 1);
        assert!(store.is_empty());
        assert_eq!(listener.removed.lock().unwrap().len(), 1);

        assert!(!store.add(data, None), "replay after expiry must be rejected");
    }

    #[test]
    fn refresh_ttl_requires_owner_and_newer_sequence_number() {
        let (store, broadcaster) = store();
        store.set_authenticated(true);
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let payload = owned(&owner, b"offer");

        let data = store.get_data_with_signed_seq_nr(payload.clone(), &owner).unwrap();
        assert!(store.add(data, None));

        let forged = store.get_refresh_ttl_message(&payload, &intruder).unwrap();
        assert!(!store.refresh_ttl(forged, None));

        let refresh = store.get_refresh_ttl_message(&payload, &owner).unwrap();
        assert_eq!(refresh.sequence_number, 1);
        assert!(store.refresh_ttl(refresh.clone(), None));
        assert!(!store.refresh_ttl(refresh, None), "replayed refresh must be rejected");

        // the refreshed record is still valid for a fresh replica
        let (replica, _) = self::store();
        let hash = payload.hash().unwrap();
        let entry = store.get(&hash).unwrap();
        assert_eq!(entry.data().sequence_number, 1);
        assert!(replica.add_entry(entry, None));

        // add + refresh
        assert_eq!(broadcaster.count(), 2);
    }

    #[test]
    fn mailbox_entries_cannot_be_refreshed() {
        let (store, _) = store();
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let payload = mailbox_payload(&sender, &receiver);
        let data = store
            .get_mailbox_data_with_signed_seq_nr(payload.clone(), &sender, receiver.public_key_bytes())
            .unwrap();
        assert!(store.add_mailbox_data(data, None));

        let refresh = store
            .get_refresh_ttl_message(&StoragePayload::Mailbox(payload), &sender)
            .unwrap();
        assert!(!store.refresh_ttl(refresh, None));
    }

    #[test]
    fn owner_online_payloads_follow_owner_connection() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let owner_address = NodeAddress::new("owner.onion", 9000);
        let online_only = StoragePayload::Owned(OwnedPayload {
            owner_pub_key: owner.public_key_bytes(),
            ttl_ms: 60_000,
            data: b"live offer".to_vec(),
            owner_address: Some(owner_address.clone()),
        });
        let durable = owned(&owner, b"durable");

        for payload in [online_only, durable] {
            let data = store.get_data_with_signed_seq_nr(payload, &owner).unwrap();
            assert!(store.add(data, None));
        }

        assert_eq!(store.on_peer_disconnected(&NodeAddress::new("other", 1)), 0);
        assert_eq!(store.on_peer_disconnected(&owner_address), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn old_sequence_numbers_are_purged_above_threshold() {
        let (store, _) = store();
        {
            let mut state = store.state();
            for i in 0..=SEQUENCE_NUMBER_PURGE_THRESHOLD as u32 {
                let mut key = [0u8; 32];
                key[..4].copy_from_slice(&i.to_be_bytes());
                state.sequence_numbers.insert(
                    PayloadHash(key),
                    SequenceRecord {
                        sequence_number: 1,
                        recorded_at_ms: 0,
                    },
                );
            }
        }
        store.remove_expired();
        assert_eq!(store.state().sequence_numbers.len(), 0);
    }

    #[test]
    fn shut_down_store_rejects_mutations() {
        let (store, _) = store();
        let owner = Keypair::generate();
        let data = store.get_data_with_signed_seq_nr(owned(&owner, b"a"), &owner).unwrap();
        store.shut_down();
        store.shut_down();
        assert!(!store.add(data, None));
    }
}
