//! # Mailbox Messaging
//!
//! Store-and-forward delivery of sealed messages.
//!
//! ## Send Path
//!
//! A mailbox message first tries the direct route. If the receiver cannot be
//! authenticated or the send fails, the sealed message is parked in the
//! protected data store as a mailbox entry signed by the sender and addressed
//! to the receiver's storage key. See [`SendOutcome`].
//!
//! ## Receive Path
//!
//! Nodes cannot tell which mailbox entries are theirs without trying to open
//! them. Every sealed message observed (direct or stored) is run through
//! [`open_sealed`]: the address prefix hash is checked first, then decryption
//! is attempted. Failure is the common case and stays silent.
//!
//! Opened mailbox entries are tracked by message uid in the [`Inbox`] until
//! the receiver removes them from the store. A uid is announced at most once,
//! no matter how often the entry is observed again (replication echo,
//! dataset merges, restarts of the bootstrap).

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::identity::NodeAddress;
use crate::messages::{DecryptedMessageWithPubKey, MessageUid, PrefixedSealedMessage};
use crate::protocols::CryptoService;
use crate::storage::ProtectedMailboxData;

/// Default number of resolved uids remembered for de-duplication.
pub const DEFAULT_RESOLVED_CAPACITY: usize = 4096;

/// Outcome of an encrypted send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered directly to the receiver.
    Arrived,
    /// Receiver unreachable; the message waits in the replicated store.
    StoredInMailbox,
    /// Neither route worked.
    Fault(String),
}

/// Opens a sealed message if it is addressed to us.
///
/// Returns `None` for messages meant for someone else; that is the expected
/// result for most mailbox entries and is only traced.
pub fn open_sealed(
    crypto: &dyn CryptoService,
    own_address: &NodeAddress,
    prefixed: &PrefixedSealedMessage,
) -> Option<DecryptedMessageWithPubKey> {
    if !prefixed.matches_prefix_of(own_address) {
        trace!(sender = %prefixed.sender_address, "address prefix mismatch, skipping");
        return None;
    }
    match crypto.decrypt_and_verify(&prefixed.sealed) {
        Ok(decrypted) => Some(decrypted),
        Err(e) => {
            trace!(
                sender = %prefixed.sender_address,
                error = %e,
                "could not open sealed message, expected if not intended for us"
            );
            None
        }
    }
}

/// Mailbox entries opened locally, by uid.
pub(crate) struct Inbox {
    pending: HashMap<MessageUid, ProtectedMailboxData>,
    resolved: LruCache<MessageUid, ()>,
}

impl Inbox {
    pub fn new(resolved_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(resolved_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: HashMap::new(),
            resolved: LruCache::new(capacity),
        }
    }

    /// Tries to open a stored mailbox entry. Returns the decrypted message and
    /// its sender address the first time a uid is seen.
    pub fn observe(
        &mut self,
        crypto: &dyn CryptoService,
        own_address: &NodeAddress,
        entry: &ProtectedMailboxData,
    ) -> Option<(DecryptedMessageWithPubKey, NodeAddress)> {
        let payload = entry.mailbox_payload()?;
        let decrypted = open_sealed(crypto, own_address, &payload.sealed_message)?;

        let Some(mailbox) = decrypted.message.as_mailbox() else {
            warn!(
                sender = %payload.sealed_message.sender_address,
                "mailbox entry carries a direct message, ignoring"
            );
            return None;
        };
        let uid = mailbox.uid;
        if self.pending.contains_key(&uid) || self.resolved.contains(&uid) {
            trace!(uid = %uid, "mailbox message already known");
            return None;
        }

        debug!(uid = %uid, sender = %mailbox.sender_address, "mailbox message received");
        let sender = mailbox.sender_address.clone();
        self.pending.insert(uid, entry.clone());
        Some((decrypted, sender))
    }

    pub fn get(&self, uid: &MessageUid) -> Option<&ProtectedMailboxData> {
        self.pending.get(uid)
    }

    /// Evicts `uid` after its store entry was removed.
    pub fn resolve(&mut self, uid: MessageUid) {
        self.pending.remove(&uid);
        self.resolved.put(uid, ());
    }

    /// Evicts the message stored as `entry`, which left the store without a
    /// local removal (expiry, a removal replicated from another node).
    pub fn forget(&mut self, entry: &ProtectedMailboxData) -> Option<MessageUid> {
        let uid = self
            .pending
            .iter()
            .find(|(_, pending)| pending.data.payload == entry.data.payload)
            .map(|(uid, _)| *uid)?;
        self.resolve(uid);
        Some(uid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
