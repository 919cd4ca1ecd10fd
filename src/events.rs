//! Listener registration for service events.
//!
//! Every kind of listener the service supports is a [`Subscription`] on an
//! [`EventBus`]. Subscribing returns a receiver handle; dropping it
//! unsubscribes. The subscriber list is copy-on-write, so emitting never
//! blocks a concurrent subscribe and a subscriber added during an emission
//! simply misses that event.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::identity::NodeAddress;
use crate::messages::{DecryptedMessageWithPubKey, NetworkMessage};
use crate::protocols::ConnectionId;
use crate::storage::ProtectedEntry;

/// Lifecycle notifications, in the order a healthy node emits them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    TransportReady,
    HiddenServicePublished(NodeAddress),
    SetupFailed(String),
    /// The first dataset was merged (or there was nothing to request).
    RequestingDataCompleted,
    /// Every seed node candidate failed.
    NoSeedNodeAvailable,
    /// Data received and no further seed node will be asked.
    AllDataReceived,
    /// The first peer authenticated; sends and store mutations are open.
    Authenticated,
}

/// Any message received from the transport.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub connection: ConnectionId,
    pub peer: Option<NodeAddress>,
    pub message: NetworkMessage,
}

/// A sealed message sent directly to us, opened and verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedDirectMessage {
    pub message: DecryptedMessageWithPubKey,
    pub peer: NodeAddress,
}

/// A mailbox entry addressed to us, opened and verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMailboxMessage {
    pub message: DecryptedMessageWithPubKey,
    pub sender: NodeAddress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageEvent {
    Added(ProtectedEntry),
    Removed(ProtectedEntry),
}

/// Receiving end of an [`EventBus`].
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub struct EventBus<T> {
    subscribers: RwLock<Arc<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(tx);
        *guard = Arc::new(next);
        Subscription { rx }
    }

    /// Delivers `event` to every live subscriber and returns how many got it.
    pub fn emit(&self, event: T) -> usize {
        let snapshot = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        let mut delivered = 0;
        let mut saw_closed = false;
        for tx in snapshot.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                saw_closed = true;
            }
        }

        if saw_closed {
            let mut guard = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
            let next: Vec<_> = guard.iter().filter(|tx| !tx.is_closed()).cloned().collect();
            *guard = Arc::new(next);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All buses owned by one service instance.
#[derive(Default)]
pub(crate) struct ServiceEvents {
    pub lifecycle: EventBus<ServiceEvent>,
    pub messages: EventBus<InboundMessage>,
    pub decrypted_direct: EventBus<DecryptedDirectMessage>,
    pub decrypted_mailbox: EventBus<DecryptedMailboxMessage>,
    pub storage: EventBus<StorageEvent>,
}
