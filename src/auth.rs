//! Peer authentication bookkeeping.
//!
//! Authentication proves that a peer is reachable at the address it claims:
//!
//! 1. A sends `AuthenticationRequest { sender: A, nonce }` to B over some
//!    connection C.
//! 2. B calls the claimed address back with
//!    `AuthenticationResponse { sender: B, requester_nonce: nonce, challenge }`,
//!    where `challenge` is fresh. Nothing is bound to A yet.
//! 3. A matches the nonce against its pending attempt, which authenticates B,
//!    and echoes `AuthenticationConfirm { sender: A, challenge }` to B.
//! 4. B matches the challenge. Only a node reachable at A has seen it, so B
//!    now binds C and the confirming connection to A.
//!
//! A node that merely claims A's address never receives the challenge and
//! stays unauthenticated.
//!
//! This module holds the state only: pending attempts, open challenges, the
//! authenticated peer set, the connection → peer mapping and callers waiting
//! for a result. The service actor performs the I/O.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::identity::NodeAddress;
use crate::protocols::ConnectionId;

/// Maximum number of unanswered challenges.
/// SECURITY: Bounds the state unauthenticated requesters can create.
pub const MAX_OPEN_CHALLENGES: usize = 1024;

struct PendingAuthentication {
    peer: NodeAddress,
    started: Instant,
}

/// A callback sent to a claimed address, waiting to be echoed.
struct OpenChallenge {
    peer: NodeAddress,
    request_connection: ConnectionId,
    started: Instant,
}

#[derive(Default)]
pub(crate) struct PeerAuthentication {
    authenticated: HashSet<NodeAddress>,
    pending: HashMap<u64, PendingAuthentication>,
    challenges: HashMap<u64, OpenChallenge>,
    waiters: HashMap<NodeAddress, Vec<oneshot::Sender<bool>>>,
    connection_peers: HashMap<ConnectionId, NodeAddress>,
    stopped: bool,
}

impl PeerAuthentication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self, peer: &NodeAddress) -> bool {
        self.authenticated.contains(peer)
    }

    pub fn authenticated_peers(&self) -> Vec<NodeAddress> {
        let mut peers: Vec<_> = self.authenticated.iter().cloned().collect();
        peers.sort();
        peers
    }

    fn is_pending(&self, peer: &NodeAddress) -> bool {
        self.pending.values().any(|p| &p.peer == peer)
    }

    // ------------------------------------------------------------------------
    // Initiator side
    // ------------------------------------------------------------------------

    /// Registers a new attempt for `peer` and returns its nonce, or `None` if
    /// one is already in flight (or the peer is authenticated).
    pub fn begin<R: RngCore + ?Sized>(&mut self, peer: &NodeAddress, rng: &mut R) -> Option<u64> {
        if self.stopped || self.is_authenticated(peer) || self.is_pending(peer) {
            return None;
        }
        let nonce = rng.next_u64();
        self.pending.insert(
            nonce,
            PendingAuthentication {
                peer: peer.clone(),
                started: Instant::now(),
            },
        );
        trace!(peer = %peer, "authentication started");
        Some(nonce)
    }

    /// Parks `reply` until `peer` is authenticated or the attempt fails.
    pub fn add_waiter(&mut self, peer: &NodeAddress, reply: oneshot::Sender<bool>) {
        if self.stopped {
            let _ = reply.send(false);
            return;
        }
        if self.is_authenticated(peer) {
            let _ = reply.send(true);
            return;
        }
        self.waiters.entry(peer.clone()).or_default().push(reply);
    }

    fn resolve_waiters(&mut self, peer: &NodeAddress, result: bool) {
        if let Some(waiters) = self.waiters.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result);
            }
        }
    }

    /// Returns `true` if `peer` was not authenticated before.
    fn mark_authenticated(&mut self, peer: NodeAddress, connection: ConnectionId) -> bool {
        self.bind_connection(connection, peer.clone());
        self.pending.retain(|_, p| p.peer != peer);
        self.resolve_waiters(&peer, true);
        self.authenticated.insert(peer)
    }

    /// Handles an `AuthenticationResponse` that arrived on `connection`.
    /// Returns the peer if the response matches a pending attempt from that
    /// peer; the caller then echoes the challenge.
    pub fn on_response(
        &mut self,
        sender: &NodeAddress,
        requester_nonce: u64,
        connection: ConnectionId,
    ) -> Option<NodeAddress> {
        if self.stopped {
            return None;
        }
        let matches = self
            .pending
            .get(&requester_nonce)
            .is_some_and(|p| &p.peer == sender);
        if !matches {
            debug!(peer = %sender, "authentication response without matching request");
            return None;
        }
        self.pending.remove(&requester_nonce);
        self.mark_authenticated(sender.clone(), connection);
        Some(sender.clone())
    }

    /// The request for `nonce` could not be delivered.
    pub fn on_failed(&mut self, nonce: u64) {
        if let Some(pending) = self.pending.remove(&nonce) {
            debug!(peer = %pending.peer, "authentication failed");
            self.resolve_waiters(&pending.peer, false);
        }
    }

    // ------------------------------------------------------------------------
    // Responder side
    // ------------------------------------------------------------------------

    /// Opens a challenge for a peer claiming `peer` on `request_connection`.
    /// Returns `None` when stopped or when too many challenges are open.
    pub fn challenge<R: RngCore + ?Sized>(
        &mut self,
        peer: &NodeAddress,
        request_connection: ConnectionId,
        rng: &mut R,
    ) -> Option<u64> {
        if self.stopped {
            return None;
        }
        if self.challenges.len() >= MAX_OPEN_CHALLENGES {
            warn!(peer = %peer, "too many open authentication challenges, ignoring request");
            return None;
        }
        let challenge = rng.next_u64();
        self.challenges.insert(
            challenge,
            OpenChallenge {
                peer: peer.clone(),
                request_connection,
                started: Instant::now(),
            },
        );
        Some(challenge)
    }

    /// The callback carrying `challenge` could not be delivered.
    pub fn on_challenge_failed(&mut self, challenge: u64) {
        if let Some(open) = self.challenges.remove(&challenge) {
            debug!(peer = %open.peer, "claimed address unreachable");
        }
    }

    /// Handles an `AuthenticationConfirm` that arrived on `connection`.
    /// Returns the peer if it echoed a challenge sent to its address.
    pub fn on_confirm(
        &mut self,
        sender: &NodeAddress,
        challenge: u64,
        connection: ConnectionId,
    ) -> Option<NodeAddress> {
        if self.stopped {
            return None;
        }
        let open = self.challenges.remove(&challenge)?;
        if &open.peer != sender {
            debug!(peer = %sender, claimed = %open.peer, "challenge echoed for another address");
            return None;
        }
        self.bind_connection(open.request_connection, open.peer.clone());
        self.mark_authenticated(open.peer.clone(), connection);
        Some(open.peer)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Fails attempts and drops challenges older than `timeout`.
    pub fn expire_pending(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) >= timeout)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in &expired {
            self.on_failed(*nonce);
        }
        let challenges = self.challenges.len();
        self.challenges
            .retain(|_, open| now.duration_since(open.started) < timeout);
        expired.len() + challenges - self.challenges.len()
    }

    /// Associates a connection with an authenticated peer.
    fn bind_connection(&mut self, connection: ConnectionId, peer: NodeAddress) {
        self.connection_peers.insert(connection, peer);
    }

    pub fn peer_for(&self, connection: ConnectionId) -> Option<&NodeAddress> {
        self.connection_peers.get(&connection)
    }

    /// Forgets a closed connection. Returns the peer if it lost its last
    /// connection and is no longer authenticated.
    pub fn on_disconnect(
        &mut self,
        connection: ConnectionId,
        peer: Option<&NodeAddress>,
    ) -> Option<NodeAddress> {
        self.challenges
            .retain(|_, open| open.request_connection != connection);
        let peer = self
            .connection_peers
            .remove(&connection)
            .or_else(|| peer.cloned())?;
        let still_connected = self.connection_peers.values().any(|p| p == &peer);
        if !still_connected && self.authenticated.remove(&peer) {
            debug!(peer = %peer, "authenticated peer disconnected");
            return Some(peer);
        }
        None
    }

    /// Fails every waiter and rejects further attempts.
    pub fn shut_down(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.pending.clear();
        self.challenges.clear();
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(false);
            }
        }
        self.authenticated.clear();
        self.connection_peers.clear();
    }
}
