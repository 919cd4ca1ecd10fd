//! # Bootstrap Coordinator
//!
//! Sequences a node's startup: request the shared dataset from seed nodes,
//! wait until the local endpoint is published, then authenticate to the seed
//! nodes that answered.
//!
//! The coordinator is a pure state machine. [`BootstrapCoordinator::handle`]
//! is the only way its state changes; it consumes a [`BootstrapEvent`] and
//! returns the [`BootstrapAction`]s the caller must carry out (send a request,
//! arm a timer, notify listeners). No I/O happens here.
//!
//! ## States
//!
//! ```text
//! Init ──TransportReady──▶ RequestingData ──data──▶ WaitingLocalReady
//!                               │                        │
//!                               └──────(both ready)──────┴──▶ Authenticating ──▶ Authenticated
//! ```
//!
//! Authentication needs both conditions: a dataset was received (or there
//! was nothing to request) and the local endpoint is reachable. They may be
//! reached in either order.
//!
//! ## Seed Node Selection
//!
//! - Own address is never a candidate; the rest are shuffled once.
//! - One candidate is contacted at a time.
//! - A failed candidate is replaced immediately by the next one.
//! - After a success, another candidate is contacted after a random 1-3 s
//!   delay until `min_connected` seed nodes answered or none remain.
//!
//! ## Loopback Detection
//!
//! Every request carries a fresh nonce. A node that receives a dataset request
//! bearing one of its own nonces is talking to itself through an alias of its
//! own address; it must not answer and must close the connection. The alias is
//! then treated like a failed candidate and never counts as a connected seed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::identity::NodeAddress;

/// Number of seed nodes that must answer before the coordinator stops asking.
pub const DEFAULT_MIN_CONNECTED_SEED_NODES: usize = 2;

/// Lower bound of the delay between two successful seed node requests.
pub const DEFAULT_RETRY_DELAY_MIN: Duration = Duration::from_secs(1);

/// Upper bound of the delay between two successful seed node requests.
pub const DEFAULT_RETRY_DELAY_MAX: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BootstrapState {
    Init,
    RequestingData,
    WaitingLocalReady,
    Authenticating,
    Authenticated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapEvent {
    TransportReady {
        local_address: Option<NodeAddress>,
        seed_nodes: Vec<NodeAddress>,
    },
    /// A dataset request reached its target.
    RequestSent(NodeAddress),
    /// A dataset request could not be delivered.
    RequestFailed(NodeAddress),
    RetryTimerElapsed,
    /// A dataset request carrying one of our nonces came back to us.
    LoopbackDetected { nonce: u64 },
    DataSetReceived,
    LocalReady,
    PeerAuthenticated(NodeAddress),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapAction {
    SendDataRequest { target: NodeAddress, nonce: u64 },
    ScheduleRetry(Duration),
    DataReceived,
    AllDataReceived,
    NoSeedNodeAvailable,
    Authenticate(Vec<NodeAddress>),
    Authenticated,
}

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub min_connected_seed_nodes: usize,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            min_connected_seed_nodes: DEFAULT_MIN_CONNECTED_SEED_NODES,
            retry_delay_min: DEFAULT_RETRY_DELAY_MIN,
            retry_delay_max: DEFAULT_RETRY_DELAY_MAX,
        }
    }
}

#[derive(Debug)]
pub struct BootstrapCoordinator {
    config: BootstrapConfig,
    local_address: Option<NodeAddress>,
    remaining: Vec<NodeAddress>,
    connected_seed_nodes: Vec<NodeAddress>,
    nonces: HashMap<u64, NodeAddress>,
    loopback_addresses: HashSet<NodeAddress>,
    started: bool,
    all_seed_nodes_requested: bool,
    data_received: bool,
    all_data_reported: bool,
    local_ready: bool,
    authentication_started: bool,
    authenticated: bool,
}

impl BootstrapCoordinator {
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            local_address: None,
            remaining: Vec::new(),
            connected_seed_nodes: Vec::new(),
            nonces: HashMap::new(),
            loopback_addresses: HashSet::new(),
            started: false,
            all_seed_nodes_requested: false,
            data_received: false,
            all_data_reported: false,
            local_ready: false,
            authentication_started: false,
            authenticated: false,
        }
    }

    pub fn state(&self) -> BootstrapState {
        if self.authenticated {
            BootstrapState::Authenticated
        } else if self.authentication_started {
            BootstrapState::Authenticating
        } else if self.data_received {
            BootstrapState::WaitingLocalReady
        } else if self.started {
            BootstrapState::RequestingData
        } else {
            BootstrapState::Init
        }
    }

    /// Whether a dataset request with this nonce originated here.
    pub fn is_own_nonce(&self, nonce: u64) -> bool {
        self.nonces.contains_key(&nonce)
    }

    pub fn is_data_received(&self) -> bool {
        self.data_received
    }

    pub fn is_local_ready(&self) -> bool {
        self.local_ready
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn all_seed_nodes_requested(&self) -> bool {
        self.all_seed_nodes_requested
    }

    pub fn connected_seed_nodes(&self) -> &[NodeAddress] {
        &self.connected_seed_nodes
    }

    /// Both readiness conditions hold.
    pub fn ready_to_authenticate(&self) -> bool {
        self.data_received && self.local_ready
    }

    /// Applies `event` and returns the actions the caller must perform.
    pub fn handle<R: Rng + ?Sized>(
        &mut self,
        event: BootstrapEvent,
        rng: &mut R,
    ) -> Vec<BootstrapAction> {
        let mut actions = Vec::new();
        match event {
            BootstrapEvent::TransportReady {
                local_address,
                seed_nodes,
            } => {
                if self.started {
                    return actions;
                }
                self.started = true;
                self.local_address = local_address;

                let mut candidates: Vec<NodeAddress> = Vec::with_capacity(seed_nodes.len());
                for addr in seed_nodes {
                    if Some(&addr) != self.local_address.as_ref() && !candidates.contains(&addr) {
                        candidates.push(addr);
                    }
                }
                candidates.shuffle(rng);
                self.remaining = candidates;

                if self.remaining.is_empty() {
                    info!("no seed nodes to request data from");
                    self.mark_all_requested(&mut actions);
                    self.mark_data_received(&mut actions);
                } else {
                    self.request_next(&mut actions, rng);
                }
            }
            BootstrapEvent::RequestSent(target) => {
                if self.connected_seed_nodes.contains(&target)
                    || self.loopback_addresses.contains(&target)
                {
                    return actions;
                }
                debug!(seed = %target, "seed node reached");
                self.connected_seed_nodes.push(target);
                if self.connected_seed_nodes.len() < self.config.min_connected_seed_nodes
                    && !self.remaining.is_empty()
                {
                    actions.push(BootstrapAction::ScheduleRetry(self.retry_delay(rng)));
                } else {
                    self.mark_all_requested(&mut actions);
                }
            }
            BootstrapEvent::RequestFailed(target) => {
                debug!(seed = %target, remaining = self.remaining.len(), "seed node request failed");
                if !self.remaining.is_empty() {
                    self.request_next(&mut actions, rng);
                } else {
                    self.mark_all_requested(&mut actions);
                    if self.connected_seed_nodes.is_empty() {
                        warn!("no seed node available");
                        actions.push(BootstrapAction::NoSeedNodeAvailable);
                        self.mark_data_received(&mut actions);
                    }
                }
            }
            BootstrapEvent::RetryTimerElapsed => {
                if !self.remaining.is_empty() && !self.all_seed_nodes_requested {
                    self.request_next(&mut actions, rng);
                }
            }
            BootstrapEvent::LoopbackDetected { nonce } => {
                let Some(alias) = self.nonces.get(&nonce).cloned() else {
                    return actions;
                };
                if !self.loopback_addresses.insert(alias.clone()) {
                    return actions;
                }
                debug!(seed = %alias, "seed node is ourselves");
                self.connected_seed_nodes.retain(|addr| addr != &alias);
                if !self.remaining.is_empty() {
                    self.request_next(&mut actions, rng);
                } else {
                    self.mark_all_requested(&mut actions);
                    if self.connected_seed_nodes.is_empty() {
                        self.mark_data_received(&mut actions);
                    }
                }
            }
            BootstrapEvent::DataSetReceived => {
                self.mark_data_received(&mut actions);
            }
            BootstrapEvent::LocalReady => {
                self.local_ready = true;
                self.maybe_authenticate(&mut actions);
            }
            BootstrapEvent::PeerAuthenticated(peer) => {
                if !self.authenticated {
                    info!(peer = %peer, "authenticated to first peer");
                    self.authenticated = true;
                    actions.push(BootstrapAction::Authenticated);
                }
            }
        }
        actions
    }

    fn request_next<R: Rng + ?Sized>(&mut self, actions: &mut Vec<BootstrapAction>, rng: &mut R) {
        if let Some(target) = self.remaining.pop() {
            let nonce = rng.next_u64();
            self.nonces.insert(nonce, target.clone());
            actions.push(BootstrapAction::SendDataRequest { target, nonce });
        }
    }

    fn retry_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.config.retry_delay_min.as_millis() as u64;
        let max = self.config.retry_delay_max.as_millis() as u64;
        if max <= min {
            return self.config.retry_delay_min;
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }

    fn mark_all_requested(&mut self, actions: &mut Vec<BootstrapAction>) {
        if !self.all_seed_nodes_requested {
            self.all_seed_nodes_requested = true;
            self.maybe_report_all_data(actions);
        }
    }

    fn mark_data_received(&mut self, actions: &mut Vec<BootstrapAction>) {
        if self.data_received {
            return;
        }
        self.data_received = true;
        actions.push(BootstrapAction::DataReceived);
        self.maybe_report_all_data(actions);
        self.maybe_authenticate(actions);
    }

    fn maybe_report_all_data(&mut self, actions: &mut Vec<BootstrapAction>) {
        if self.data_received && self.all_seed_nodes_requested && !self.all_data_reported {
            self.all_data_reported = true;
            actions.push(BootstrapAction::AllDataReceived);
        }
    }

    fn maybe_authenticate(&mut self, actions: &mut Vec<BootstrapAction>) {
        if !self.ready_to_authenticate() || self.authentication_started {
            return;
        }
        self.authentication_started = true;
        let peers: Vec<NodeAddress> = self
            .connected_seed_nodes
            .iter()
            .filter(|addr| Some(*addr) != self.local_address.as_ref())
            .cloned()
            .collect();
        debug!(candidates = peers.len(), "starting authentication");
        actions.push(BootstrapAction::Authenticate(peers));
    }
}
