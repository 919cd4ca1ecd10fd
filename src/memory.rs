//! In-process transport.
//!
//! [`MemoryNetwork`] routes [`NetworkMessage`]s between [`MemoryTransport`]s
//! living in the same process. It behaves like the real transport where the
//! service can observe it:
//!
//! - sending to an unregistered address fails (the node is offline)
//! - a connection is reused per (initiator, dialed address) pair
//! - the accepting side never learns the initiator's address
//! - closing or shutting down emits `Disconnected` on the affected ends
//!
//! Aliases let one node be reachable under a second address, which is how a
//! seed list that contains ourselves under another name is simulated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::NodeAddress;
use crate::messages::NetworkMessage;
use crate::protocols::{ConnectionId, Transport, TransportEvent};

struct Link {
    initiator: NodeAddress,
    acceptor: NodeAddress,
    dialed: NodeAddress,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeAddress, mpsc::Sender<TransportEvent>>,
    aliases: HashMap<NodeAddress, NodeAddress>,
    links: HashMap<ConnectionId, Link>,
    next_connection: u64,
}

impl NetworkState {
    fn resolve(&self, address: &NodeAddress) -> NodeAddress {
        self.aliases
            .get(address)
            .cloned()
            .unwrap_or_else(|| address.clone())
    }
}

/// Shared routing table. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes `target` reachable under `alias` as well.
    pub fn register_alias(&self, alias: NodeAddress, target: NodeAddress) {
        self.state().aliases.insert(alias, target);
    }

    pub fn is_online(&self, address: &NodeAddress) -> bool {
        let state = self.state();
        let resolved = state.resolve(address);
        state.nodes.contains_key(&resolved)
    }

    pub fn connection_count(&self) -> usize {
        self.state().links.len()
    }

    fn register(&self, address: NodeAddress, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let mut state = self.state();
        if state.nodes.contains_key(&address) {
            bail!("address {} already registered", address);
        }
        state.nodes.insert(address, events);
        Ok(())
    }

    /// Removes `address` and returns the remote ends of its links.
    fn unregister(&self, address: &NodeAddress) -> Vec<(mpsc::Sender<TransportEvent>, TransportEvent)> {
        let mut state = self.state();
        state.nodes.remove(address);

        let dropped: Vec<ConnectionId> = state
            .links
            .iter()
            .filter(|(_, link)| &link.initiator == address || &link.acceptor == address)
            .map(|(id, _)| *id)
            .collect();

        let mut notifications = Vec::new();
        for id in dropped {
            let Some(link) = state.links.remove(&id) else {
                continue;
            };
            let (remote, peer) = if &link.initiator == address {
                (link.acceptor, None)
            } else {
                (link.initiator, Some(link.dialed))
            };
            if &remote == address {
                continue;
            }
            if let Some(tx) = state.nodes.get(&remote) {
                notifications.push((
                    tx.clone(),
                    TransportEvent::Disconnected {
                        connection: id,
                        peer,
                        intended: false,
                    },
                ));
            }
        }
        notifications
    }

    /// Finds or opens a link from `from` to `dialed`.
    fn connect(
        &self,
        from: &NodeAddress,
        dialed: &NodeAddress,
    ) -> Result<(ConnectionId, mpsc::Sender<TransportEvent>, Vec<(mpsc::Sender<TransportEvent>, TransportEvent)>)> {
        let mut state = self.state();
        let acceptor = state.resolve(dialed);
        let target = state
            .nodes
            .get(&acceptor)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not reachable", dialed))?;

        let existing = state
            .links
            .iter()
            .find(|(_, link)| &link.initiator == from && &link.dialed == dialed)
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            return Ok((id, target, Vec::new()));
        }

        state.next_connection += 1;
        let id = ConnectionId(state.next_connection);
        state.links.insert(
            id,
            Link {
                initiator: from.clone(),
                acceptor: acceptor.clone(),
                dialed: dialed.clone(),
            },
        );

        let mut opened = vec![(
            target.clone(),
            TransportEvent::Connected {
                connection: id,
                peer: None,
            },
        )];
        if let Some(own) = state.nodes.get(from) {
            opened.push((
                own.clone(),
                TransportEvent::Connected {
                    connection: id,
                    peer: Some(dialed.clone()),
                },
            ));
        }
        Ok((id, target, opened))
    }

    /// The other end of `connection`, seen from `from`.
    fn route_reply(
        &self,
        from: &NodeAddress,
        connection: ConnectionId,
    ) -> Result<(mpsc::Sender<TransportEvent>, Option<NodeAddress>)> {
        let state = self.state();
        let link = state
            .links
            .get(&connection)
            .ok_or_else(|| anyhow!("{} is closed", connection))?;
        let (remote, peer) = if &link.acceptor == from {
            (&link.initiator, Some(link.dialed.clone()))
        } else {
            (&link.acceptor, None)
        };
        let tx = state
            .nodes
            .get(remote)
            .cloned()
            .ok_or_else(|| anyhow!("{} is not reachable", remote))?;
        Ok((tx, peer))
    }

    fn disconnect(&self, connection: ConnectionId) -> Vec<(mpsc::Sender<TransportEvent>, TransportEvent)> {
        let mut state = self.state();
        let Some(link) = state.links.remove(&connection) else {
            return Vec::new();
        };
        let mut notifications = Vec::new();
        if let Some(tx) = state.nodes.get(&link.initiator) {
            notifications.push((
                tx.clone(),
                TransportEvent::Disconnected {
                    connection,
                    peer: Some(link.dialed.clone()),
                    intended: true,
                },
            ));
        }
        if let Some(tx) = state.nodes.get(&link.acceptor) {
            notifications.push((
                tx.clone(),
                TransportEvent::Disconnected {
                    connection,
                    peer: None,
                    intended: true,
                },
            ));
        }
        notifications
    }
}

async fn deliver(notifications: Vec<(mpsc::Sender<TransportEvent>, TransportEvent)>) {
    for (tx, event) in notifications {
        let _ = tx.send(event).await;
    }
}

/// A node's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: NodeAddress,
    manual_publish: bool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<(NodeAddress, NetworkMessage)>>,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork, address: NodeAddress) -> Self {
        Self {
            network,
            address,
            manual_publish: false,
            events: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Delays `HiddenServicePublished` until [`publish`](Self::publish).
    pub fn with_manual_publish(mut self) -> Self {
        self.manual_publish = true;
        self
    }

    fn events(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn publish(&self) -> Result<()> {
        let events = self.events().ok_or_else(|| anyhow!("transport not started"))?;
        events
            .send(TransportEvent::HiddenServicePublished(self.address.clone()))
            .await
            .map_err(|_| anyhow!("service stopped"))
    }

    /// Every message passed to [`Transport::send`], in order.
    pub fn sent_messages(&self) -> Vec<(NodeAddress, NetworkMessage)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        {
            let mut slot = self.events.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                bail!("transport already started");
            }
            *slot = Some(events.clone());
        }
        self.network.register(self.address.clone(), events.clone())?;
        debug!(address = %self.address, "memory transport started");

        events
            .send(TransportEvent::Ready)
            .await
            .map_err(|_| anyhow!("service stopped"))?;
        if !self.manual_publish {
            events
                .send(TransportEvent::HiddenServicePublished(self.address.clone()))
                .await
                .map_err(|_| anyhow!("service stopped"))?;
        }
        Ok(())
    }

    async fn send(&self, to: &NodeAddress, message: NetworkMessage) -> Result<ConnectionId> {
        if self.events().is_none() {
            bail!("transport not started");
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((to.clone(), message.clone()));

        let (connection, target, opened) = self.network.connect(&self.address, to)?;
        deliver(opened).await;
        trace!(from = %self.address, to = %to, connection = %connection, kind = message.kind(), "memory send");
        target
            .send(TransportEvent::Message {
                connection,
                peer: None,
                message,
            })
            .await
            .map_err(|_| anyhow!("{} is not reachable", to))?;
        Ok(connection)
    }

    async fn reply(&self, connection: ConnectionId, message: NetworkMessage) -> Result<()> {
        let (target, peer) = self.network.route_reply(&self.address, connection)?;
        target
            .send(TransportEvent::Message {
                connection,
                peer,
                message,
            })
            .await
            .map_err(|_| anyhow!("{} is closed", connection))
    }

    async fn close(&self, connection: ConnectionId) {
        deliver(self.network.disconnect(connection)).await;
    }

    fn local_address(&self) -> Option<NodeAddress> {
        Some(self.address.clone())
    }

    async fn shutdown(&self) {
        let was_started = self
            .events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .is_some();
        if !was_started {
            return;
        }
        deliver(self.network.unregister(&self.address)).await;
        debug!(address = %self.address, "memory transport stopped");
    }
}
