//! # QUIC Transport
//!
//! [`QuicTransport`] carries [`NetworkMessage`]s over QUIC (quinn) with
//! self-signed Ed25519 certificates.
//!
//! ## Framing
//!
//! Each message travels on its own unidirectional stream:
//!
//! ```text
//! +----------------+---------------------------+
//! | length: u32 BE | bincode(NetworkMessage)   |
//! +----------------+---------------------------+
//! ```
//!
//! Frames above [`MAX_FRAME_SIZE`] are rejected on both sides.
//!
//! ## Connections
//!
//! - Outbound connections are cached per dialed address (bounded LRU)
//! - Inbound connections are only known by their [`ConnectionId`]; replies go
//!   back over the same connection
//! - A reader task per connection emits `Message` events and a final
//!   `Disconnected`

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::crypto::{
    TLS_SERVER_NAME, create_client_config, create_server_config, extract_public_key_from_cert,
    generate_ed25519_cert,
};
use crate::identity::{Keypair, NodeAddress, PublicKeyBytes, short_hex};
use crate::messages::{MAX_FRAME_SIZE, NetworkMessage, deserialize_message, serialize_message};
use crate::protocols::{ConnectionId, Transport, TransportEvent};

/// Maximum number of cached outbound connections.
/// SECURITY: Bounded so a long seed list or a flood of peers cannot grow the table.
const MAX_CACHED_CONNECTIONS: usize = 256;

/// Time allowed to read one frame once its stream was accepted.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to establish an outbound connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for in-flight streams on shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct ConnectionTable {
    outbound: LruCache<NodeAddress, ConnectionId>,
    by_id: HashMap<ConnectionId, Connection>,
}

struct Shared {
    endpoint: Mutex<Option<Endpoint>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    local_address: Mutex<Option<NodeAddress>>,
    connections: Mutex<ConnectionTable>,
    next_connection: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn endpoint(&self) -> Option<Endpoint> {
        lock(&self.endpoint).clone()
    }

    fn events(&self) -> Option<mpsc::Sender<TransportEvent>> {
        lock(&self.events).clone()
    }

    fn register(&self, connection: Connection, dialed: Option<&NodeAddress>) -> ConnectionId {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let mut table = lock(&self.connections);
        table.by_id.insert(id, connection);
        if let Some(dialed) = dialed
            && let Some((evicted_address, evicted)) = table.outbound.push(dialed.clone(), id)
            && evicted_address != *dialed
            && let Some(old) = table.by_id.remove(&evicted)
        {
            debug!(peer = %evicted_address, "evicting cached connection");
            old.close(0u32.into(), b"evicted");
        }
        id
    }

    fn cached(&self, to: &NodeAddress) -> Option<(ConnectionId, Connection)> {
        let mut table = lock(&self.connections);
        let id = *table.outbound.get(to)?;
        match table.by_id.get(&id) {
            Some(connection) if connection.close_reason().is_none() => {
                Some((id, connection.clone()))
            }
            _ => {
                table.outbound.pop(to);
                table.by_id.remove(&id);
                None
            }
        }
    }

    fn connection(&self, id: ConnectionId) -> Option<Connection> {
        lock(&self.connections).by_id.get(&id).cloned()
    }

    fn forget(&self, id: ConnectionId) -> Option<Connection> {
        let mut table = lock(&self.connections);
        let stale: Vec<NodeAddress> = table
            .outbound
            .iter()
            .filter(|(_, cid)| **cid == id)
            .map(|(address, _)| address.clone())
            .collect();
        for address in stale {
            table.outbound.pop(&address);
        }
        table.by_id.remove(&id)
    }

    fn drain(&self) -> Vec<Connection> {
        let mut table = lock(&self.connections);
        table.outbound.clear();
        table.by_id.drain().map(|(_, c)| c).collect()
    }
}

/// QUIC implementation of [`Transport`].
pub struct QuicTransport {
    bind_addr: SocketAddr,
    advertised: Option<NodeAddress>,
    server_config: ServerConfig,
    client_config: ClientConfig,
    shared: Arc<Shared>,
}

impl QuicTransport {
    /// Prepares a transport bound to `bind_addr` once started. `advertised` is
    /// the address peers should dial; when `None` the bound socket address is
    /// used.
    pub fn new(bind_addr: SocketAddr, advertised: Option<NodeAddress>, keypair: &Keypair) -> Result<Self> {
        let (certs, key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(certs, key)?;
        let client_config = create_client_config()?;
        let capacity = NonZeroUsize::new(MAX_CACHED_CONNECTIONS)
            .context("connection cache capacity must be non-zero")?;

        Ok(Self {
            bind_addr,
            advertised,
            server_config,
            client_config,
            shared: Arc::new(Shared {
                endpoint: Mutex::new(None),
                events: Mutex::new(None),
                local_address: Mutex::new(None),
                connections: Mutex::new(ConnectionTable {
                    outbound: LruCache::new(capacity),
                    by_id: HashMap::new(),
                }),
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    /// Socket address actually bound, once started.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.shared.endpoint().and_then(|e| e.local_addr().ok())
    }

    fn advertised_address(&self, bound: SocketAddr) -> NodeAddress {
        if let Some(address) = &self.advertised {
            return address.clone();
        }
        let ip = if bound.ip().is_unspecified() {
            warn!(bound = %bound, "no advertised address, falling back to loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            bound.ip()
        };
        NodeAddress::new(ip.to_string(), bound.port())
    }

    async fn connect(&self, endpoint: &Endpoint, to: &NodeAddress) -> Result<Connection> {
        let addr = tokio::net::lookup_host((to.host.as_str(), to.port))
            .await
            .with_context(|| format!("failed to resolve {}", to))?
            .next()
            .ok_or_else(|| anyhow!("{} resolved to no address", to))?;

        let connecting = endpoint
            .connect_with(self.client_config.clone(), addr, TLS_SERVER_NAME)
            .with_context(|| format!("failed to initiate connection to {}", addr))?;
        let connection = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| anyhow!("connection to {} timed out", to))?
            .with_context(|| format!("failed to establish connection to {}", addr))?;

        if let Some(key) = remote_signature_key(&connection) {
            trace!(peer = %to, key = %short_hex(&key), "connected");
        }
        Ok(connection)
    }

    async fn get_or_connect(&self, to: &NodeAddress) -> Result<(ConnectionId, Connection)> {
        if let Some(cached) = self.shared.cached(to) {
            return Ok(cached);
        }
        let endpoint = self
            .shared
            .endpoint()
            .ok_or_else(|| anyhow!("transport not started"))?;
        let connection = self.connect(&endpoint, to).await?;
        let id = self.shared.register(connection.clone(), Some(to));

        if let Some(events) = self.shared.events() {
            let _ = events
                .send(TransportEvent::Connected {
                    connection: id,
                    peer: Some(to.clone()),
                })
                .await;
            tokio::spawn(read_connection(
                self.shared.clone(),
                events,
                connection.clone(),
                id,
                Some(to.clone()),
            ));
        }
        Ok((id, connection))
    }
}

/// Ed25519 key from the peer's TLS certificate, if it presented one.
fn remote_signature_key(connection: &Connection) -> Option<PublicKeyBytes> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    extract_public_key_from_cert(certs.first()?.as_ref())
}

fn encode_frame(message: &NetworkMessage) -> Result<Vec<u8>> {
    let bytes = serialize_message(message).context("failed to serialize message")?;
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("message too large: {} bytes (max {})", bytes.len(), MAX_FRAME_SIZE);
    }
    Ok(bytes)
}

async fn write_frame(connection: &Connection, bytes: &[u8]) -> Result<()> {
    let mut send = connection
        .open_uni()
        .await
        .context("failed to open stream")?;
    let len = bytes.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(bytes).await?;
    send.finish()?;
    Ok(())
}

async fn read_frame(recv: &mut quinn::RecvStream) -> Result<NetworkMessage> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }
    let mut bytes = vec![0u8; len];
    recv.read_exact(&mut bytes).await?;
    deserialize_message(&bytes).context("failed to decode frame")
}

async fn read_connection(
    shared: Arc<Shared>,
    events: mpsc::Sender<TransportEvent>,
    connection: Connection,
    id: ConnectionId,
    peer: Option<NodeAddress>,
) {
    let remote = connection.remote_address();
    let intended = loop {
        let mut recv = match connection.accept_uni().await {
            Ok(recv) => recv,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(connection = %id, remote = %remote, "connection closed");
                break true;
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(connection = %id, remote = %remote, "connection idle timeout");
                break false;
            }
            Err(e) => {
                debug!(connection = %id, remote = %remote, error = %e, "connection lost");
                break false;
            }
        };

        match tokio::time::timeout(FRAME_READ_TIMEOUT, read_frame(&mut recv)).await {
            Ok(Ok(message)) => {
                let event = TransportEvent::Message {
                    connection: id,
                    peer: peer.clone(),
                    message,
                };
                if events.send(event).await.is_err() {
                    break true;
                }
            }
            Ok(Err(e)) => {
                warn!(connection = %id, remote = %remote, error = %e, "dropping malformed frame");
            }
            Err(_) => {
                warn!(connection = %id, remote = %remote, "frame read timed out");
            }
        }
    };

    shared.forget(id);
    let _ = events
        .send(TransportEvent::Disconnected {
            connection: id,
            peer,
            intended,
        })
        .await;
}

async fn accept_loop(shared: Arc<Shared>, endpoint: Endpoint, events: mpsc::Sender<TransportEvent>) {
    while let Some(incoming) = endpoint.accept().await {
        let shared = shared.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    debug!(error = %e, "failed to accept connection");
                    return;
                }
            };
            let id = shared.register(connection.clone(), None);
            debug!(connection = %id, remote = %connection.remote_address(), "inbound connection");
            let _ = events
                .send(TransportEvent::Connected {
                    connection: id,
                    peer: None,
                })
                .await;
            read_connection(shared, events, connection, id, None).await;
        });
    }
    debug!("accept loop stopped");
}

#[async_trait]
impl Transport for QuicTransport {
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        if self.shared.endpoint().is_some() {
            bail!("transport already started");
        }
        let endpoint = match Endpoint::server(self.server_config.clone(), self.bind_addr) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let reason = format!("failed to bind {}: {}", self.bind_addr, e);
                let _ = events.send(TransportEvent::SetupFailed(reason.clone())).await;
                bail!(reason);
            }
        };
        let bound = endpoint
            .local_addr()
            .context("failed to read bound address")?;
        let address = self.advertised_address(bound);

        *lock(&self.shared.endpoint) = Some(endpoint.clone());
        *lock(&self.shared.events) = Some(events.clone());
        *lock(&self.shared.local_address) = Some(address.clone());
        tokio::spawn(accept_loop(self.shared.clone(), endpoint, events.clone()));
        info!(bound = %bound, address = %address, "QUIC transport listening");

        events
            .send(TransportEvent::Ready)
            .await
            .map_err(|_| anyhow!("service stopped"))?;
        events
            .send(TransportEvent::HiddenServicePublished(address))
            .await
            .map_err(|_| anyhow!("service stopped"))?;
        Ok(())
    }

    async fn send(&self, to: &NodeAddress, message: NetworkMessage) -> Result<ConnectionId> {
        let bytes = encode_frame(&message)?;
        let (id, connection) = self.get_or_connect(to).await?;
        if let Err(e) = write_frame(&connection, &bytes).await {
            self.shared.forget(id);
            return Err(e.context(format!("failed to send {} to {}", message.kind(), to)));
        }
        trace!(peer = %to, connection = %id, kind = message.kind(), size = bytes.len(), "sent");
        Ok(id)
    }

    async fn reply(&self, connection: ConnectionId, message: NetworkMessage) -> Result<()> {
        let bytes = encode_frame(&message)?;
        let conn = self
            .shared
            .connection(connection)
            .ok_or_else(|| anyhow!("{} is closed", connection))?;
        write_frame(&conn, &bytes)
            .await
            .with_context(|| format!("failed to reply on {}", connection))
    }

    async fn close(&self, connection: ConnectionId) {
        if let Some(conn) = self.shared.forget(connection) {
            conn.close(0u32.into(), b"closed");
        }
    }

    fn local_address(&self) -> Option<NodeAddress> {
        lock(&self.shared.local_address).clone()
    }

    async fn shutdown(&self) {
        let Some(endpoint) = lock(&self.shared.endpoint).take() else {
            return;
        };
        lock(&self.shared.events).take();
        for connection in self.shared.drain() {
            connection.close(0u32.into(), b"shutdown");
        }
        endpoint.close(0u32.into(), b"shutdown");
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("endpoint did not drain before timeout");
        }
        info!("QUIC transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_decode_to_the_encoded_message() {
        let message = NetworkMessage::GetDataSet { nonce: 42 };
        let bytes = encode_frame(&message).unwrap();
        assert_eq!(deserialize_message(&bytes).unwrap(), message);
    }

    #[test]
    fn advertised_address_prefers_configuration() {
        let keypair = Keypair::generate();
        let advertised = NodeAddress::new("node.example", 4000);
        let transport = QuicTransport::new(
            "127.0.0.1:0".parse().unwrap(),
            Some(advertised.clone()),
            &keypair,
        )
        .unwrap();
        assert_eq!(
            transport.advertised_address("0.0.0.0:5000".parse().unwrap()),
            advertised
        );
    }

    #[test]
    fn unspecified_bind_falls_back_to_loopback() {
        let keypair = Keypair::generate();
        let transport = QuicTransport::new("0.0.0.0:0".parse().unwrap(), None, &keypair).unwrap();
        assert_eq!(
            transport.advertised_address("0.0.0.0:5000".parse().unwrap()),
            NodeAddress::new("127.0.0.1", 5000)
        );
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let transport =
            QuicTransport::new("127.0.0.1:0".parse().unwrap(), None, &Keypair::generate()).unwrap();
        let target = NodeAddress::new("127.0.0.1", 1);
        assert!(transport.send(&target, NetworkMessage::GetDataSet { nonce: 1 }).await.is_err());
        assert_eq!(transport.local_address(), None);
    }
}
