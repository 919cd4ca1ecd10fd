use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tradenet::{
    KeyRing, NodeAddress, P2PService, QuicTransport, ServiceConfig, ServiceEvent,
};

#[derive(Parser, Debug)]
#[command(name = "tradenet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Address other peers dial to reach this node (HOST:PORT).
    #[arg(short, long)]
    advertise: Option<NodeAddress>,

    /// Seed node address (HOST:PORT). May be repeated.
    #[arg(short, long = "seed", value_name = "SEED")]
    seeds: Vec<NodeAddress>,

    #[arg(long, default_value_t = tradenet::DEFAULT_MIN_CONNECTED_SEED_NODES)]
    min_seed_nodes: usize,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let key_ring = KeyRing::generate();
    info!(
        signature_key = %hex::encode(key_ring.signature.public_key_bytes()),
        encryption_key = %hex::encode(key_ring.encryption.public_key_bytes()),
        "node keys generated"
    );

    let transport = QuicTransport::new(args.bind, args.advertise.clone(), &key_ring.signature)?;
    let config = ServiceConfig {
        min_connected_seed_nodes: args.min_seed_nodes,
        ..ServiceConfig::default()
    };
    let service = P2PService::new(config, key_ring, transport, args.seeds.clone());
    let mut lifecycle = service.start().await?;

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(event) = lifecycle.recv() => {
                match event {
                    ServiceEvent::SetupFailed(reason) => {
                        warn!(reason = %reason, "setup failed");
                        break;
                    }
                    ServiceEvent::NoSeedNodeAvailable => {
                        warn!("no seed node available, continuing without initial data");
                    }
                    other => info!(event = ?other, "lifecycle"),
                }
            }
            _ = interval.tick() => {
                match service.network_snapshot().await {
                    Ok(snapshot) => info!(
                        state = ?snapshot.state.bootstrap,
                        authenticated = snapshot.state.authenticated,
                        address = ?snapshot.local_address,
                        seed_nodes = snapshot.connected_seed_nodes.len(),
                        peers = snapshot.authenticated_peers.len(),
                        entries = snapshot.stored_entries,
                        mailbox = snapshot.pending_mailbox_messages,
                        "network snapshot"
                    ),
                    Err(e) => warn!(error = %e, "snapshot unavailable"),
                }
            }
        }
    }

    service.shut_down().await;
    Ok(())
}
