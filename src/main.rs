//! Treecast node agent.
//!
//! Joins the overlay's multicast group, installs the SPT protocol, and runs
//! the receiver, sender, and engine tasks until interrupted.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use treecast::config::{
    generate_logical_address, overlay_hash, MULTICAST_GROUP, MULTICAST_PORT, SENDER_HASH,
};
use treecast::engine::Engine;
use treecast::measure::{self, StateReport};
use treecast::socket;
use treecast::spt::message::SenderTable;
use treecast::spt::SptProtocol;
use treecast::PacketFifo;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "treecast", version, about = "Shared-spanning-tree multicast overlay node")]
struct Args {
    /// Telemetry collector URL; reporting is off when unset
    #[arg(short, long)]
    collector: Option<String>,

    /// Disable the periodic data probe message
    #[arg(long)]
    no_probe: bool,

    /// Payload text carried by the data probe
    #[arg(long, default_value = "hello from treecast")]
    probe_payload: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("treecast=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let std_socket = match socket::open_multicast_socket() {
        Ok(socket) => socket,
        Err(e) => {
            error!("failed to open multicast socket: {e}");
            return;
        }
    };
    let udp = match tokio::net::UdpSocket::from_std(std_socket) {
        Ok(udp) => Arc::new(udp),
        Err(e) => {
            error!("failed to register socket with the runtime: {e}");
            return;
        }
    };

    let logical = generate_logical_address();
    let hash = overlay_hash();
    let identity = SenderTable::local(MULTICAST_GROUP, MULTICAST_PORT, SENDER_HASH, logical);
    let local_ip = socket::local_ipv4();

    info!("════════════════════════════════════════════════════════════");
    info!("  treecast v{VERSION}");
    info!("════════════════════════════════════════════════════════════");
    info!("Node {logical} | group {MULTICAST_GROUP}:{MULTICAST_PORT} | overlay {hash:#010x}");
    if let Some(ip) = local_ip {
        info!("Local interface: {ip}");
    }

    let inbound = Arc::new(PacketFifo::default());
    let outbound = Arc::new(PacketFifo::default());

    let mut protocol = SptProtocol::new(&identity, hash);
    if !args.no_probe {
        protocol = protocol.with_data_probe(args.probe_payload.into_bytes());
    }

    let report_tx = args.collector.as_ref().map(|collector| {
        let (tx, rx) = watch::channel(StateReport::default());
        info!("Reporting node state to {collector}");
        tokio::spawn(measure::report_loop(collector.clone(), rx));
        tx
    });

    let engine = Engine::new(
        inbound.clone(),
        outbound.clone(),
        Box::new(protocol),
        identity,
        Box::new(|payload: &[u8]| {
            info!("delivered {} bytes: {}", payload.len(), String::from_utf8_lossy(payload));
        }),
        report_tx,
    );

    tokio::spawn(socket::receive_loop(udp.clone(), inbound, local_ip));
    tokio::spawn(socket::send_loop(udp, outbound));
    tokio::spawn(engine.run());

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
}
