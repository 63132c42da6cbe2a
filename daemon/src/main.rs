//! Lattice daemon: entry point for running a consensus node.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use clap::Parser;
use lattice_ledger::MemoryStore;
use lattice_messages::Message;
use lattice_node::{Node, NodeConfig, PeerTransport};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lattice-daemon", about = "Lattice consensus node daemon")]
struct Cli {
    /// Network to join: "live" or "test".
    #[arg(long, env = "LATTICE_NETWORK")]
    network: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(long, env = "LATTICE_CONFIG")]
    config: Option<String>,

    /// UDP peering port (defaults to the network's standard port).
    #[arg(long, env = "LATTICE_PORT")]
    port: Option<u16>,

    /// Peers to contact on startup ("host:port", comma-separated).
    #[arg(long, env = "LATTICE_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "LATTICE_LOG", default_value = "info")]
    log_level: String,
}

/// Sends messages over a shared UDP socket.
struct UdpTransport {
    socket: UdpSocket,
    network: lattice_types::NetworkKind,
}

impl PeerTransport for UdpTransport {
    fn send(&self, endpoint: SocketAddr, message: Message) {
        let frame = lattice_messages::encode(&message, self.network);
        if let Err(error) = self.socket.send_to(&frame, endpoint) {
            warn!(%endpoint, %error, "send failed");
        }
    }
}

fn build_config(cli: &Cli) -> NodeConfig {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path).unwrap_or_else(|error| {
            eprintln!("failed to load {path}: {error}");
            std::process::exit(1);
        }),
        None => NodeConfig::default(),
    };
    if let Some(network) = &cli.network {
        config.network = match network.as_str() {
            "live" => lattice_types::NetworkKind::Live,
            "test" => lattice_types::NetworkKind::Test,
            other => {
                eprintln!("unknown network {other:?}");
                std::process::exit(1);
            }
        };
    }
    if let Some(port) = cli.port {
        config.peering_port = Some(port);
    }
    config
        .preconfigured_peers
        .extend(cli.peers.iter().cloned());
    config.log_level = cli.log_level.clone();
    config
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    lattice_utils::init_tracing(&cli.log_level);

    let config = build_config(&cli);
    let port = config.port();
    let socket = UdpSocket::bind(("::", port)).unwrap_or_else(|error| {
        eprintln!("failed to bind port {port}: {error}");
        std::process::exit(1);
    });
    let transport = Arc::new(UdpTransport {
        socket: socket.try_clone().expect("cloning the UDP socket"),
        network: config.network,
    });

    let store = Arc::new(MemoryStore::new());
    let node = Node::new(config.clone(), store, transport);
    node.start();

    // Datagram receive workers feed the dispatcher.
    for _ in 0..config.io_threads.max(1) {
        let socket = socket.try_clone().expect("cloning the UDP socket");
        let node = node.clone();
        std::thread::spawn(move || {
            let mut buffer = [0u8; 64 * 1024];
            loop {
                match socket.recv_from(&mut buffer) {
                    Ok((len, from)) => node.process_datagram(&buffer[..len], from),
                    Err(error) => {
                        warn!(%error, "receive failed");
                    }
                }
            }
        });
    }

    info!(port, "daemon running; ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    node.stop();
}
