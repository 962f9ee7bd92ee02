use std::net::IpAddr;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};

use agora::rpc::DEFAULT_PORT;
use agora::Node;

#[derive(Parser)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Ip address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    address: IpAddr,
    /// Ip address other peers see this node at
    #[arg(long)]
    public_ip: Option<IpAddr>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let mut builder = Node::builder();
    builder
        .address(cli.address)
        .port(cli.port)
        .bootstrap::<&str>(&[])
        .bootstrap_mode();

    if let Some(public_ip) = cli.public_ip {
        builder.public_ip(public_ip);
    }

    let node = builder.build().expect("Failed to start bootstrap node");

    // Peers admitted in a previous run.
    let rebuilt = node.join();
    info!(rebuilt, address = ?node.public_address(), "Bootstrap node running");

    let (tx_interrupted, rx_interrupted) = mpsc::channel();

    ctrlc::set_handler(move || {
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    while rx_interrupted.recv_timeout(Duration::from_secs(60)).is_err() {
        info!(peers = node.info().peers(), "Routing table");
    }

    node.shutdown();
}
