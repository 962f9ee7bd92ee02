use std::net::IpAddr;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};

use agora::Node;

#[derive(Parser)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 50882)]
    port: u16,
    /// Ip address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,
    /// Ip address other peers see this node at
    #[arg(long)]
    public_ip: Option<IpAddr>,
    /// Bootstrap contacts as host:port, repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,
    /// Seconds between status reports
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let mut builder = Node::builder();
    builder.address(cli.address).port(cli.port);

    if let Some(public_ip) = cli.public_ip {
        builder.public_ip(public_ip);
    }
    if !cli.bootstrap.is_empty() {
        builder.bootstrap(&cli.bootstrap);
    }

    let node = builder.build().expect("Failed to start node");

    let added = node.join();
    info!(added, "Joined the network");

    let (tx_interrupted, rx_interrupted) = mpsc::channel();

    ctrlc::set_handler(move || {
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    let interval = Duration::from_secs(cli.status_interval);

    while rx_interrupted.recv_timeout(interval).is_err() {
        let info = node.info();

        info!(
            id = %info.id(),
            public_address = ?info.public_address(),
            peers = info.peers(),
            active = info.active_peers(),
            idle = info.idle_peers(),
            records = info.records(),
            ram = info.data_ram_usage(),
            "Status"
        );
    }

    info!("Received Ctrl+C, shutting down");
    node.shutdown();
}
