use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{DurableCache, MemoryCache};
use crate::common::DEFAULT_MAX_HEALTH_CHECKS;
use crate::signing::{Ed25519Verifier, SignatureVerifier};

use super::{
    DEFAULT_BOOTSTRAP_NODES, DEFAULT_PING_TIMEOUT, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT,
};

/// Number of peers a record is pushed to on `put`.
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
/// Upper bound of peers contacted by a single lookup.
pub const DEFAULT_MAX_CLOSEST_NODES: usize = 20;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default size of the inbound request worker pool.
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
/// Node Configurations
pub struct Config {
    /// Ip address to bind the UDP socket to.
    ///
    /// Defaults to `127.0.0.1`
    pub address: IpAddr,
    /// Port to listen on. If it is taken, successive ports are tried,
    /// then an ephemeral one.
    ///
    /// Defaults to [DEFAULT_PORT]
    pub port: u16,
    /// The address other peers see this node at, used to derive its [crate::Id].
    ///
    /// Defaults to None, where the bind address is used (loopback if unspecified).
    pub public_ip: Option<IpAddr>,
    /// Bootstrap contacts as `host:port` strings.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_NODES]
    pub bootstrap: Vec<String>,
    /// Run as a bootstrap node: never join, and persist admitted peers instead.
    ///
    /// A node whose own address appears in [Config::bootstrap] is a bootstrap node too.
    pub bootstrap_mode: bool,
    /// Receive timeout of outbound queries.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Receive timeout of outbound pings.
    ///
    /// Defaults to [DEFAULT_PING_TIMEOUT]
    pub ping_timeout: Duration,
    pub replication_factor: usize,
    pub max_closest_nodes: usize,
    /// Consecutive failed contacts before a peer is considered dead.
    pub max_health_checks: u32,
    pub health_check_interval: Duration,
    pub republish_interval: Duration,
    pub purge_interval: Duration,
    pub refresh_interval: Duration,
    /// Number of threads handling inbound datagrams.
    pub workers: usize,
    /// Verify-only signing service used to authorize records.
    pub verifier: Arc<dyn SignatureVerifier>,
    /// Durable mirror of stored records and bootstrap peers.
    pub cache: Arc<dyn DurableCache>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            public_ip: None,
            bootstrap: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bootstrap_mode: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            max_closest_nodes: DEFAULT_MAX_CLOSEST_NODES,
            max_health_checks: DEFAULT_MAX_HEALTH_CHECKS,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            workers: DEFAULT_WORKERS,
            verifier: Arc::new(Ed25519Verifier),
            cache: Arc::new(MemoryCache::new()),
        }
    }
}
