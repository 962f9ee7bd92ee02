//! DHT protocol engine: local state and the queries operating on it.

mod config;
mod info;
mod put_query;
mod query;
mod server;
mod socket;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::cache::DurableCache;
use crate::common::{
    Id, Peer, ProviderRegistry, Record, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    RoutingTable,
};
use crate::validator::{Update, ValidationError, Validator};
use crate::Error;

pub use config::{
    Config, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_MAX_CLOSEST_NODES, DEFAULT_PURGE_INTERVAL,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_REPLICATION_FACTOR, DEFAULT_REPUBLISH_INTERVAL,
    DEFAULT_WORKERS,
};
pub use info::Info;
pub use socket::{
    DhtSocket, QueryError, DEFAULT_PING_TIMEOUT, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT,
    RECV_BUFFER_SIZE, RECV_POLL_INTERVAL,
};

pub const DEFAULT_BOOTSTRAP_NODES: [&str; 1] = ["node.laiin.org:50881"];

#[derive(Debug)]
/// Shared state of a DHT node and the protocol operating on it.
///
/// Each of the routing table, the local data store and the provider registry
/// sits behind its own lock. No lock is held across network I/O, and no
/// operation holds more than one of them at a time.
pub struct Rpc {
    id: Id,
    socket: DhtSocket,
    public_ip: IpAddr,
    bootstrap_node: bool,

    routing_table: RwLock<RoutingTable>,
    data: RwLock<HashMap<String, String>>,
    providers: RwLock<ProviderRegistry>,

    validator: Validator,
    cache: Arc<dyn DurableCache>,
    config: Config,
}

impl Rpc {
    /// Bind the listening socket and derive this node's [Id] from the bound address.
    pub fn new(config: Config) -> Result<Self, Error> {
        let socket = DhtSocket::bind(config.address, config.port)?;
        let port = socket.local_addr().port();

        let public_ip = config.public_ip.unwrap_or(match config.address {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        });

        let id = Id::from_address(public_ip, port);
        let public_address = SocketAddr::new(public_ip, port);

        let bootstrap_node = config.bootstrap_mode
            || to_socket_address(&config.bootstrap).contains(&public_address);

        info!(%id, ?public_address, bootstrap_node, "Node bound");

        Ok(Rpc {
            id,
            socket,
            public_ip,
            bootstrap_node,

            routing_table: RwLock::new(
                RoutingTable::new(id).with_max_failures(config.max_health_checks),
            ),
            data: RwLock::new(HashMap::new()),
            providers: RwLock::new(ProviderRegistry::new()),

            validator: Validator::new(config.verifier.clone()),
            cache: config.cache.clone(),
            config,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the node is listening to.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Returns the address other peers reach this node at.
    pub fn public_address(&self) -> SocketAddr {
        SocketAddr::new(self.public_ip, self.socket.local_addr().port())
    }

    pub fn is_bootstrap_node(&self) -> bool {
        self.bootstrap_node
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn cache(&self) -> &Arc<dyn DurableCache> {
        &self.cache
    }

    pub fn socket(&self) -> &DhtSocket {
        &self.socket
    }

    /// Snapshot of this node's status.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Routing table ===

    /// Up to `count` known peers closest to `target`, without any network I/O.
    pub fn find_node(&self, target: &Id, count: usize) -> Vec<Peer> {
        self.routing_table().closest(target, count)
    }

    /// Add a peer to the routing table, persisting it if this is a bootstrap node.
    pub fn add_peer(&self, peer: Peer) -> bool {
        let address = peer.address;
        let added = self.routing_table_mut().add(peer);

        if added {
            debug!(?address, "Added peer to the routing table");

            if self.bootstrap_node {
                self.persist_peer(address);
            }
        }

        added
    }

    pub fn remove_peer(&self, address: &SocketAddr) -> Option<Peer> {
        self.routing_table_mut().remove(address)
    }

    pub fn has_peer(&self, address: &SocketAddr) -> bool {
        self.routing_table().contains_address(address)
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.routing_table().to_vec()
    }

    // === Local data ===

    /// Store a record through the replicated path.
    ///
    /// Listings are refused, they are only distributed with `map`.
    /// Storing the exact value already held succeeds without any change.
    pub fn put(&self, key: &str, value: &str) -> bool {
        if !self.is_value_publishable(value) {
            debug!(%key, "Refusing to put a value that is not publishable");
            return false;
        }

        self.store(key, value)
    }

    /// Replace the stored value of `key` if `value` is a valid, more recent update.
    ///
    /// Returns `true` if the update was accepted, including when the stored
    /// value is already the most recent one.
    pub fn set(&self, key: &str, value: &str) -> bool {
        if !self.has_key(key) {
            return false;
        }

        self.store(key, value)
    }

    /// Run the validator over `key`/`value`.
    ///
    /// An expired record is also purged from memory and the durable cache.
    pub fn validate(&self, key: &str, value: &str) -> Result<Record, ValidationError> {
        match self.validator.validate(key, value) {
            Err(ValidationError::Expired) => {
                debug!(%key, "Record has expired");
                self.expire(key);

                Err(ValidationError::Expired)
            }
            result => result,
        }
    }

    /// Returns `false` for listings and anything that is not a record.
    pub fn is_value_publishable(&self, value: &str) -> bool {
        Record::parse(value)
            .map(|record| record.is_publishable())
            .unwrap_or(false)
    }

    /// Value held in memory for `key`.
    pub fn get_local(&self, key: &str) -> Option<String> {
        self.data().get(key).cloned()
    }

    /// Value held in the durable cache for `key`.
    pub fn get_cached(&self, key: &str) -> Option<String> {
        self.cache
            .get(key)
            .map_err(|error| warn!(?error, %key, "Failed to read from cache"))
            .ok()
            .flatten()
    }

    /// Delete `key` from memory and the durable cache.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.data_mut().remove(key).is_some();

        if let Err(error) = self.cache.remove(key) {
            warn!(?error, %key, "Failed to remove from cache");
        }

        removed
    }

    /// Drop every record held in memory.
    pub fn remove_all(&self) {
        self.data_mut().clear();
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.data().contains_key(key)
    }

    pub fn has_key_cached(&self, key: &str) -> bool {
        self.cache.exists(key).unwrap_or(false)
    }

    pub fn has_value(&self, value: &str) -> bool {
        self.data().values().any(|stored| stored == value)
    }

    pub fn get_keys(&self) -> Vec<String> {
        self.data().keys().cloned().collect()
    }

    pub fn get_data(&self) -> Vec<(String, String)> {
        self.data()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Approximate bytes used by the keys and values held in memory.
    pub fn data_ram_usage(&self) -> usize {
        self.data()
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }

    // === Providers ===

    pub fn add_provider(&self, key: &str, provider: SocketAddr) -> bool {
        self.providers_mut().add_provider(key, provider)
    }

    pub fn remove_provider(&self, key: &str, provider: &SocketAddr) -> bool {
        self.providers_mut().remove_provider(key, provider)
    }

    pub fn get_providers(&self, key: &str) -> Vec<SocketAddr> {
        self.providers().get_providers(key)
    }

    // === Bootstrap persistence ===

    /// Persist every peer currently in the routing table to the durable cache.
    pub fn persist_routing_table(&self) {
        for peer in self.get_peers() {
            self.persist_peer(peer.address);
        }
    }

    // === Private Methods ===

    /// Validate and store `value`, as a fresh insert or as an update.
    pub(crate) fn store(&self, key: &str, value: &str) -> bool {
        if self.get_local(key).as_deref() == Some(value) {
            trace!(%key, "Value already stored");
            return true;
        }

        let record = match self.validate(key, value) {
            Ok(record) => record,
            Err(error) => {
                debug!(%key, %error, "Rejected record");
                return false;
            }
        };

        let written = {
            let mut data = self.data_mut();

            let update = match data.get(key) {
                None => Ok(Update::Replace),
                Some(current) if current == value => Ok(Update::AlreadyCurrent),
                Some(current) => match Record::parse(current) {
                    Ok(current) => self.validator.check_update(&current, &record),
                    Err(_) => Ok(Update::Replace),
                },
            };

            match update {
                Ok(Update::Replace) => {
                    data.insert(key.to_string(), value.to_string());
                    true
                }
                Ok(Update::AlreadyCurrent) => {
                    debug!(%key, "Value is already up to date");
                    false
                }
                Err(error) => {
                    debug!(%key, %error, "Rejected update");
                    return false;
                }
            }
        };

        if written {
            if let Err(error) = self.cache.put_or_update(key, value) {
                warn!(?error, %key, "Failed to write to cache");
            }
        }

        true
    }

    /// Remove an expired record from memory and the durable cache.
    pub(crate) fn expire(&self, key: &str) {
        if self.remove(key) {
            info!(%key, "Removed expired record");
        }
    }

    pub(crate) fn persist_peer(&self, address: SocketAddr) {
        if let Err(error) = self.cache.persist_peer(address) {
            warn!(?error, ?address, "Failed to persist peer");
        }
    }

    /// Send `request_type` to `address` and wait up to `timeout` for the response.
    ///
    /// Failures are recorded against the peer's health counter,
    /// successes reset it.
    pub(crate) fn request(
        &self,
        address: SocketAddr,
        request_type: RequestTypeSpecific,
        timeout: Duration,
    ) -> Result<ResponseSpecific, QueryError> {
        let method = request_type.method();

        let request = RequestSpecific {
            requester_id: self.id,
            requester_port: self.announced_port(&request_type),
            request_type,
        };

        match self.socket.query(self.dial_address(address), request, timeout) {
            Ok(response) => {
                self.routing_table_mut().record_success(&address);
                Ok(response)
            }
            Err(error) => {
                if !matches!(error, QueryError::Remote { .. }) {
                    self.routing_table_mut().record_failure(&address);
                }
                debug!(?address, method, %error, "Query failed");
                Err(error)
            }
        }
    }

    /// Send `request_type` to `address` without waiting for a response.
    pub(crate) fn notify(&self, address: SocketAddr, request_type: RequestTypeSpecific) {
        let request = RequestSpecific {
            requester_id: self.id,
            requester_port: self.announced_port(&request_type),
            request_type,
        };

        self.socket.notify(self.dial_address(address), request);
    }

    /// The listening port is only sent when it is not the default one,
    /// except for `map`, which always carries it.
    fn announced_port(&self, request_type: &RequestTypeSpecific) -> Option<u16> {
        let port = self.socket.local_addr().port();

        if port != DEFAULT_PORT || matches!(request_type, RequestTypeSpecific::Map(_)) {
            Some(port)
        } else {
            None
        }
    }

    /// Address a peer observed at `ip` listens on, as seen from the network.
    ///
    /// Peers on loopback are recorded under this node's public ip.
    pub(crate) fn peer_address(&self, ip: IpAddr, port: u16) -> SocketAddr {
        if ip.is_loopback() {
            SocketAddr::new(self.public_ip, port)
        } else {
            SocketAddr::new(ip, port)
        }
    }

    /// Peers sharing this node's public ip are dialled on loopback.
    pub(crate) fn dial_address(&self, address: SocketAddr) -> SocketAddr {
        if address.ip() == self.public_ip && !self.public_ip.is_loopback() {
            let loopback = match address {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };

            SocketAddr::new(loopback, address.port())
        } else {
            address
        }
    }

    pub(crate) fn routing_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn routing_table_mut(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn data(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn data_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn providers(&self) -> RwLockReadGuard<'_, ProviderRegistry> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn providers_mut(&self) -> RwLockWriteGuard<'_, ProviderRegistry> {
        self.providers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolve `host:port` strings, skipping the ones that fail to resolve.
pub(crate) fn to_socket_address<T: ToSocketAddrs>(bootstrap: &[T]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .flat_map(|s| {
            s.to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .collect()
}
