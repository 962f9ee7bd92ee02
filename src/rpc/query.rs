//! Outbound queries: liveness, discovery, lookups and announcements.

use std::net::SocketAddr;
use std::str::FromStr;

use rand::seq::SliceRandom;
use tracing::{debug, error, info, trace};

use crate::common::{
    FindNodeRequestArguments, GetProvidersRequestArguments, GetRequestArguments, Id,
    MapRequestArguments, Peer, PeerStatus, RemoveRequestArguments, RequestTypeSpecific,
    ResponseSpecific, ERROR_KEY_NOT_FOUND,
};

use super::{to_socket_address, QueryError, Rpc};

impl Rpc {
    /// Ping `address`, succeeding only if it answers with the id derived from that address.
    pub fn ping(&self, address: SocketAddr) -> bool {
        self.query_ping(address).is_ok()
    }

    pub(crate) fn query_ping(&self, address: SocketAddr) -> Result<(), QueryError> {
        let response = self.request(
            address,
            RequestTypeSpecific::Ping,
            self.config().ping_timeout,
        )?;

        if response.responder_id() != &Id::from_address(address.ip(), address.port()) {
            debug!(?address, responder_id = ?response.responder_id(), "Ping response id mismatch");
            self.routing_table_mut().record_failure(&address);

            return Err(QueryError::IdMismatch);
        }

        Ok(())
    }

    /// Join the network through the configured bootstrap contacts.
    ///
    /// Every contact that answers a ping is asked for the peers closest to
    /// this node, and each of those is admitted once it answers a ping too.
    /// Bootstrap nodes rebuild their routing table from the durable cache instead.
    ///
    /// Returns the number of peers added to the routing table.
    pub fn join(&self) -> usize {
        if self.is_bootstrap_node() {
            info!("Bootstrap node, rebuilding routing table from cache");
            return self.rebuild_routing_table();
        }

        let public_address = self.public_address();
        let mut added = 0;

        for contact in to_socket_address(&self.config().bootstrap) {
            let contact = self.peer_address(contact.ip(), contact.port());

            if contact == public_address {
                continue;
            }

            if !self.ping(contact) {
                debug!(?contact, "Bootstrap contact did not respond");
                continue;
            }

            if self.add_peer(Peer::new(contact).as_bootstrap()) {
                added += 1;
            }

            for node in self.send_find_node(self.id(), contact) {
                if self.ping(node) && self.add_peer(Peer::new(node)) {
                    added += 1;
                }
            }
        }

        let table_size = self.routing_table().size();
        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            debug!(id = %self.id(), table_size, "Populated the routing table");
        }

        added
    }

    /// Ping every peer persisted by a previous run, admitting the responsive ones
    /// and forgetting the rest.
    pub fn rebuild_routing_table(&self) -> usize {
        let peers = match self.cache().peers() {
            Ok(peers) => peers,
            Err(error) => {
                error!(?error, "Failed to read persisted peers");
                return 0;
            }
        };

        let mut added = 0;

        for address in peers {
            if self.ping(address) {
                if self.add_peer(Peer::new(address)) {
                    added += 1;
                }
            } else if let Err(error) = self.cache().remove_peer(address) {
                debug!(?error, ?address, "Failed to forget unresponsive peer");
            }
        }

        info!(added, "Rebuilt routing table");

        added
    }

    /// Ask `address` for the peers it knows closest to `target`.
    ///
    /// Returns only candidates that are neither this node nor already in the routing table.
    pub fn send_find_node(&self, target: &Id, address: SocketAddr) -> Vec<SocketAddr> {
        let response = self.request(
            address,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: *target }),
            self.config().request_timeout,
        );

        let nodes = match response {
            Ok(ResponseSpecific::FindNode(args)) => args.nodes,
            Ok(other) => {
                debug!(?address, ?other, "Unexpected find_node response");
                return vec![];
            }
            Err(_) => return vec![],
        };

        let mut candidates: Vec<SocketAddr> = Vec::with_capacity(nodes.len());

        for node in nodes {
            let node = self.peer_address(node.ip(), node.port());
            let id = Id::from_address(node.ip(), node.port());

            if &id == self.id() || self.routing_table().contains(&id) || candidates.contains(&node)
            {
                continue;
            }

            candidates.push(node);
        }

        trace!(?address, candidates = candidates.len(), "find_node response");

        candidates
    }

    /// Look `key` up: in memory, in the durable cache, then from providers.
    ///
    /// Known providers are queried first, failing ones are forgotten. If none
    /// answers, providers are discovered from the closest peers and queried in turn.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.get_local(key) {
            return Some(value);
        }

        // Cached values were validated when they were written.
        if let Some(value) = self.get_cached(key) {
            return Some(value);
        }

        for provider in self.get_providers(key) {
            match self.get_from_provider(key, provider) {
                Some(value) => return Some(value),
                None => {
                    self.remove_provider(key, &provider);
                }
            }
        }

        let public_address = self.public_address();

        for provider in self.send_get_providers(key) {
            if provider == public_address {
                continue;
            }

            if let Some(value) = self.get_from_provider(key, provider) {
                self.add_provider(key, provider);
                return Some(value);
            }
        }

        debug!(%key, "Value not found");

        None
    }

    /// Fetch `key` from `address` and validate it.
    fn get_from_provider(&self, key: &str, address: SocketAddr) -> Option<String> {
        let value = self.send_get(key, address)?;

        match self.validate(key, &value) {
            Ok(_) => Some(value),
            Err(error) => {
                debug!(%key, ?address, %error, "Provider returned an invalid value");
                None
            }
        }
    }

    /// Ask `address` for the value of `key`.
    pub fn send_get(&self, key: &str, address: SocketAddr) -> Option<String> {
        let response = self.request(
            address,
            RequestTypeSpecific::Get(GetRequestArguments {
                key: key.to_string(),
            }),
            self.config().request_timeout,
        );

        match response {
            Ok(ResponseSpecific::Get(args)) => Some(args.value),
            Ok(other) => {
                debug!(?address, ?other, "Unexpected get response");
                None
            }
            Err(QueryError::Remote { code, .. }) if code == ERROR_KEY_NOT_FOUND => {
                trace!(%key, ?address, "Key not found");
                None
            }
            Err(_) => None,
        }
    }

    /// Ask the closest active peers which peers hold `key`.
    pub fn send_get_providers(&self, key: &str) -> Vec<SocketAddr> {
        let Ok(target) = Id::from_str(key) else {
            return vec![];
        };

        let max_failures = self.config().max_health_checks;
        let mut closest: Vec<Peer> = self
            .find_node(&target, self.config().max_closest_nodes)
            .into_iter()
            .filter(|peer| peer.status(max_failures) == PeerStatus::Active)
            .collect();

        closest.shuffle(&mut rand::thread_rng());

        let mut providers: Vec<SocketAddr> = vec![];

        for peer in closest {
            let response = self.request(
                peer.address,
                RequestTypeSpecific::GetProviders(GetProvidersRequestArguments {
                    key: key.to_string(),
                }),
                self.config().request_timeout,
            );

            if let Ok(ResponseSpecific::GetProviders(args)) = response {
                for provider in args.values {
                    let provider = self.peer_address(provider.ip(), provider.port());

                    if !providers.contains(&provider) {
                        providers.push(provider);
                    }
                }
            }
        }

        providers
    }

    /// Ask the closest peers to drop `key`, without waiting for their answers.
    ///
    /// Returns the number of peers notified.
    pub fn send_remove(&self, key: &str) -> usize {
        let Ok(target) = Id::from_str(key) else {
            return 0;
        };

        let mut closest = self.find_node(&target, self.config().max_closest_nodes);
        closest.shuffle(&mut rand::thread_rng());

        for peer in &closest {
            self.notify(
                peer.address,
                RequestTypeSpecific::Remove(RemoveRequestArguments {
                    key: key.to_string(),
                }),
            );
        }

        closest.len()
    }

    /// Store a record locally, including listings, and announce it to the closest
    /// peers so they register this node as a provider.
    ///
    /// Returns `false` if the record was rejected.
    pub fn map(&self, key: &str, value: &str) -> bool {
        if !self.store(key, value) {
            return false;
        }

        let Ok(target) = Id::from_str(key) else {
            return false;
        };

        let announced = self
            .find_node(&target, self.config().replication_factor)
            .into_iter()
            .filter(|peer| self.announce(peer.address, key, value))
            .count();

        debug!(%key, announced, "Announced record");

        true
    }

    /// Announce the records this node holds to `address`, so it can register
    /// this node as their provider.
    ///
    /// Falls back to the durable cache when nothing is held in memory.
    /// Bootstrap nodes never announce.
    pub fn send_map(&self, address: SocketAddr) -> usize {
        if self.is_bootstrap_node() {
            return 0;
        }

        let mut records = self.get_data();

        if records.is_empty() {
            records = self.cache().entries().unwrap_or_else(|error| {
                debug!(?error, "Failed to read cached records");
                vec![]
            });
        }

        records
            .iter()
            .filter(|(key, value)| self.announce(address, key, value))
            .count()
    }

    fn announce(&self, address: SocketAddr, key: &str, value: &str) -> bool {
        self.request(
            address,
            RequestTypeSpecific::Map(MapRequestArguments {
                key: key.to_string(),
                value: value.to_string(),
            }),
            self.config().request_timeout,
        )
        .is_ok()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::common::{
        AckResponseArguments, ErrorSpecific, FindNodeResponseArguments, Message, MessageType,
    };
    use crate::rpc::test::testnet_config;
    use crate::rpc::{Config, RECV_BUFFER_SIZE};

    use super::*;

    /// Answer a single query on `rpc`'s socket with `reply`.
    fn answer_once(
        rpc: Arc<Rpc>,
        reply: impl FnOnce(&Rpc, u32, SocketAddr) + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            let mut buf = [0u8; RECV_BUFFER_SIZE];

            if let Some((amt, from)) = rpc.socket().recv_from(&mut buf) {
                let message = Message::from_bytes(&buf[..amt]).unwrap();
                reply(&rpc, message.transaction_id, from);
                break;
            }
        })
    }

    #[test]
    fn ping_checks_responder_id() {
        let client = Rpc::new(testnet_config()).unwrap();
        let server = Arc::new(Rpc::new(testnet_config()).unwrap());
        let server_address = server.public_address();

        // Honest responder.
        let handle = answer_once(server.clone(), |rpc, tid, from| {
            rpc.socket().response(
                from,
                tid,
                ResponseSpecific::Ack(AckResponseArguments {
                    responder_id: *rpc.id(),
                }),
            )
        });
        assert!(client.ping(server_address));
        handle.join().unwrap();

        // Spoofed id.
        let handle = answer_once(server, |rpc, tid, from| {
            rpc.socket().response(
                from,
                tid,
                ResponseSpecific::Ack(AckResponseArguments {
                    responder_id: Id::random(),
                }),
            )
        });
        assert!(!client.ping(server_address));
        handle.join().unwrap();
    }

    #[test]
    fn unresponsive_peer_is_marked() {
        let client = Rpc::new(Config {
            ping_timeout: Duration::from_millis(100),
            ..testnet_config()
        })
        .unwrap();
        let silent = Rpc::new(testnet_config()).unwrap();
        let address = silent.public_address();

        client.add_peer(Peer::new(address));
        assert!(!client.ping(address));

        let peer = client.get_peers().pop().unwrap();
        assert_eq!(peer.failures, 1);
    }

    #[test]
    fn find_node_filters_self_and_known_peers() {
        let client = Rpc::new(testnet_config()).unwrap();
        let server = Arc::new(Rpc::new(testnet_config()).unwrap());

        let known: SocketAddr = ([127, 0, 0, 1], 1111).into();
        let fresh: SocketAddr = ([127, 0, 0, 1], 2222).into();
        client.add_peer(Peer::new(known));

        let client_address = client.public_address();
        let handle = answer_once(server.clone(), move |rpc, tid, from| {
            rpc.socket().response(
                from,
                tid,
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id: *rpc.id(),
                    nodes: vec![client_address, known, fresh, fresh],
                }),
            )
        });

        let nodes = client.send_find_node(client.id(), server.public_address());
        handle.join().unwrap();

        assert_eq!(nodes, vec![fresh]);
    }

    #[test]
    fn get_prunes_failing_provider() {
        let client = Rpc::new(testnet_config()).unwrap();
        let server = Arc::new(Rpc::new(testnet_config()).unwrap());
        let key = "22".repeat(32);

        client.add_provider(&key, server.public_address());

        let handle = answer_once(server.clone(), |rpc, tid, from| {
            rpc.socket().error(
                from,
                tid,
                ErrorSpecific {
                    code: ERROR_KEY_NOT_FOUND,
                    description: "Key not found".to_string(),
                },
            )
        });

        assert_eq!(client.get(&key), None);
        handle.join().unwrap();

        assert!(client.get_providers(&key).is_empty());
    }

    #[test]
    fn bootstrap_node_does_not_announce() {
        let bootstrap = Rpc::new(Config {
            bootstrap_mode: true,
            ..testnet_config()
        })
        .unwrap();

        assert!(bootstrap.is_bootstrap_node());
        assert_eq!(bootstrap.send_map(([127, 0, 0, 1], 1).into()), 0);
    }

    #[test]
    fn message_type_is_request() {
        // The socket helper sends requests with this node's id.
        let client = Rpc::new(testnet_config()).unwrap();
        let server = Arc::new(Rpc::new(testnet_config()).unwrap());
        let client_id = *client.id();

        let handle = thread::spawn({
            let server = server.clone();
            move || loop {
                let mut buf = [0u8; RECV_BUFFER_SIZE];
                if let Some((amt, _)) = server.socket().recv_from(&mut buf) {
                    let message = Message::from_bytes(&buf[..amt]).unwrap();
                    match message.message_type {
                        MessageType::Request(request) => {
                            assert_eq!(request.requester_id, client_id);
                            assert_eq!(
                                request.request_type,
                                RequestTypeSpecific::Remove(RemoveRequestArguments {
                                    key: "33".repeat(32)
                                })
                            );
                        }
                        other => panic!("expected a request, got {other:?}"),
                    }
                    break;
                }
            }
        });

        client.add_peer(Peer::new(server.public_address()));
        assert_eq!(client.send_remove(&"33".repeat(32)), 1);

        handle.join().unwrap();
    }
}
