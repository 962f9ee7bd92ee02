//! Periodic tasks keeping the routing table and the local data consistent over time.

use std::time::Duration;

use tracing::{debug, info};

use crate::common::{Peer, PeerStatus, Record};
use crate::rpc::{Config, Rpc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A maintenance task, run on its own thread at its own interval.
pub enum Task {
    /// Ping every non-bootstrap peer, evicting the dead ones.
    HealthCheck,
    /// Ask the closest peers for peers close to this node.
    Refresh,
    /// Replicate every locally held record again.
    Republish,
    /// Remove expired records.
    Purge,
}

impl Task {
    pub const ALL: [Task; 4] = [Task::HealthCheck, Task::Refresh, Task::Republish, Task::Purge];

    pub fn name(&self) -> &'static str {
        match self {
            Task::HealthCheck => "health_check",
            Task::Refresh => "refresh",
            Task::Republish => "republish",
            Task::Purge => "purge",
        }
    }

    pub fn interval(&self, config: &Config) -> Duration {
        match self {
            Task::HealthCheck => config.health_check_interval,
            Task::Refresh => config.refresh_interval,
            Task::Republish => config.republish_interval,
            Task::Purge => config.purge_interval,
        }
    }

    /// Run one pass of this task, returning the number of affected peers or records.
    pub fn run(&self, rpc: &Rpc) -> usize {
        let affected = match self {
            Task::HealthCheck => health_check(rpc),
            Task::Refresh => refresh(rpc),
            Task::Republish => republish(rpc),
            Task::Purge => purge(rpc),
        };

        debug!(task = self.name(), affected, "Maintenance pass done");

        affected
    }
}

/// Returns the number of evicted peers.
pub fn health_check(rpc: &Rpc) -> usize {
    let max_failures = rpc.config().max_health_checks;
    let mut evicted = 0;

    let peers: Vec<Peer> = rpc
        .get_peers()
        .into_iter()
        .filter(|peer| !peer.bootstrap)
        .collect();

    for peer in peers {
        if rpc.ping(peer.address) {
            continue;
        }

        let status = rpc
            .routing_table()
            .get(&peer.address)
            .map(|peer| peer.status(max_failures));

        if status == Some(PeerStatus::Dead) {
            rpc.remove_peer(&peer.address);

            if let Err(error) = rpc.cache().remove_peer(peer.address) {
                debug!(?error, address = ?peer.address, "Failed to forget dead peer");
            }

            info!(address = ?peer.address, id = %peer.id, "Evicted dead peer");
            evicted += 1;
        }
    }

    evicted
}

/// Returns the number of peers added.
pub fn refresh(rpc: &Rpc) -> usize {
    let mut added = 0;

    for peer in rpc.find_node(rpc.id(), rpc.config().replication_factor) {
        for node in rpc.send_find_node(rpc.id(), peer.address) {
            if rpc.ping(node) && rpc.add_peer(Peer::new(node)) {
                added += 1;
            }
        }
    }

    added
}

/// Returns the number of records replicated to at least one peer.
pub fn republish(rpc: &Rpc) -> usize {
    rpc.get_data()
        .iter()
        .filter(|(key, value)| rpc.send_put(key, value) > 0)
        .count()
}

/// Returns the number of records removed.
pub fn purge(rpc: &Rpc) -> usize {
    let expired: Vec<String> = rpc
        .get_data()
        .into_iter()
        .filter(|(_, value)| {
            Record::parse(value)
                .map(|record| record.is_expired())
                .unwrap_or(false)
        })
        .map(|(key, _)| key)
        .collect();

    for key in &expired {
        rpc.expire(key);
    }

    expired.len()
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use serde_json::json;

    use crate::signing::Ed25519Signer;
    use crate::Node;

    use super::*;

    fn testnet_node() -> Node {
        Node::builder()
            .port(0)
            .bootstrap::<&str>(&[])
            .build()
            .unwrap()
    }

    fn testnet_rpc(config: Config) -> Rpc {
        Rpc::new(Config {
            port: 0,
            bootstrap: vec![],
            ping_timeout: Duration::from_millis(50),
            request_timeout: Duration::from_millis(50),
            ..config
        })
        .unwrap()
    }

    #[test]
    fn intervals() {
        let config = Config::default();

        assert_eq!(Task::HealthCheck.interval(&config), Duration::from_secs(300));
        assert_eq!(Task::Republish.interval(&config), Duration::from_secs(3600));
        assert_eq!(Task::Purge.interval(&config), Duration::from_secs(1800));
        assert_eq!(Task::Refresh.interval(&config), Duration::from_secs(3600));
    }

    #[test]
    fn dead_peers_are_evicted() {
        let rpc = testnet_rpc(Config::default());

        // Nothing listens on these.
        let unreachable: SocketAddr = ([127, 0, 0, 1], 9).into();
        let bootstrap: SocketAddr = ([127, 0, 0, 1], 7).into();

        rpc.add_peer(Peer::new(unreachable));
        rpc.add_peer(Peer::new(bootstrap).as_bootstrap());

        assert_eq!(health_check(&rpc), 0);
        assert_eq!(health_check(&rpc), 0);
        assert_eq!(rpc.get_peers().len(), 2);

        assert_eq!(health_check(&rpc), 1);
        assert!(!rpc.has_peer(&unreachable));
        assert!(rpc.has_peer(&bootstrap));
    }

    #[test]
    fn responsive_peers_recover() {
        let rpc = testnet_rpc(Config::default());
        let node = testnet_node();
        let address = node.public_address();

        rpc.add_peer(Peer::new(address));
        rpc.routing_table_mut().record_failure(&address);
        rpc.routing_table_mut().record_failure(&address);

        assert_eq!(
            rpc.routing_table().get(&address).map(|peer| peer.failures),
            Some(2)
        );

        assert_eq!(health_check(&rpc), 0);

        assert_eq!(
            rpc.routing_table().get(&address).map(|peer| peer.failures),
            Some(0)
        );
    }

    #[test]
    fn refresh_admits_discovered_peers() {
        let rpc = testnet_rpc(Config::default());
        let known = testnet_node();
        let discovered = testnet_node();

        // `known` learns about `discovered` from its ping.
        assert!(discovered.rpc().ping(known.public_address()));

        rpc.add_peer(Peer::new(known.public_address()));

        assert_eq!(refresh(&rpc), 1);
        assert!(rpc.has_peer(&discovered.public_address()));

        // Nothing new the second time around.
        assert_eq!(refresh(&rpc), 0);
    }

    #[test]
    fn purge_removes_expired_records() {
        let rpc = testnet_rpc(Config::default());
        let signer = Ed25519Signer::random();
        let expiring_key = "77".repeat(32);
        let lasting_key = "78".repeat(32);

        let user = |expiration_date: String| {
            json!({
                "metadata": "user",
                "created_at": "2024-01-01T00:00:00Z",
                "monero_address": signer.address(),
                "public_key": "pk",
                "signature": signer.sign(&signer.address()),
                "expiration_date": expiration_date,
            })
            .to_string()
        };

        let soon = (chrono::Utc::now() + chrono::Duration::seconds(1)).to_rfc3339();
        let later = "2999-01-01T00:00:00Z".to_string();

        assert!(rpc.put(&expiring_key, &user(soon)));
        assert!(rpc.put(&lasting_key, &user(later)));
        assert_eq!(purge(&rpc), 0);

        std::thread::sleep(Duration::from_millis(1500));

        assert_eq!(purge(&rpc), 1);
        assert!(!rpc.has_key(&expiring_key));
        assert!(!rpc.has_key_cached(&expiring_key));
        assert!(rpc.has_key(&lasting_key));
    }

    #[test]
    fn republish_without_peers() {
        let rpc = testnet_rpc(Config::default());
        let signer = Ed25519Signer::random();

        let value = json!({
            "metadata": "user",
            "created_at": "2024-01-01T00:00:00Z",
            "monero_address": signer.address(),
            "public_key": "pk",
            "signature": signer.sign(&signer.address()),
        })
        .to_string();

        assert!(rpc.put(&"88".repeat(32), &value));
        assert_eq!(Task::Republish.run(&rpc), 0);
    }
}
