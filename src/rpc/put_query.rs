use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::common::{Id, PutRequestArguments, RequestTypeSpecific};

use super::{QueryError, Rpc};

#[derive(Debug, Default)]
/// Keeps track of the peers a `put` was sent to, and how each of them answered.
///
/// No peer is contacted twice within the same `put`.
struct PutQuery {
    stored_at: HashSet<SocketAddr>,
    /// Peers that answered with an error.
    rejected: HashSet<SocketAddr>,
    /// Peers that did not answer at all.
    failed: HashSet<SocketAddr>,
}

impl PutQuery {
    fn contacted(&self, address: &SocketAddr) -> bool {
        self.stored_at.contains(address)
            || self.rejected.contains(address)
            || self.failed.contains(address)
    }

    fn record(&mut self, address: SocketAddr, result: Result<(), QueryError>) {
        match result {
            Ok(()) => {
                self.stored_at.insert(address);
            }
            Err(QueryError::Remote { code, message }) => {
                trace!(?address, code, %message, "Put rejected");
                self.rejected.insert(address);
            }
            Err(_) => {
                self.failed.insert(address);
            }
        }
    }
}

impl Rpc {
    /// Replicate `key`/`value` to the peers closest to `key`.
    ///
    /// Starts with the `replication_factor` closest peers in random order.
    /// While fewer than `replication_factor` have stored the value, other
    /// peers of the routing table are tried in order of distance.
    ///
    /// Returns the number of peers that acknowledged the put.
    pub fn send_put(&self, key: &str, value: &str) -> usize {
        if !self.is_value_publishable(value) {
            debug!(%key, "Refusing to replicate a value that is not publishable");
            return 0;
        }

        let Ok(target) = Id::from_str(key) else {
            return 0;
        };

        let replication_factor = self.config().replication_factor;

        let mut closest = self.find_node(&target, replication_factor);
        closest.shuffle(&mut rand::thread_rng());

        let mut query = PutQuery::default();

        for peer in closest {
            let result = self.put_to(peer.address, key, value);
            query.record(peer.address, result);
        }

        if query.stored_at.len() < replication_factor {
            let table_size = self.routing_table().size();

            let remaining: Vec<SocketAddr> = self
                .find_node(&target, table_size)
                .into_iter()
                .map(|peer| peer.address)
                .filter(|address| !query.contacted(address))
                .collect();

            for address in remaining {
                if query.stored_at.len() >= replication_factor {
                    break;
                }

                let result = self.put_to(address, key, value);
                query.record(address, result);
            }
        }

        debug!(
            %key,
            stored_at = query.stored_at.len(),
            rejected = query.rejected.len(),
            failed = query.failed.len(),
            "Put done"
        );

        query.stored_at.len()
    }

    fn put_to(&self, address: SocketAddr, key: &str, value: &str) -> Result<(), QueryError> {
        self.request(
            address,
            RequestTypeSpecific::Put(PutRequestArguments {
                key: key.to_string(),
                value: value.to_string(),
            }),
            self.config().request_timeout,
        )
        .map(|_| ())
    }
}
