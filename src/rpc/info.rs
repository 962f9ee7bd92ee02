use std::net::SocketAddr;

use crate::common::PeerStatus;
use crate::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    public_address: SocketAddr,
    bootstrap_node: bool,
    peers: usize,
    active_peers: usize,
    idle_peers: usize,
    records: usize,
    data_ram_usage: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// The address other peers reach this node at, which its [Id] is derived from.
    pub fn public_address(&self) -> SocketAddr {
        self.public_address
    }
    /// Returns `true` if this node runs as a bootstrap node.
    pub fn bootstrap_node(&self) -> bool {
        self.bootstrap_node
    }
    /// Number of peers in the routing table.
    pub fn peers(&self) -> usize {
        self.peers
    }
    /// Peers that answered their last contact.
    pub fn active_peers(&self) -> usize {
        self.active_peers
    }
    /// Peers that failed at least one contact, but are not dead yet.
    pub fn idle_peers(&self) -> usize {
        self.idle_peers
    }
    /// Number of records held in memory.
    pub fn records(&self) -> usize {
        self.records
    }
    /// Approximate size of the in-memory records in bytes.
    pub fn data_ram_usage(&self) -> usize {
        self.data_ram_usage
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        let (peers, active_peers, idle_peers) = {
            let table = rpc.routing_table();

            (
                table.size(),
                table.count_status(PeerStatus::Active),
                table.count_status(PeerStatus::Inactive),
            )
        };
        let records = rpc.data().len();
        let data_ram_usage = rpc.data_ram_usage();

        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            public_address: rpc.public_address(),
            bootstrap_node: rpc.is_bootstrap_node(),
            peers,
            active_peers,
            idle_peers,
            records,
            data_ram_usage,
        }
    }
}
