//! Struct and implementation of the Peer entry in the routing table
use std::net::SocketAddr;

use crate::common::Id;

/// Default number of consecutive failed health checks before a peer is [PeerStatus::Dead].
pub const DEFAULT_MAX_HEALTH_CHECKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Liveness of a remote peer, derived from its consecutive failure count.
pub enum PeerStatus {
    /// No failures since the last successful contact.
    Active,
    /// Failed at least once, but fewer than the maximum allowed times.
    Inactive,
    /// Failed the maximum allowed consecutive times. Terminal.
    Dead,
}

impl PeerStatus {
    pub fn from_failures(failures: u32, max_failures: u32) -> Self {
        if failures == 0 {
            PeerStatus::Active
        } else if failures < max_failures {
            PeerStatus::Inactive
        } else {
            PeerStatus::Dead
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Active => "Active",
            PeerStatus::Inactive => "Inactive",
            PeerStatus::Dead => "Dead",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Peer entry in the routing table
pub struct Peer {
    pub id: Id,
    pub address: SocketAddr,
    /// Consecutive failed contacts.
    pub failures: u32,
    /// Bootstrap contacts are kept out of health checks.
    pub bootstrap: bool,
}

impl Peer {
    /// Creates a new Peer whose id is derived from its address.
    pub fn new(address: SocketAddr) -> Peer {
        Peer {
            id: Id::from_address(address.ip(), address.port()),
            address,
            failures: 0,
            bootstrap: false,
        }
    }

    /// Creates a Peer with an explicit id, used where the id is not address-derived.
    pub fn with_id(id: Id, address: SocketAddr) -> Peer {
        Peer {
            id,
            address,
            failures: 0,
            bootstrap: false,
        }
    }

    pub fn as_bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    pub fn status(&self, max_failures: u32) -> PeerStatus {
        PeerStatus::from_failures(self.failures, max_failures)
    }

    pub fn is_dead(&self, max_failures: u32) -> bool {
        self.status(max_failures) == PeerStatus::Dead
    }
}
