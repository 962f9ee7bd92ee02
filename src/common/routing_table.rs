//! Simplified Kademlia routing table
//!
//! Peers live in a single slot arena; each of the [ID_BITS] buckets only holds
//! slot indices into it. Evicting a peer frees its slot without invalidating
//! any other bucket entry.

use std::net::SocketAddr;

use crate::common::{Id, Peer, PeerStatus, DEFAULT_MAX_HEALTH_CHECKS, ID_BITS};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    max_failures: u32,
    slots: Vec<Option<Peer>>,
    free_slots: Vec<usize>,
    buckets: Vec<Vec<usize>>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            max_failures: DEFAULT_MAX_HEALTH_CHECKS,
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![Vec::new(); ID_BITS],
        }
    }

    /// Set the number of consecutive failures after which a peer counts as dead.
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    // === Public Methods ===

    /// Attempts to add a peer to this routing table, and return `true` if it did.
    ///
    /// A full bucket only accepts the peer if one of its entries is dead, in
    /// which case the dead entry is replaced.
    pub fn add(&mut self, peer: Peer) -> bool {
        let bucket_index = match self.id.bucket_index(&peer.id) {
            Some(index) => index,
            // Do not add self to the routing_table
            None => return false,
        };

        if self.contains(&peer.id) || self.contains_address(&peer.address) {
            return false;
        }

        if self.buckets[bucket_index].len() < MAX_BUCKET_SIZE_K {
            let slot = self.allocate(peer);
            self.buckets[bucket_index].push(slot);

            return true;
        }

        let max_failures = self.max_failures;
        let dead = self.buckets[bucket_index].iter().position(|slot| {
            self.slots[*slot]
                .as_ref()
                .map(|existing| existing.is_dead(max_failures))
                .unwrap_or(true)
        });

        match dead {
            Some(position) => {
                let slot = self.buckets[bucket_index][position];
                self.slots[slot] = Some(peer);

                true
            }
            None => false,
        }
    }

    /// Remove the peer listening on `address`, returning it if it was known.
    pub fn remove(&mut self, address: &SocketAddr) -> Option<Peer> {
        let slot = self.find_slot(|peer| &peer.address == address)?;

        self.release(slot)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.find_slot(|peer| &peer.id == id).is_some()
    }

    pub fn contains_address(&self, address: &SocketAddr) -> bool {
        self.find_slot(|peer| &peer.address == address).is_some()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&Peer> {
        self.find_slot(|peer| &peer.address == address)
            .and_then(|slot| self.slots[slot].as_ref())
    }

    /// Increment the failure counter of the peer at `address`.
    ///
    /// Returns the peer's new status, or `None` if it is not in the table.
    pub fn record_failure(&mut self, address: &SocketAddr) -> Option<PeerStatus> {
        let max_failures = self.max_failures;
        let slot = self.find_slot(|peer| &peer.address == address)?;
        let peer = self.slots[slot].as_mut()?;

        peer.failures = peer.failures.saturating_add(1);

        Some(peer.status(max_failures))
    }

    /// Reset the failure counter of the peer at `address`.
    pub fn record_success(&mut self, address: &SocketAddr) {
        if let Some(slot) = self.find_slot(|peer| &peer.address == address) {
            if let Some(peer) = self.slots[slot].as_mut() {
                peer.failures = 0;
            }
        }
    }

    /// Return up to `count` peers ordered by ascending XOR distance to `target`.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<Peer> {
        let mut peers: Vec<&Peer> = self.iter().collect();

        peers.sort_by_key(|peer| peer.id.xor(target));

        peers.into_iter().take(count).cloned().collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Number of peers currently in the given status.
    pub fn count_status(&self, status: PeerStatus) -> usize {
        self.iter()
            .filter(|peer| peer.status(self.max_failures) == status)
            .count()
    }

    /// Returns an iterator over the peers in this routing table, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter_map(|slot| self.slots[*slot].as_ref())
    }

    /// Export an owned vector of peers from this routing table.
    pub fn to_vec(&self) -> Vec<Peer> {
        self.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, index: usize) -> usize {
        self.buckets[index].len()
    }

    // === Private Methods ===

    fn find_slot<F: Fn(&Peer) -> bool>(&self, predicate: F) -> Option<usize> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .copied()
            .find(|slot| self.slots[*slot].as_ref().map(&predicate).unwrap_or(false))
    }

    fn allocate(&mut self, peer: Peer) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(peer);
                slot
            }
            None => {
                self.slots.push(Some(peer));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Option<Peer> {
        let peer = self.slots[slot].take()?;

        if let Some(index) = self.id.bucket_index(&peer.id) {
            self.buckets[index].retain(|s| *s != slot);
        }
        self.free_slots.push(slot);

        Some(peer)
    }
}
