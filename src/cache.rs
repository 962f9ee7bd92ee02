//! Durable cache the node mirrors its data and bootstrap peers into.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Failure reported by a [DurableCache] backend.
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Narrow persistence contract used by the node.
///
/// In-memory data stays authoritative; cache failures are logged by the
/// caller and never fail a DHT operation.
pub trait DurableCache: Send + Sync + Debug {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Insert `value`, or overwrite the existing value for `key`.
    fn put_or_update(&self, key: &str, value: &str) -> Result<(), CacheError>;

    fn exists(&self, key: &str) -> Result<bool, CacheError>;

    fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Every cached key/value pair.
    fn entries(&self) -> Result<Vec<(String, String)>, CacheError>;

    /// Remember a peer admitted by a bootstrap node.
    fn persist_peer(&self, address: SocketAddr) -> Result<(), CacheError>;

    fn remove_peer(&self, address: SocketAddr) -> Result<(), CacheError>;

    fn peers(&self) -> Result<Vec<SocketAddr>, CacheError>;
}

#[derive(Debug, Default)]
/// In-memory [DurableCache], nothing survives the process.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
    peers: RwLock<Vec<SocketAddr>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        Ok(entries.get(key).cloned())
    }

    fn put_or_update(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());

        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        Ok(entries.contains_key(key))
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);

        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, String)>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        Ok(entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn persist_peer(&self, address: SocketAddr) -> Result<(), CacheError> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);

        if !peers.contains(&address) {
            peers.push(address);
        }

        Ok(())
    }

    fn remove_peer(&self, address: SocketAddr) -> Result<(), CacheError> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|peer| peer != &address);

        Ok(())
    }

    fn peers(&self) -> Result<Vec<SocketAddr>, CacheError> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);

        Ok(peers.clone())
    }
}
