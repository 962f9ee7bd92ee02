//! Peers known to hold a copy of a key's value.

use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Clone, Default)]
/// Per-key multimap of provider addresses, without duplicates.
pub struct ProviderRegistry {
    providers: HashMap<String, Vec<SocketAddr>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `provider` as holding `key`. Returns `false` if it was already known.
    pub fn add_provider(&mut self, key: &str, provider: SocketAddr) -> bool {
        let entry = self.providers.entry(key.to_string()).or_default();

        if entry.contains(&provider) {
            return false;
        }

        entry.push(provider);
        true
    }

    /// Strike `provider` from `key`'s providers, dropping the key once none remain.
    pub fn remove_provider(&mut self, key: &str, provider: &SocketAddr) -> bool {
        let Some(entry) = self.providers.get_mut(key) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|existing| existing != provider);
        let removed = entry.len() != before;

        if entry.is_empty() {
            self.providers.remove(key);
        }

        removed
    }

    /// Snapshot of the providers currently known for `key`.
    pub fn get_providers(&self, key: &str) -> Vec<SocketAddr> {
        self.providers.get(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const KEY: &str = "6b6579";

    #[test]
    fn no_duplicate_providers() {
        let mut registry = ProviderRegistry::new();
        let provider: SocketAddr = ([127, 0, 0, 1], 50881).into();

        assert!(registry.add_provider(KEY, provider));
        assert!(!registry.add_provider(KEY, provider));

        assert_eq!(registry.get_providers(KEY), vec![provider]);
    }

    #[test]
    fn keeps_insertion_order() {
        let mut registry = ProviderRegistry::new();
        let a: SocketAddr = ([10, 0, 0, 1], 1).into();
        let b: SocketAddr = ([10, 0, 0, 2], 1).into();
        let c: SocketAddr = ([10, 0, 0, 1], 2).into();

        registry.add_provider(KEY, a);
        registry.add_provider(KEY, b);
        registry.add_provider(KEY, c);

        assert_eq!(registry.get_providers(KEY), vec![a, b, c]);
    }

    #[test]
    fn removing_last_provider_drops_key() {
        let mut registry = ProviderRegistry::new();
        let a: SocketAddr = ([10, 0, 0, 1], 1).into();
        let b: SocketAddr = ([10, 0, 0, 2], 1).into();

        registry.add_provider(KEY, a);
        registry.add_provider(KEY, b);

        assert!(registry.remove_provider(KEY, &a));
        assert!(registry.providers.contains_key(KEY));

        assert!(!registry.remove_provider(KEY, &a));

        assert!(registry.remove_provider(KEY, &b));
        assert!(!registry.providers.contains_key(KEY));
        assert!(registry.get_providers(KEY).is_empty());
        assert!(registry.providers.is_empty());
    }
}
