//! Concurrent map of live connections keyed by identifier

use super::{ConnectionId, PeerHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Connection map shared by the tunnel reader and connection tasks
pub type ConnectionRegistry = Registry<PeerHandle>;

/// Thread-safe map from connection identifier to a handle.
///
/// Lookups never block the tunnel read loop for longer than one shard lock.
#[derive(Debug)]
pub struct Registry<H> {
    entries: DashMap<ConnectionId, H>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<H: Clone> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` under `id` unless the identifier is already taken
    pub fn insert(&self, id: ConnectionId, handle: H) -> bool {
        match self.entries.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Register `handle` under a freshly generated identifier that is not in use
    pub fn register(&self, handle: H) -> ConnectionId {
        loop {
            let id = ConnectionId::generate();
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(handle);
                return id;
            }
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<H> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Remove an entry. Only one of several concurrent callers gets `Some`.
    pub fn remove(&self, id: &ConnectionId) -> Option<H> {
        self.entries.remove(id).map(|(_, handle)| handle)
    }

    /// Remove an entry if `f` holds for its handle
    pub fn remove_if(&self, id: &ConnectionId, f: impl FnOnce(&H) -> bool) -> Option<H> {
        self.entries
            .remove_if(id, |_, handle| f(handle))
            .map(|(_, handle)| handle)
    }

    /// Drop every entry for which `keep` returns false, returning how many went
    pub fn retain(&self, mut keep: impl FnMut(&H) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, handle| keep(handle));
        before.saturating_sub(self.entries.len())
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> Vec<(ConnectionId, H)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(ConnectionId, H)> {
        let ids: Vec<ConnectionId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_and_lookup() {
        let registry: Registry<u32> = Registry::new();
        let id = ConnectionId::from_bytes(*b"00000001");

        assert!(registry.insert(id, 7));
        assert!(!registry.insert(id, 8));
        assert_eq!(registry.get(&id), Some(7));
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_only_once() {
        let registry: Registry<u32> = Registry::new();
        let id = registry.register(1);

        assert_eq!(registry.remove(&id), Some(1));
        assert_eq!(registry.remove(&id), None);
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if() {
        let registry: Registry<u32> = Registry::new();
        let id = registry.register(5);

        assert!(registry.remove_if(&id, |v| *v > 10).is_none());
        assert!(registry.contains(&id));
        assert_eq!(registry.remove_if(&id, |v| *v == 5), Some(5));
    }

    #[test]
    fn test_retain_and_snapshot() {
        let registry: Registry<u32> = Registry::new();
        for v in 0..10 {
            registry.register(v);
        }

        assert_eq!(registry.retain(|v| v % 2 == 0), 5);
        let mut values: Vec<u32> = registry.snapshot().into_iter().map(|(_, v)| v).collect();
        values.sort();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry: Registry<u32> = Registry::new();
        registry.register(1);
        registry.register(2);

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_gives_unique_ids() {
        let registry: Arc<Registry<usize>> = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|i| registry.register(t * 1000 + i))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<ConnectionId> = threads
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 2000);
        ids.sort_by_key(|id| *id.as_bytes());
        ids.dedup();
        assert_eq!(ids.len(), 2000);
        assert_eq!(registry.len(), 2000);
    }
}
