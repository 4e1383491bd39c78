//! Keyed registries for peers, workers and services.

use std::hash::Hash;

use dashmap::DashMap;

/// Concurrent keyed collection with a narrow CRUD surface
#[derive(Debug)]
pub struct Registry<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Insert, returning the value previously stored under `key`
    pub fn add(&self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Snapshot of all values, in no particular order
    pub fn list(&self) -> Vec<V> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
