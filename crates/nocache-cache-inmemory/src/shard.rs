//! Entry storage shared by every cache variant

use dashmap::DashMap;
use nocache_core::{
    AuxiliaryStore, CacheEntrySnapshot, CacheKey, CacheShard, CoreError, NodeId, NodeOutput,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::keys::KeySet;

/// Bookkeeping value per cache key, removable through the purge interface
#[derive(Debug)]
pub struct KeyedStore<V> {
    name: &'static str,
    values: DashMap<CacheKey, V>,
}

impl<V: Clone> KeyedStore<V> {
    /// Create an empty store
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            values: DashMap::new(),
        }
    }

    /// Value for a key
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// Set the value for a key
    pub fn insert(&self, key: CacheKey, value: V) {
        self.values.insert(key, value);
    }

    /// Drop the value for a key
    pub fn take(&self, key: &CacheKey) -> Option<V> {
        self.values.remove(key).map(|(_, value)| value)
    }

    /// Whether the key has a value
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.values.contains_key(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All tracked pairs
    pub fn entries(&self) -> Vec<(CacheKey, V)> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl<V: Send + Sync> AuxiliaryStore for KeyedStore<V> {
    fn name(&self) -> &str {
        self.name
    }

    fn remove(&self, key: &CacheKey) -> Result<bool, CoreError> {
        Ok(self.values.remove(key).is_some())
    }
}

/// One partition of cached node outputs
pub struct Shard {
    keys: Arc<KeySet>,
    entries: DashMap<CacheKey, NodeOutput>,
    aux: Vec<Arc<dyn AuxiliaryStore>>,
    // summed logical size of `entries`
    bytes: AtomicU64,
}

impl Shard {
    /// Create a shard resolving keys through `keys`, with the given bookkeeping stores
    pub fn new(keys: Arc<KeySet>, aux: Vec<Arc<dyn AuxiliaryStore>>) -> Self {
        Self {
            keys,
            entries: DashMap::new(),
            aux,
            bytes: AtomicU64::new(0),
        }
    }

    /// Entry under a key
    pub fn get(&self, key: &CacheKey) -> Option<NodeOutput> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store an entry
    pub fn insert(&self, key: CacheKey, value: NodeOutput) {
        // added before the entry is published so removals never underflow
        self.bytes.fetch_add(value.logical_size(), Ordering::Relaxed);
        if let Some(replaced) = self.entries.insert(key, value) {
            self.bytes
                .fetch_sub(replaced.logical_size(), Ordering::Relaxed);
        }
    }

    fn take(&self, key: &CacheKey) -> Option<NodeOutput> {
        let (_, value) = self.entries.remove(key)?;
        self.bytes.fetch_sub(value.logical_size(), Ordering::Relaxed);
        Some(value)
    }

    /// Remove an entry and its bookkeeping
    pub fn evict(&self, key: &CacheKey) -> Option<NodeOutput> {
        let removed = self.take(key);
        for store in &self.aux {
            if let Err(e) = store.remove(key) {
                warn!(key = %key, store = store.name(), "Skipping bookkeeping cleanup: {}", e);
            }
        }
        removed
    }

    /// Whether a key has an entry
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the shard is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all entries
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Total logical size of all entries
    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Live entries, attributed to nodes of the bound prompt
    pub fn snapshot(&self) -> Vec<CacheEntrySnapshot> {
        let prompt = self.keys.prompt();
        self.entries
            .iter()
            .map(|entry| {
                let node_id = self.keys.node_for(entry.key());
                let class_type = node_id
                    .as_ref()
                    .and_then(|id| prompt.as_ref().and_then(|p| p.get(id)))
                    .map(|node| node.class_type.clone());
                CacheEntrySnapshot {
                    node_id,
                    class_type,
                    key: entry.key().clone(),
                    value: entry.value().clone(),
                }
            })
            .collect()
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("entries", &self.entries.len())
            .field("aux", &self.aux.iter().map(|store| store.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

impl CacheShard for Shard {
    fn cache_key(&self, node_id: &NodeId) -> Option<CacheKey> {
        self.keys.key(node_id)
    }

    fn remove_entry(&self, key: &CacheKey) -> Result<bool, CoreError> {
        Ok(self.take(key).is_some())
    }

    fn auxiliary_stores(&self) -> Vec<Arc<dyn AuxiliaryStore>> {
        self.aux.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nocache_core::OutputValue;
    use serde_json::json;

    #[test]
    fn test_evict_clears_bookkeeping() {
        let stamps = Arc::new(KeyedStore::<u64>::new("timestamps"));
        let shard = Shard::new(Arc::new(KeySet::new()), vec![stamps.clone()]);
        let key = CacheKey("sig:1".to_string());

        shard.insert(key.clone(), NodeOutput::single(OutputValue::Scalar(json!(1))));
        stamps.insert(key.clone(), 7);

        assert!(shard.evict(&key).is_some());
        assert!(shard.is_empty());
        assert!(stamps.is_empty());
    }

    struct BrokenStore;

    impl AuxiliaryStore for BrokenStore {
        fn name(&self) -> &str {
            "children"
        }

        fn remove(&self, _key: &CacheKey) -> Result<bool, CoreError> {
            Err(CoreError::CacheError("store layout changed".to_string()))
        }
    }

    #[test]
    fn test_evict_skips_failing_bookkeeping() {
        let stamps = Arc::new(KeyedStore::<u64>::new("timestamps"));
        let shard = Shard::new(
            Arc::new(KeySet::new()),
            vec![Arc::new(BrokenStore), stamps.clone()],
        );
        let key = CacheKey("sig:1".to_string());
        shard.insert(key.clone(), NodeOutput::default());
        stamps.insert(key.clone(), 3);

        assert!(shard.evict(&key).is_some());
        assert!(shard.is_empty());
        assert!(stamps.is_empty());
    }

    #[test]
    fn test_total_bytes_follows_writes_and_removals() {
        let shard = Shard::new(Arc::new(KeySet::new()), Vec::new());
        let text = |value: &str| NodeOutput::single(OutputValue::Text(value.to_string()));
        let first = CacheKey("sig:1".to_string());
        let second = CacheKey("sig:2".to_string());

        shard.insert(first.clone(), text("abcd"));
        shard.insert(second.clone(), text("ef"));
        let expected = text("abcd").logical_size() + text("ef").logical_size();
        assert_eq!(shard.total_bytes(), expected);

        shard.insert(first.clone(), text("a"));
        assert_eq!(
            shard.total_bytes(),
            text("a").logical_size() + text("ef").logical_size()
        );

        shard.evict(&first);
        assert!(shard.remove_entry(&second).unwrap());
        assert_eq!(shard.total_bytes(), 0);
    }

    #[test]
    fn test_remove_entry_leaves_bookkeeping_to_caller() {
        let stamps = Arc::new(KeyedStore::<u64>::new("timestamps"));
        let shard = Shard::new(Arc::new(KeySet::new()), vec![stamps.clone()]);
        let key = CacheKey("sig:1".to_string());
        shard.insert(key.clone(), NodeOutput::default());
        stamps.insert(key.clone(), 1);

        assert!(shard.remove_entry(&key).unwrap());
        assert!(!shard.remove_entry(&key).unwrap());
        assert_eq!(stamps.len(), 1);
        assert_eq!(shard.auxiliary_stores()[0].name(), "timestamps");
    }
}
