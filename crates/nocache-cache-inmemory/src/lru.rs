//! Size-bounded cache with least-recently-used eviction
//!
//! Each key carries three pieces of bookkeeping: its position in the recency
//! list, the run generation it was last used in, and the keys of the nodes it
//! reads from. Reading an entry also refreshes its upstream entries so that a
//! hit keeps its inputs warm.

use lru::LruCache;
use nocache_core::{
    AuxiliaryStore, CacheEntrySnapshot, CacheKey, CacheShard, CoreError, NodeDescriptor, NodeId,
    NodeOutput, OutputCache, Prompt, PurgeTarget,
};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::keys::KeySet;
use crate::shard::{KeyedStore, Shard};

/// Default number of entries kept
pub const DEFAULT_LRU_CAPACITY: usize = 100;

/// Recency order of the keys in a shard
pub struct RecencyList {
    order: Mutex<LruCache<CacheKey, ()>>,
}

impl RecencyList {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            order: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record a use of `key`; returns a key pushed out by it
    fn touch(&self, key: &CacheKey) -> Option<CacheKey> {
        match self.order.lock().push(key.clone(), ()) {
            Some((evicted, _)) if &evicted != key => Some(evicted),
            _ => None,
        }
    }

    fn promote(&self, key: &CacheKey) {
        self.order.lock().promote(key);
    }

    /// Whether `key` is tracked
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.order.lock().contains(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuxiliaryStore for RecencyList {
    fn name(&self) -> &str {
        "recency"
    }

    fn remove(&self, key: &CacheKey) -> Result<bool, CoreError> {
        Ok(self.order.lock().pop(key).is_some())
    }
}

impl fmt::Debug for RecencyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecencyList").field("len", &self.len()).finish()
    }
}

/// LRU-evicting cache
#[derive(Debug)]
pub struct LruOutputCache {
    keys: Arc<KeySet>,
    shard: Arc<Shard>,
    recency: Arc<RecencyList>,
    used_generation: Arc<KeyedStore<u64>>,
    children: Arc<KeyedStore<Vec<CacheKey>>>,
    generation: AtomicU64,
    capacity: NonZeroUsize,
}

impl LruOutputCache {
    /// Create a cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let keys = Arc::new(KeySet::new());
        let recency = Arc::new(RecencyList::new(capacity));
        let used_generation = Arc::new(KeyedStore::<u64>::new("used_generation"));
        let children = Arc::new(KeyedStore::<Vec<CacheKey>>::new("children"));

        let aux: Vec<Arc<dyn AuxiliaryStore>> = vec![
            recency.clone(),
            used_generation.clone(),
            children.clone(),
        ];

        Self {
            shard: Arc::new(Shard::new(keys.clone(), aux)),
            keys,
            recency,
            used_generation,
            children,
            generation: AtomicU64::new(0),
            capacity,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of prompts bound so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.shard.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.shard.is_empty()
    }

    /// Recency bookkeeping
    pub fn recency(&self) -> &RecencyList {
        &self.recency
    }

    /// Generation bookkeeping
    pub fn used_generation(&self) -> &KeyedStore<u64> {
        &self.used_generation
    }

    /// Upstream-link bookkeeping
    pub fn children(&self) -> &KeyedStore<Vec<CacheKey>> {
        &self.children
    }

    fn mark_used(&self, key: &CacheKey) {
        self.used_generation.insert(key.clone(), self.generation());
    }
}

impl Default for LruOutputCache {
    fn default() -> Self {
        Self::new(DEFAULT_LRU_CAPACITY)
    }
}

impl PurgeTarget for LruOutputCache {
    fn resolve_shard(&self, _node_id: &NodeId) -> Option<Arc<dyn CacheShard>> {
        Some(self.shard.clone())
    }
}

impl OutputCache for LruOutputCache {
    fn variant(&self) -> &'static str {
        "lru"
    }

    fn bind_prompt(&self, prompt: Arc<Prompt>) {
        if self.keys.bind(prompt) {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(generation, "Advanced LRU generation");
        }
    }

    fn describe_node(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError> {
        self.keys.describe(node_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeOutput> {
        let key = self.keys.key(node_id)?;
        let value = self.shard.get(&key)?;

        self.recency.promote(&key);
        self.mark_used(&key);
        for upstream in self.children.get(&key).unwrap_or_default() {
            if self.shard.contains(&upstream) {
                self.recency.promote(&upstream);
                self.mark_used(&upstream);
            }
        }
        Some(value)
    }

    fn set(&self, node_id: &NodeId, value: NodeOutput) {
        let Some(key) = self.keys.key(node_id) else {
            debug!(node_id = %node_id, "Node not in bound prompt, not caching");
            return;
        };

        self.shard.insert(key.clone(), value);
        self.mark_used(&key);
        self.children
            .insert(key.clone(), self.keys.upstream_keys(node_id));

        if let Some(evicted) = self.recency.touch(&key) {
            debug!(key = %evicted, "Evicting least recently used entry");
            self.shard.evict(&evicted);
        }
    }

    fn snapshot(&self) -> Result<Vec<CacheEntrySnapshot>, CoreError> {
        Ok(self.shard.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
