//! Byte-budgeted cache
//!
//! Entries are stamped on every write and hit. When the summed logical size of
//! the entries goes over the budget, the stalest entries are evicted until it
//! fits again.

use chrono::{DateTime, Utc};
use nocache_core::{
    AuxiliaryStore, CacheEntrySnapshot, CacheKey, CacheShard, CoreError, NodeDescriptor, NodeId,
    NodeOutput, OutputCache, Prompt, PurgeTarget,
};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::keys::KeySet;
use crate::shard::{KeyedStore, Shard};

/// Default budget: 4 GiB
pub const DEFAULT_RAM_BUDGET: u64 = 4 * 1024 * 1024 * 1024;

/// Last access of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessStamp {
    /// Wall-clock time of the access
    pub at: DateTime<Utc>,
    /// Monotonic access counter, orders accesses within the same instant
    pub tick: u64,
}

/// Cache evicting the stalest entries under memory pressure
#[derive(Debug)]
pub struct RamPressureCache {
    keys: Arc<KeySet>,
    shard: Arc<Shard>,
    timestamps: Arc<KeyedStore<AccessStamp>>,
    used_generation: Arc<KeyedStore<u64>>,
    generation: AtomicU64,
    ticks: AtomicU64,
    budget_bytes: u64,
}

impl RamPressureCache {
    /// Create a cache allowed to hold `budget_bytes` of outputs
    pub fn new(budget_bytes: u64) -> Self {
        let keys = Arc::new(KeySet::new());
        let timestamps = Arc::new(KeyedStore::<AccessStamp>::new("timestamps"));
        let used_generation = Arc::new(KeyedStore::<u64>::new("used_generation"));
        let aux: Vec<Arc<dyn AuxiliaryStore>> = vec![timestamps.clone(), used_generation.clone()];

        Self {
            shard: Arc::new(Shard::new(keys.clone(), aux)),
            keys,
            timestamps,
            used_generation,
            generation: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            budget_bytes,
        }
    }

    /// Byte budget
    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Summed logical size of all entries
    pub fn total_bytes(&self) -> u64 {
        self.shard.total_bytes()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.shard.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.shard.is_empty()
    }

    /// Access-time bookkeeping
    pub fn timestamps(&self) -> &KeyedStore<AccessStamp> {
        &self.timestamps
    }

    /// Generation bookkeeping
    pub fn used_generation(&self) -> &KeyedStore<u64> {
        &self.used_generation
    }

    /// Evict stale entries until the cache fits its budget.
    ///
    /// Returns the number of evicted entries.
    pub fn poll(&self) -> usize {
        self.enforce_budget(None)
    }

    fn stamp(&self, key: &CacheKey) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        self.timestamps.insert(
            key.clone(),
            AccessStamp {
                at: Utc::now(),
                tick,
            },
        );
        self.used_generation
            .insert(key.clone(), self.generation.load(Ordering::Relaxed));
    }

    fn enforce_budget(&self, keep: Option<&CacheKey>) -> usize {
        let mut total = self.total_bytes();
        if total <= self.budget_bytes {
            return 0;
        }

        let mut candidates: Vec<(CacheKey, AccessStamp)> = self
            .timestamps
            .entries()
            .into_iter()
            .filter(|(key, _)| Some(key) != keep)
            .collect();
        candidates.sort_by_key(|(_, stamp)| stamp.tick);

        let mut evicted = 0;
        for (key, _) in candidates {
            if total <= self.budget_bytes {
                break;
            }
            if let Some(value) = self.shard.evict(&key) {
                total = total.saturating_sub(value.logical_size());
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(
                evicted,
                total_bytes = total,
                budget_bytes = self.budget_bytes,
                "Evicted cache entries under memory pressure"
            );
        }
        evicted
    }
}

impl Default for RamPressureCache {
    fn default() -> Self {
        Self::new(DEFAULT_RAM_BUDGET)
    }
}

impl PurgeTarget for RamPressureCache {
    fn resolve_shard(&self, _node_id: &NodeId) -> Option<Arc<dyn CacheShard>> {
        Some(self.shard.clone())
    }
}

impl OutputCache for RamPressureCache {
    fn variant(&self) -> &'static str {
        "ram_pressure"
    }

    fn bind_prompt(&self, prompt: Arc<Prompt>) {
        if self.keys.bind(prompt) {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn describe_node(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError> {
        self.keys.describe(node_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeOutput> {
        let key = self.keys.key(node_id)?;
        let value = self.shard.get(&key)?;
        self.stamp(&key);
        Some(value)
    }

    fn set(&self, node_id: &NodeId, value: NodeOutput) {
        let Some(key) = self.keys.key(node_id) else {
            debug!(node_id = %node_id, "Node not in bound prompt, not caching");
            return;
        };
        self.shard.insert(key.clone(), value);
        self.stamp(&key);
        self.enforce_budget(Some(&key));
    }

    fn snapshot(&self) -> Result<Vec<CacheEntrySnapshot>, CoreError> {
        Ok(self.shard.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
