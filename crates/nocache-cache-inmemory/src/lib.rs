//! In-memory node output caches for NoCache
//!
//! This crate provides in-memory implementations of the cache interfaces
//! defined in the nocache-core crate: a flat unbounded cache, a cache
//! partitioned by expansion parent, an LRU cache and a byte-budgeted cache.
//! All of them key entries by input signature and expose their per-key
//! bookkeeping through the purge interface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod basic;
pub mod hierarchical;
pub mod keys;
pub mod lru;
pub mod ram_pressure;
pub mod shard;

pub use basic::BasicCache;
pub use hierarchical::HierarchicalCache;
pub use keys::{derive_keys, KeySet};
pub use lru::{LruOutputCache, RecencyList, DEFAULT_LRU_CAPACITY};
pub use ram_pressure::{AccessStamp, RamPressureCache, DEFAULT_RAM_BUDGET};
pub use shard::{KeyedStore, Shard};

use nocache_core::OutputCache;
use std::sync::Arc;

/// Cache implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVariant {
    /// [`BasicCache`]
    Basic,
    /// [`HierarchicalCache`]
    Hierarchical,
    /// [`LruOutputCache`] with the given capacity
    Lru(usize),
    /// [`RamPressureCache`] with the given byte budget
    RamPressure(u64),
}

impl CacheVariant {
    /// Build an empty cache of this variant
    pub fn build(self) -> Arc<dyn OutputCache> {
        match self {
            CacheVariant::Basic => Arc::new(BasicCache::new()),
            CacheVariant::Hierarchical => Arc::new(HierarchicalCache::new()),
            CacheVariant::Lru(capacity) => Arc::new(LruOutputCache::new(capacity)),
            CacheVariant::RamPressure(budget) => Arc::new(RamPressureCache::new(budget)),
        }
    }
}
