//! Interfaces the host's cache implementations expose to the cache layer
//!
//! `OutputCache` is the read/write contract every cache variant shares. The
//! purge side is split out so that the purger only ever works through
//! `PurgeTarget` -> `CacheShard` -> `AuxiliaryStore`.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::domain::node::{NodeDescriptor, NodeId};
use crate::domain::prompt::Prompt;
use crate::types::NodeOutput;
use crate::CoreError;

/// Storage slot identifier derived by the host cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live cache entry, as seen by diagnostics
#[derive(Debug, Clone)]
pub struct CacheEntrySnapshot {
    /// Node the entry belongs to in the currently bound prompt, if known
    pub node_id: Option<NodeId>,
    /// Class tag of that node, if known
    pub class_type: Option<String>,
    /// Storage key
    pub key: CacheKey,
    /// Cached value
    pub value: NodeOutput,
}

/// The write contract shared by every cache variant
pub trait OutputCache: PurgeTarget + fmt::Debug {
    /// Short name of the implementation, for logs
    fn variant(&self) -> &'static str;

    /// Bind the prompt of the run about to execute; derives cache keys.
    ///
    /// Binding the same `Arc<Prompt>` again is a no-op.
    fn bind_prompt(&self, prompt: Arc<Prompt>);

    /// Descriptor of a node in the bound prompt
    fn describe_node(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError>;

    /// Cached output for a node
    fn get(&self, node_id: &NodeId) -> Option<NodeOutput>;

    /// Store the output for a node
    fn set(&self, node_id: &NodeId, value: NodeOutput);

    /// All live entries
    fn snapshot(&self) -> Result<Vec<CacheEntrySnapshot>, CoreError>;

    /// Convert to Any for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Entry point of the purge interface
pub trait PurgeTarget: Send + Sync {
    /// Shard responsible for `node_id`. Partitioned caches resolve the
    /// partition; flat caches return their only shard.
    fn resolve_shard(&self, node_id: &NodeId) -> Option<Arc<dyn CacheShard>>;
}

/// One partition of a cache
pub trait CacheShard: Send + Sync {
    /// Host-derived key of a node within this shard
    fn cache_key(&self, node_id: &NodeId) -> Option<CacheKey>;

    /// Remove an entry. Returns whether an entry existed.
    fn remove_entry(&self, key: &CacheKey) -> Result<bool, CoreError>;

    /// Per-key bookkeeping kept alongside the entries
    fn auxiliary_stores(&self) -> Vec<Arc<dyn AuxiliaryStore>>;
}

/// Per-key bookkeeping (generation counters, child links, timestamps, ...)
pub trait AuxiliaryStore: Send + Sync {
    /// Name of the store, for logs
    fn name(&self) -> &str;

    /// Drop the bookkeeping for `key`. Returns whether anything was removed.
    fn remove(&self, key: &CacheKey) -> Result<bool, CoreError>;
}
