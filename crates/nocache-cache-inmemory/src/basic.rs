//! Flat cache: one shard, entries live until overwritten or purged

use nocache_core::{
    CacheEntrySnapshot, CacheShard, CoreError, NodeDescriptor, NodeId, NodeOutput, OutputCache,
    Prompt, PurgeTarget,
};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use crate::keys::KeySet;
use crate::shard::Shard;

/// Unbounded single-shard cache
#[derive(Debug)]
pub struct BasicCache {
    keys: Arc<KeySet>,
    shard: Arc<Shard>,
}

impl BasicCache {
    /// Create an empty cache
    pub fn new() -> Self {
        let keys = Arc::new(KeySet::new());
        Self {
            shard: Arc::new(Shard::new(keys.clone(), Vec::new())),
            keys,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.shard.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.shard.is_empty()
    }
}

impl Default for BasicCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PurgeTarget for BasicCache {
    fn resolve_shard(&self, _node_id: &NodeId) -> Option<Arc<dyn CacheShard>> {
        Some(self.shard.clone())
    }
}

impl OutputCache for BasicCache {
    fn variant(&self) -> &'static str {
        "basic"
    }

    fn bind_prompt(&self, prompt: Arc<Prompt>) {
        self.keys.bind(prompt);
    }

    fn describe_node(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError> {
        self.keys.describe(node_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeOutput> {
        self.keys.key(node_id).and_then(|key| self.shard.get(&key))
    }

    fn set(&self, node_id: &NodeId, value: NodeOutput) {
        match self.keys.key(node_id) {
            Some(key) => self.shard.insert(key, value),
            None => debug!(node_id = %node_id, "Node not in bound prompt, not caching"),
        }
    }

    fn snapshot(&self) -> Result<Vec<CacheEntrySnapshot>, CoreError> {
        Ok(self.shard.snapshot())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
