//! Hierarchical cache
//!
//! Nodes created by graph expansion are cached in a child shard of the node
//! that expanded them, recursively. A node's shard is found by walking its
//! parent chain from the outermost ancestor down.

use dashmap::DashMap;
use nocache_core::{
    CacheEntrySnapshot, CacheShard, CoreError, NodeDescriptor, NodeId, NodeOutput, OutputCache,
    Prompt, PurgeTarget,
};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use crate::keys::KeySet;
use crate::shard::Shard;

#[derive(Debug)]
struct Level {
    shard: Arc<Shard>,
    children: DashMap<NodeId, Arc<Level>>,
}

impl Level {
    fn new(keys: Arc<KeySet>) -> Self {
        Self {
            shard: Arc::new(Shard::new(keys, Vec::new())),
            children: DashMap::new(),
        }
    }

    fn collect(&self, out: &mut Vec<CacheEntrySnapshot>) {
        out.extend(self.shard.snapshot());
        for child in self.children.iter() {
            child.value().collect(out);
        }
    }
}

/// Cache partitioned by expansion parent
#[derive(Debug)]
pub struct HierarchicalCache {
    keys: Arc<KeySet>,
    root: Arc<Level>,
}

impl HierarchicalCache {
    /// Create an empty cache
    pub fn new() -> Self {
        let keys = Arc::new(KeySet::new());
        Self {
            root: Arc::new(Level::new(keys.clone())),
            keys,
        }
    }

    fn level_for(&self, node_id: &NodeId, create: bool) -> Option<Arc<Level>> {
        let ancestry = self
            .keys
            .prompt()
            .map(|prompt| prompt.ancestry(node_id))
            .unwrap_or_default();

        let mut level = self.root.clone();
        for parent in ancestry {
            let next = if create {
                level
                    .children
                    .entry(parent)
                    .or_insert_with(|| Arc::new(Level::new(self.keys.clone())))
                    .value()
                    .clone()
            } else {
                level.children.get(&parent)?.value().clone()
            };
            level = next;
        }
        Some(level)
    }

    /// Number of shards, root included
    pub fn shard_count(&self) -> usize {
        fn count(level: &Level) -> usize {
            1 + level
                .children
                .iter()
                .map(|child| count(child.value()))
                .sum::<usize>()
        }
        count(&self.root)
    }
}

impl Default for HierarchicalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PurgeTarget for HierarchicalCache {
    fn resolve_shard(&self, node_id: &NodeId) -> Option<Arc<dyn CacheShard>> {
        self.level_for(node_id, false)
            .map(|level| level.shard.clone() as Arc<dyn CacheShard>)
    }
}

impl OutputCache for HierarchicalCache {
    fn variant(&self) -> &'static str {
        "hierarchical"
    }

    fn bind_prompt(&self, prompt: Arc<Prompt>) {
        self.keys.bind(prompt);
    }

    fn describe_node(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError> {
        self.keys.describe(node_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeOutput> {
        let key = self.keys.key(node_id)?;
        self.level_for(node_id, false)?.shard.get(&key)
    }

    fn set(&self, node_id: &NodeId, value: NodeOutput) {
        let Some(key) = self.keys.key(node_id) else {
            debug!(node_id = %node_id, "Node not in bound prompt, not caching");
            return;
        };
        if let Some(level) = self.level_for(node_id, true) {
            level.shard.insert(key, value);
        }
    }

    fn snapshot(&self) -> Result<Vec<CacheEntrySnapshot>, CoreError> {
        let mut entries = Vec::new();
        self.root.collect(&mut entries);
        Ok(entries)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
