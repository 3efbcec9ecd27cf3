//! Stale-entry purger
//!
//! Before a run starts, entries left behind by nodes that are now
//! non-cacheable are removed from every cache layer, together with the
//! per-key bookkeeping of that layer. An entry whose key is also owned by a
//! cacheable node of the same prompt belongs to that node and is kept.
//! Purging is idempotent and never aborts a run: failures are logged and
//! skipped.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::domain::cache::{CacheKey, CacheShard, OutputCache, PurgeTarget};
use crate::domain::classifier::Classifier;
use crate::domain::config::ClassifierConfig;
use crate::domain::node::NodeId;
use crate::domain::prompt::Prompt;

/// Outcome of a purge pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Nodes classified non-cacheable
    pub flagged: Vec<NodeId>,
    /// Nodes whose entry was removed, once per removal
    pub purged: Vec<NodeId>,
    /// Failures that were skipped
    pub failures: Vec<(NodeId, String)>,
}

impl PurgeReport {
    /// Number of removed entries
    pub fn purged_count(&self) -> usize {
        self.purged.len()
    }

    /// Fold another pass into this one
    pub fn merge(&mut self, other: PurgeReport) {
        for node_id in other.flagged {
            if !self.flagged.contains(&node_id) {
                self.flagged.push(node_id);
            }
        }
        self.purged.extend(other.purged);
        self.failures.extend(other.failures);
    }
}

/// Removes stale entries of non-cacheable nodes
#[derive(Debug, Clone)]
pub struct StalePurger {
    classifier: Arc<Classifier>,
}

impl StalePurger {
    /// Create a purger using `classifier`
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self { classifier }
    }

    /// Purge one cache for the nodes of `prompt`
    pub fn purge<T>(&self, cache: &T, prompt: &Prompt, config: &ClassifierConfig) -> PurgeReport
    where
        T: PurgeTarget + ?Sized,
    {
        let mut report = PurgeReport::default();
        if !config.enabled {
            debug!("Caching rules disabled, skipping purge");
            return report;
        }

        let (flagged, cacheable): (Vec<_>, Vec<_>) = prompt
            .iter()
            .partition(|node| self.classifier.is_non_cacheable(&node.id, Some(*node), config));

        let owned: HashSet<(usize, CacheKey)> = cacheable
            .iter()
            .filter_map(|node| {
                let shard = cache.resolve_shard(&node.id)?;
                let key = shard.cache_key(&node.id)?;
                Some((shard_address(&shard), key))
            })
            .collect();

        for node in flagged {
            report.flagged.push(node.id.clone());

            let Some(shard) = cache.resolve_shard(&node.id) else {
                trace!(node_id = %node.id, "No cache shard for node");
                continue;
            };

            if let Some(key) = shard.cache_key(&node.id) {
                if owned.contains(&(shard_address(&shard), key)) {
                    debug!(node_id = %node.id, "Entry shared with a cacheable node, keeping it");
                    continue;
                }
            }

            match Self::purge_node(&node.id, shard.as_ref()) {
                Ok(true) => report.purged.push(node.id.clone()),
                Ok(false) => {}
                Err(message) => {
                    warn!(node_id = %node.id, "Failed to purge cache entry: {}", message);
                    report.failures.push((node.id.clone(), message));
                }
            }
        }

        if report.purged_count() > 0 {
            info!(
                purged = report.purged_count(),
                flagged = report.flagged.len(),
                "Purged stale cache entries"
            );
        }
        report
    }

    /// Purge every cache layer and merge the reports
    pub fn purge_all(
        &self,
        caches: &[Arc<dyn OutputCache>],
        prompt: &Prompt,
        config: &ClassifierConfig,
    ) -> PurgeReport {
        let mut report = PurgeReport::default();
        for cache in caches {
            let pass = self.purge(cache.as_ref(), prompt, config);
            debug!(variant = cache.variant(), purged = pass.purged_count(), "Purged cache layer");
            report.merge(pass);
        }
        report
    }

    fn purge_node(node_id: &NodeId, shard: &dyn CacheShard) -> Result<bool, String> {
        let Some(key) = shard.cache_key(node_id) else {
            trace!(node_id = %node_id, "Node has no cache key in shard");
            return Ok(false);
        };

        if !shard.remove_entry(&key).map_err(|e| e.to_string())? {
            return Ok(false);
        }

        for store in shard.auxiliary_stores() {
            match store.remove(&key) {
                Ok(removed) => trace!(store = store.name(), removed, "Cleared bookkeeping"),
                Err(e) => warn!(
                    node_id = %node_id,
                    store = store.name(),
                    "Skipping bookkeeping cleanup: {}",
                    e
                ),
            }
        }

        debug!(node_id = %node_id, key = %key, "Removed cache entry");
        Ok(true)
    }
}

fn shard_address(shard: &Arc<dyn CacheShard>) -> usize {
    Arc::as_ptr(shard) as *const () as usize
}
