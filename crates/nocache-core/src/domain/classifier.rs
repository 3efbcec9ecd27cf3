//! Cache eligibility rules
//!
//! A node's output may not be cached when any of the following holds, checked
//! in order:
//!
//! 1. its class tag is listed in the configuration's excluded classes,
//! 2. its class is registered with the never-cache marker,
//! 3. its display title contains `@nocache` or `@nc` (any case).
//!
//! Missing or malformed descriptors are cacheable.

use std::sync::Arc;
use tracing::trace;

use crate::domain::config::ClassifierConfig;
use crate::domain::node::{NodeDescriptor, NodeId};
use crate::domain::registry::NodeClassRegistry;

/// Title markers that exclude a node from caching
pub const NO_CACHE_MARKERS: [&str; 2] = ["@nocache", "@nc"];

/// Title marker that schedules memory reclamation after the node finishes
pub const RECLAIM_MARKER: &str = "@gc";

/// Why a node was classified non-cacheable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// Class tag listed in the configuration
    ExcludedClass,
    /// Class registered as never cached
    NeverCacheClass,
    /// Title carries a no-cache marker
    TitleMarker,
}

impl Exclusion {
    /// Short label used in logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            Exclusion::ExcludedClass => "excluded class",
            Exclusion::NeverCacheClass => "never-cache class",
            Exclusion::TitleMarker => "title marker",
        }
    }
}

/// Whether a title asks for the node to bypass the cache
pub fn title_requests_no_cache(title: &str) -> bool {
    let lowered = title.to_lowercase();
    NO_CACHE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Whether a title asks for memory reclamation after the node runs
pub fn title_requests_reclaim(title: &str) -> bool {
    title.to_lowercase().contains(RECLAIM_MARKER)
}

/// Decides whether node outputs may enter the cache
#[derive(Debug, Clone)]
pub struct Classifier {
    registry: Arc<NodeClassRegistry>,
}

impl Classifier {
    /// Create a classifier backed by the host's class registry
    pub fn new(registry: Arc<NodeClassRegistry>) -> Self {
        Self { registry }
    }

    /// The class registry consulted for never-cache markers
    pub fn registry(&self) -> &Arc<NodeClassRegistry> {
        &self.registry
    }

    /// First matching exclusion for a node, or `None` when it may be cached
    pub fn classify(
        &self,
        descriptor: Option<&NodeDescriptor>,
        config: &ClassifierConfig,
    ) -> Option<Exclusion> {
        let descriptor = descriptor?;

        if !descriptor.class_type.is_empty() {
            if config.excluded_class_tags.contains(&descriptor.class_type) {
                return Some(Exclusion::ExcludedClass);
            }

            if self.registry.is_never_cache(&descriptor.class_type) {
                return Some(Exclusion::NeverCacheClass);
            }
        }

        descriptor
            .title()
            .filter(|title| title_requests_no_cache(title))
            .map(|_| Exclusion::TitleMarker)
    }

    /// Whether the node's output must bypass the cache
    pub fn is_non_cacheable(
        &self,
        node_id: &NodeId,
        descriptor: Option<&NodeDescriptor>,
        config: &ClassifierConfig,
    ) -> bool {
        let exclusion = self.classify(descriptor, config);
        trace!(node_id = %node_id, ?exclusion, "Classified node");
        exclusion.is_some()
    }
}
