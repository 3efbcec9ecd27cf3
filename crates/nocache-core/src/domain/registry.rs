//! Node class registry
//!
//! Mirrors the host's mapping from class tag to node definition. Only the
//! attributes the cache layer needs are tracked.

use dashmap::DashMap;
use tracing::debug;

/// Static attributes of a node class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeClassInfo {
    /// Class tag
    pub class_type: String,
    /// Human readable name
    pub display_name: Option<String>,
    /// Outputs of this class are never cached, regardless of run configuration
    pub never_cache: bool,
    /// Number of output slots
    pub output_count: usize,
}

impl NodeClassInfo {
    /// Describe a class with one output that may be cached
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            display_name: None,
            never_cache: false,
            output_count: 1,
        }
    }

    /// Set the never-cache marker
    pub fn never_cache(mut self) -> Self {
        self.never_cache = true;
        self
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the number of outputs
    pub fn with_outputs(mut self, count: usize) -> Self {
        self.output_count = count;
        self
    }
}

/// Registered node classes, keyed by class tag
#[derive(Debug, Default)]
pub struct NodeClassRegistry {
    classes: DashMap<String, NodeClassInfo>,
}

impl NodeClassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a class
    pub fn register(&self, info: NodeClassInfo) {
        debug!(class_type = %info.class_type, never_cache = info.never_cache, "Registering node class");
        self.classes.insert(info.class_type.clone(), info);
    }

    /// Look up a class
    pub fn get(&self, class_type: &str) -> Option<NodeClassInfo> {
        self.classes.get(class_type).map(|entry| entry.value().clone())
    }

    /// Whether the class carries the never-cache marker. Unknown classes do not.
    pub fn is_never_cache(&self, class_type: &str) -> bool {
        self.classes
            .get(class_type)
            .map(|entry| entry.never_cache)
            .unwrap_or(false)
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is registered
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
