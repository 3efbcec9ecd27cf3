//! The node set of a single run
//!
//! A prompt is parsed from the host's API format, a JSON object keyed by node id:
//! `{"3": {"class_type": "KSampler", "inputs": {...}, "_meta": {"title": "..."}}}`.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::node::{NodeDescriptor, NodeId};
use crate::CoreError;

/// The graph submitted for one execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    nodes: BTreeMap<NodeId, NodeDescriptor>,
}

impl Prompt {
    /// Create an empty prompt
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a prompt from descriptors
    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        let mut prompt = Self::new();
        for node in nodes {
            prompt.insert(node);
        }
        prompt
    }

    /// Parse a prompt from its JSON text
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Parse a prompt from a JSON value.
    ///
    /// The top level must be an object. Individual node entries that do not
    /// parse are skipped with a warning; classification treats unknown nodes
    /// as cacheable.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let Value::Object(entries) = value else {
            return Err(CoreError::SerializationError(
                "prompt must be a JSON object keyed by node id".to_string(),
            ));
        };

        let mut prompt = Self::new();
        for (id, entry) in entries {
            match serde_json::from_value::<NodeDescriptor>(entry) {
                Ok(mut descriptor) => {
                    descriptor.id = NodeId(id);
                    prompt.insert(descriptor);
                }
                Err(e) => warn!("Skipping malformed node {} in prompt: {}", id, e),
            }
        }
        Ok(prompt)
    }

    /// Insert or replace a node
    pub fn insert(&mut self, descriptor: NodeDescriptor) {
        self.nodes.insert(descriptor.id.clone(), descriptor);
    }

    /// Look up a node
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(node_id)
    }

    /// Whether the prompt contains a node
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Iterate nodes in id order
    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Node ids in id order
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Nodes with the given class tag
    pub fn nodes_of_class<'a>(&'a self, class_type: &'a str) -> impl Iterator<Item = &'a NodeDescriptor> {
        self.nodes.values().filter(move |node| node.class_type == class_type)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the prompt has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parent chain of a node, outermost ancestor first.
    ///
    /// Stops at the first parent that is not part of the prompt or when a
    /// cycle is detected.
    pub fn ancestry(&self, node_id: &NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.get(node_id).and_then(|node| node.parent_id.clone());

        while let Some(parent) = current {
            if chain.contains(&parent) || &parent == node_id {
                warn!("Parent cycle detected while resolving ancestry of node {}", node_id);
                break;
            }
            current = self.get(&parent).and_then(|node| node.parent_id.clone());
            chain.push(parent);
        }

        chain.reverse();
        chain
    }
}
