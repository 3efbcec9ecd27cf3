use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Node identifier, unique within a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single node input in the host graph format.
///
/// Links are encoded as a two element array `[source_node_id, output_index]`;
/// anything else is a literal widget value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeInput {
    /// Output `1` of node `0`
    Link(NodeId, usize),
    /// Literal value
    Literal(Value),
}

impl NodeInput {
    /// Literal value, if this input is not connected to another node
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            NodeInput::Literal(value) => Some(value),
            NodeInput::Link(..) => None,
        }
    }

    /// Source node and output slot, if this input is a link
    pub fn as_link(&self) -> Option<(&NodeId, usize)> {
        match self {
            NodeInput::Link(node, slot) => Some((node, *slot)),
            NodeInput::Literal(_) => None,
        }
    }
}

/// Descriptor of one node in a prompt.
///
/// Owned by the host's graph representation; the cache layer only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node id (the key of the node in the prompt)
    #[serde(default)]
    pub id: NodeId,

    /// Class/type tag
    pub class_type: String,

    /// Inputs by name
    #[serde(default)]
    pub inputs: BTreeMap<String, NodeInput>,

    /// Free-form metadata, including the optional display title
    #[serde(default, rename = "_meta", skip_serializing_if = "Value::is_null")]
    pub meta: Value,

    /// Node that expanded into this one, for nodes created during execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
}

impl NodeDescriptor {
    /// Create a descriptor with no inputs and no metadata
    pub fn new(id: impl Into<NodeId>, class_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class_type: class_type.into(),
            inputs: BTreeMap::new(),
            meta: Value::Null,
            parent_id: None,
        }
    }

    /// Set the display title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        if !self.meta.is_object() {
            self.meta = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.meta {
            map.insert("title".to_string(), Value::String(title.into()));
        }
        self
    }

    /// Add a literal input
    pub fn with_literal(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), NodeInput::Literal(value));
        self
    }

    /// Add an input linked to another node's output slot
    pub fn with_link(mut self, name: impl Into<String>, source: impl Into<NodeId>, slot: usize) -> Self {
        self.inputs.insert(name.into(), NodeInput::Link(source.into(), slot));
        self
    }

    /// Mark this node as expanded from `parent`
    pub fn with_parent(mut self, parent: impl Into<NodeId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    /// Display title, when present and a string
    pub fn title(&self) -> Option<&str> {
        self.meta.get("title").and_then(Value::as_str)
    }

    /// Nodes this node reads from
    pub fn upstream(&self) -> impl Iterator<Item = &NodeId> {
        self.inputs.values().filter_map(|input| input.as_link().map(|(node, _)| node))
    }
}
