//! Input-signature cache keys
//!
//! A node's key hashes its class tag, its literal inputs and, for linked
//! inputs, the key of the upstream node plus the output slot. Identical
//! sub-graphs therefore share keys across runs.

use lru::LruCache;
use nocache_core::{CacheKey, CoreError, NodeDescriptor, NodeId, NodeInput, Prompt, RunScope};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Derive the key of every node in `prompt`
pub fn derive_keys(prompt: &Prompt) -> HashMap<NodeId, CacheKey> {
    let mut keys = HashMap::with_capacity(prompt.len());
    let mut in_progress = HashSet::new();
    for node_id in prompt.node_ids() {
        signature(prompt, node_id, &mut keys, &mut in_progress);
    }
    keys
}

fn signature(
    prompt: &Prompt,
    node_id: &NodeId,
    keys: &mut HashMap<NodeId, CacheKey>,
    in_progress: &mut HashSet<NodeId>,
) -> String {
    if let Some(key) = keys.get(node_id) {
        return key.0.clone();
    }
    let Some(node) = prompt.get(node_id) else {
        return format!("missing:{}", node_id);
    };
    if !in_progress.insert(node_id.clone()) {
        warn!(node_id = %node_id, "Link cycle while deriving cache keys");
        return format!("cycle:{}", node_id);
    }

    let mut hasher = Sha256::new();
    hasher.update(node.class_type.as_bytes());
    for (name, input) in &node.inputs {
        hasher.update(b"\0");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        match input {
            NodeInput::Literal(value) => {
                hasher.update(b"lit:");
                hasher.update(value.to_string().as_bytes());
            }
            NodeInput::Link(source, slot) => {
                let upstream = signature(prompt, source, keys, in_progress);
                hasher.update(format!("link:{}:{}", upstream, slot).as_bytes());
            }
        }
    }

    let key = format!("sig:{}", hex::encode(hasher.finalize()));
    in_progress.remove(node_id);
    keys.insert(node_id.clone(), CacheKey(key.clone()));
    key
}

/// Bound prompts kept resolvable for runs still in flight
const RETAINED_BINDINGS: usize = 16;

#[derive(Debug)]
struct Binding {
    prompt: Arc<Prompt>,
    keys: HashMap<NodeId, CacheKey>,
    nodes_by_key: HashMap<CacheKey, NodeId>,
}

impl Binding {
    fn derive(prompt: Arc<Prompt>) -> Self {
        let keys = derive_keys(&prompt);
        let mut nodes_by_key = HashMap::with_capacity(keys.len());
        for (node_id, key) in &keys {
            // several nodes may share a signature; keep the lowest id
            nodes_by_key
                .entry(key.clone())
                .and_modify(|existing: &mut NodeId| {
                    if node_id < existing {
                        *existing = node_id.clone();
                    }
                })
                .or_insert_with(|| node_id.clone());
        }
        Self {
            prompt,
            keys,
            nodes_by_key,
        }
    }
}

/// The prompts a cache is serving and their derived keys
///
/// Lookups made inside a run scope resolve against that run's prompt, so
/// overlapping runs sharing one cache each see their own nodes. Outside a run
/// the most recently bound prompt is used.
pub struct KeySet {
    latest: RwLock<Option<Arc<Binding>>>,
    // keyed by prompt address; the binding holds the prompt, so the address
    // cannot be reused while the entry lives
    retained: Mutex<LruCache<usize, Arc<Binding>>>,
}

impl KeySet {
    /// Create an unbound key set
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(RETAINED_BINDINGS).unwrap_or(NonZeroUsize::MIN);
        Self {
            latest: RwLock::new(None),
            retained: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Bind a prompt. Returns `false` when the same prompt is already bound.
    pub fn bind(&self, prompt: Arc<Prompt>) -> bool {
        let mut latest = self.latest.write();
        if latest
            .as_ref()
            .is_some_and(|binding| Arc::ptr_eq(&binding.prompt, &prompt))
        {
            return false;
        }

        let binding = self.binding_for(&prompt);
        debug!(nodes = binding.keys.len(), "Bound prompt to cache");
        *latest = Some(binding);
        true
    }

    fn binding_for(&self, prompt: &Arc<Prompt>) -> Arc<Binding> {
        let address = Arc::as_ptr(prompt) as usize;
        let mut retained = self.retained.lock();
        if let Some(binding) = retained.get(&address) {
            if Arc::ptr_eq(&binding.prompt, prompt) {
                return binding.clone();
            }
        }

        let binding = Arc::new(Binding::derive(prompt.clone()));
        retained.put(address, binding.clone());
        binding
    }

    fn resolve(&self) -> Option<Arc<Binding>> {
        let latest = self.latest.read().clone();
        let Some(prompt) = RunScope::current_prompt() else {
            return latest;
        };
        match latest {
            Some(binding) if Arc::ptr_eq(&binding.prompt, &prompt) => Some(binding),
            _ => Some(self.binding_for(&prompt)),
        }
    }

    /// Prompt lookups resolve against
    pub fn prompt(&self) -> Option<Arc<Prompt>> {
        self.resolve().map(|binding| binding.prompt.clone())
    }

    /// Key of a node
    pub fn key(&self, node_id: &NodeId) -> Option<CacheKey> {
        self.resolve()?.keys.get(node_id).cloned()
    }

    /// Node owning a key
    pub fn node_for(&self, key: &CacheKey) -> Option<NodeId> {
        self.resolve()?.nodes_by_key.get(key).cloned()
    }

    /// Descriptor of a node
    pub fn describe(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError> {
        Ok(self
            .resolve()
            .and_then(|binding| binding.prompt.get(node_id).cloned()))
    }

    /// Keys of the nodes `node_id` reads from
    pub fn upstream_keys(&self, node_id: &NodeId) -> Vec<CacheKey> {
        let Some(binding) = self.resolve() else {
            return Vec::new();
        };
        let Some(node) = binding.prompt.get(node_id) else {
            return Vec::new();
        };
        node.upstream()
            .filter_map(|source| binding.keys.get(source).cloned())
            .collect()
    }
}

impl Default for KeySet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("bound", &self.latest.read().is_some())
            .field("retained", &self.retained.lock().len())
            .finish()
    }
}
