//! Graph execution interfaces and a reference cached executor
//!
//! [`PromptExecutor`] is the seam the run lifecycle hooks decorate. Hosts bring
//! their own; [`CachedGraphExecutor`] runs a prompt in dependency order on top
//! of an [`OutputCache`] and is what the inspector and the tests drive.

use async_trait::async_trait;
use nocache_core::{
    CoreError, NodeDescriptor, NodeId, NodeInput, NodeOutput, OutputCache, OutputValue, Prompt,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Nodes whose runner was invoked
    pub executed: usize,
    /// Nodes served from the cache
    pub cache_hits: usize,
}

/// Notified as nodes finish
pub trait NodeObserver: Send + Sync {
    /// `node` produced its output, from the cache when `cached`
    fn node_finished(&self, node: &NodeDescriptor, cached: bool);
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl NodeObserver for NoopObserver {
    fn node_finished(&self, _node: &NodeDescriptor, _cached: bool) {}
}

/// Executes a whole prompt
#[async_trait]
pub trait PromptExecutor: Send + Sync {
    /// Run every node of `prompt`
    async fn execute(
        &self,
        prompt: Arc<Prompt>,
        observer: &dyn NodeObserver,
    ) -> Result<ExecutionSummary, CoreError>;
}

/// Inputs of a node with links replaced by upstream output values
pub type ResolvedInputs = BTreeMap<String, OutputValue>;

/// Computes one node
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Produce the output of `node`
    async fn run(&self, node: &NodeDescriptor, inputs: ResolvedInputs)
        -> Result<NodeOutput, CoreError>;
}

/// Order nodes so that every node follows the nodes it reads from.
///
/// Ready nodes are taken in id order, so the result is deterministic.
pub fn topological_order(prompt: &Prompt) -> Result<Vec<NodeId>, CoreError> {
    let mut pending: HashMap<&NodeId, usize> = HashMap::with_capacity(prompt.len());
    let mut dependents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();

    for node in prompt.iter() {
        let sources: BTreeSet<&NodeId> = node.upstream().collect();
        for source in &sources {
            if !prompt.contains(source) {
                return Err(CoreError::ExecutionError(format!(
                    "Node {} reads from unknown node {}",
                    node.id, source
                )));
            }
            dependents.entry(*source).or_default().push(&node.id);
        }
        pending.insert(&node.id, sources.len());
    }

    let mut ready: BTreeSet<&NodeId> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(prompt.len());

    while let Some(node_id) = ready.pop_first() {
        order.push(node_id.clone());
        for dependent in dependents.get(node_id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() != prompt.len() {
        let stuck: Vec<String> = pending
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| id.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        return Err(CoreError::ExecutionError(format!(
            "Prompt contains a cycle through nodes: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// Runs prompts node by node, reusing cached outputs
pub struct CachedGraphExecutor {
    cache: Arc<dyn OutputCache>,
    runner: Arc<dyn NodeRunner>,
}

impl CachedGraphExecutor {
    /// Create an executor writing through `cache`
    pub fn new(cache: Arc<dyn OutputCache>, runner: Arc<dyn NodeRunner>) -> Self {
        Self { cache, runner }
    }

    /// Cache the executor reads and writes
    pub fn cache(&self) -> &Arc<dyn OutputCache> {
        &self.cache
    }

    fn resolve_inputs(
        node: &NodeDescriptor,
        outputs: &HashMap<NodeId, NodeOutput>,
    ) -> Result<ResolvedInputs, CoreError> {
        let mut resolved = ResolvedInputs::new();
        for (name, input) in &node.inputs {
            let value = match input {
                NodeInput::Literal(value) => OutputValue::Scalar(value.clone()),
                NodeInput::Link(source, slot) => outputs
                    .get(source)
                    .and_then(|output| output.slot(*slot))
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::ExecutionError(format!(
                            "Node {} input {} needs output {} of node {}, which is missing",
                            node.id, name, slot, source
                        ))
                    })?,
            };
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for CachedGraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedGraphExecutor")
            .field("cache", &self.cache)
            .finish()
    }
}

#[async_trait]
impl PromptExecutor for CachedGraphExecutor {
    async fn execute(
        &self,
        prompt: Arc<Prompt>,
        observer: &dyn NodeObserver,
    ) -> Result<ExecutionSummary, CoreError> {
        self.cache.bind_prompt(prompt.clone());
        let order = topological_order(&prompt)?;

        let mut summary = ExecutionSummary::default();
        let mut outputs: HashMap<NodeId, NodeOutput> = HashMap::with_capacity(order.len());

        for node_id in order {
            let Some(node) = prompt.get(&node_id) else {
                continue;
            };

            let (output, cached) = match self.cache.get(&node_id) {
                Some(output) => {
                    trace!(node_id = %node_id, "Cache hit");
                    summary.cache_hits += 1;
                    (output, true)
                }
                None => {
                    let inputs = Self::resolve_inputs(node, &outputs)?;
                    let output = self.runner.run(node, inputs).await?;
                    self.cache.set(&node_id, output.clone());
                    summary.executed += 1;
                    (output, false)
                }
            };

            observer.node_finished(node, cached);
            outputs.insert(node_id, output);
        }

        debug!(
            executed = summary.executed,
            cache_hits = summary.cache_hits,
            "Prompt executed"
        );
        Ok(summary)
    }
}
