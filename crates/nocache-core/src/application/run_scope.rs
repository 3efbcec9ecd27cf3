//! Run-scoped configuration context
//!
//! A run's override and prompt live in a task-local binding entered with
//! [`RunScope::scope`]. Code executing inside that future (including the
//! cache-write interceptor and the caches deriving keys) sees them;
//! concurrently running tasks do not. The binding is dropped with the future, so it is released on success,
//! error, panic and cancellation alike.

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::config::ConfigOverride;
use crate::domain::prompt::Prompt;
use crate::CoreError;

/// Class tag of the node that carries a run's configuration
pub const CONFIG_NODE_CLASS: &str = "NoCacheConfig";

tokio::task_local! {
    static CURRENT_RUN: RunScope;
}

/// Identifier of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a fresh run id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings bound to one run for its whole lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct RunScope {
    run_id: RunId,
    config_override: ConfigOverride,
    prompt: Option<Arc<Prompt>>,
}

impl RunScope {
    /// Create a scope with a fresh run id
    pub fn new(config_override: ConfigOverride) -> Self {
        Self {
            run_id: RunId::new(),
            config_override,
            prompt: None,
        }
    }

    /// Attach the prompt the run executes
    pub fn with_prompt(mut self, prompt: Arc<Prompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Run id
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Override carried by this run
    pub fn config_override(&self) -> ConfigOverride {
        self.config_override
    }

    /// Prompt of this run
    pub fn prompt(&self) -> Option<&Arc<Prompt>> {
        self.prompt.as_ref()
    }

    /// Scope bound to the current task, if any
    pub fn current() -> Option<RunScope> {
        CURRENT_RUN.try_with(|scope| scope.clone()).ok()
    }

    /// Prompt of the run bound to the current task, if any
    pub fn current_prompt() -> Option<Arc<Prompt>> {
        CURRENT_RUN
            .try_with(|scope| scope.prompt.clone())
            .ok()
            .flatten()
    }

    /// Drive `future` with this scope bound
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        debug!(run_id = %self.run_id, "Entering run scope");
        let run_id = self.run_id;
        let output = CURRENT_RUN.scope(self, future).await;
        debug!(run_id = %run_id, "Released run scope");
        output
    }

    /// Call `f` with this scope bound
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_RUN.sync_scope(self, f)
    }
}

/// Derive a run's override from its configuration node.
///
/// More than one configuration node is an error. With exactly one, each of
/// `enabled`/`debug` given as a literal boolean overrides the default; linked
/// or non-boolean inputs leave that setting at the default.
pub fn resolve_run_override(prompt: &Prompt) -> Result<ConfigOverride, CoreError> {
    let config_nodes: Vec<_> = prompt.nodes_of_class(CONFIG_NODE_CLASS).collect();

    match config_nodes.as_slice() {
        [] => Ok(ConfigOverride::default()),
        [node] => {
            let literal_flag = |name: &str| -> Option<bool> {
                let input = node.inputs.get(name)?;
                match input.as_literal() {
                    Some(Value::Bool(flag)) => Some(*flag),
                    Some(other) => {
                        warn!(node_id = %node.id, "Ignoring non-boolean {} input: {}", name, other);
                        None
                    }
                    None => {
                        debug!(node_id = %node.id, "{} input is linked, keeping default", name);
                        None
                    }
                }
            };

            let config_override = ConfigOverride {
                enabled: literal_flag("enabled"),
                debug: literal_flag("debug"),
            };
            debug!(node_id = %node.id, ?config_override, "Resolved run override");
            Ok(config_override)
        }
        many => Err(CoreError::ConfigurationAmbiguity {
            count: many.len(),
            node_ids: many.iter().map(|node| node.id.to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::NodeDescriptor;
    use serde_json::json;

    #[test]
    fn test_no_config_node() {
        let prompt = Prompt::from_nodes(vec![NodeDescriptor::new("1", "KSampler")]);
        assert!(resolve_run_override(&prompt).unwrap().is_empty());
    }

    #[test]
    fn test_literal_inputs_override() {
        let prompt = Prompt::from_nodes(vec![NodeDescriptor::new("5", CONFIG_NODE_CLASS)
            .with_literal("enabled", json!(false))
            .with_literal("debug", json!(true))]);

        assert_eq!(
            resolve_run_override(&prompt).unwrap(),
            ConfigOverride {
                enabled: Some(false),
                debug: Some(true)
            }
        );
    }

    #[test]
    fn test_linked_input_keeps_default() {
        let prompt = Prompt::from_nodes(vec![
            NodeDescriptor::new("1", "PrimitiveBoolean"),
            NodeDescriptor::new("5", CONFIG_NODE_CLASS)
                .with_link("enabled", "1", 0)
                .with_literal("debug", json!("yes")),
        ]);

        assert!(resolve_run_override(&prompt).unwrap().is_empty());
    }

    #[test]
    fn test_two_config_nodes_is_an_error() {
        let prompt = Prompt::from_nodes(vec![
            NodeDescriptor::new("3", CONFIG_NODE_CLASS),
            NodeDescriptor::new("8", CONFIG_NODE_CLASS),
        ]);

        assert_eq!(
            resolve_run_override(&prompt),
            Err(CoreError::ConfigurationAmbiguity {
                count: 2,
                node_ids: vec!["3".to_string(), "8".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_scope_is_released_after_future() {
        assert!(RunScope::current().is_none());

        let scope = RunScope::new(ConfigOverride {
            enabled: None,
            debug: Some(true),
        });
        let run_id = scope.run_id();

        let seen = scope
            .scope(async { RunScope::current().map(|s| s.run_id()) })
            .await;

        assert_eq!(seen, Some(run_id));
        assert!(RunScope::current().is_none());
    }

    #[tokio::test]
    async fn test_scope_is_released_after_error() {
        let result: Result<(), CoreError> = RunScope::new(ConfigOverride::default())
            .scope(async { Err(CoreError::ExecutionError("node failed".to_string())) })
            .await;

        assert!(result.is_err());
        assert!(RunScope::current().is_none());
    }

    #[test]
    fn test_scope_carries_prompt() {
        let prompt = Arc::new(Prompt::from_nodes(vec![NodeDescriptor::new("1", "KSampler")]));
        let scope = RunScope::new(ConfigOverride::default()).with_prompt(prompt.clone());

        let inside = scope.sync_scope(RunScope::current_prompt);

        assert!(inside.is_some_and(|seen| Arc::ptr_eq(&seen, &prompt)));
        assert!(RunScope::current_prompt().is_none());
    }

    #[test]
    fn test_sync_scope() {
        let scope = RunScope::new(ConfigOverride {
            enabled: Some(false),
            debug: None,
        });

        let inside = scope.sync_scope(|| RunScope::current().map(|s| s.config_override().enabled));
        assert_eq!(inside, Some(Some(false)));
        assert!(RunScope::current().is_none());
    }
}
