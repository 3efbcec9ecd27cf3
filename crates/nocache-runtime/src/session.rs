//! Run lifecycle hooks around a host executor
//!
//! Order of one run:
//! 1. resolve the run's override from its configuration node;
//! 2. enter the run scope, carrying the override and the prompt;
//! 3. bind the prompt to every installed cache and purge stale entries;
//! 4. execute, reclaiming memory after executed (not cached) nodes marked `@gc`;
//! 5. report cache memory when `debug` is on;
//! 6. leave the scope and hand back the executor's result.

use async_trait::async_trait;
use nocache_core::{
    resolve_run_override, title_requests_reclaim, CoreError, NodeDescriptor, OutputCache, Prompt,
    RunId, RunScope,
};
use nocache_monitoring::{MemoryReport, ReclaimWorker, REPORT_THRESHOLD_BYTES};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionSummary, NodeObserver, PromptExecutor};
use crate::runtime::NoCacheRuntime;

/// Forwards to the host observer and schedules reclamation after `@gc` nodes
struct ReclaimOnMarker<'a> {
    inner: &'a dyn NodeObserver,
    reclaimer: &'a ReclaimWorker,
}

impl NodeObserver for ReclaimOnMarker<'_> {
    fn node_finished(&self, node: &NodeDescriptor, cached: bool) {
        self.inner.node_finished(node, cached);
        if cached {
            return;
        }
        if node.title().is_some_and(title_requests_reclaim) {
            debug!(node_id = %node.id, "Scheduling memory reclamation after node");
            self.reclaimer
                .trigger_repeated(&format!("@gc after node {}", node.id));
        }
    }
}

/// Executor decorated with the cache-bypass run lifecycle
pub struct NoCacheExecutor<E> {
    inner: E,
    runtime: Arc<NoCacheRuntime>,
}

impl<E: PromptExecutor> NoCacheExecutor<E> {
    /// Decorate `inner`
    pub fn new(inner: E, runtime: Arc<NoCacheRuntime>) -> Self {
        Self { inner, runtime }
    }

    /// The decorated executor
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Runtime the hooks use
    pub fn runtime(&self) -> &Arc<NoCacheRuntime> {
        &self.runtime
    }

    async fn run_in_scope(
        &self,
        run_id: RunId,
        prompt: Arc<Prompt>,
        observer: &dyn NodeObserver,
    ) -> Result<ExecutionSummary, CoreError> {
        let config = self.runtime.config().effective();
        let caches = self.runtime.caches();
        debug!(run_id = %run_id, enabled = config.enabled, debug = config.debug, "Starting run");

        for cache in &caches {
            cache.bind_prompt(prompt.clone());
        }
        let purged = self.runtime.purger().purge_all(&caches, &prompt, &config);
        if purged.purged_count() > 0 {
            self.runtime.reclaimer().trigger("stale cache entries purged");
        }

        let observer = ReclaimOnMarker {
            inner: observer,
            reclaimer: self.runtime.reclaimer(),
        };
        let result = self.inner.execute(prompt, &observer).await;

        if config.debug {
            self.report_memory(run_id, &caches);
        }
        result
    }

    fn report_memory(&self, run_id: RunId, caches: &[Arc<dyn OutputCache>]) {
        let mut entries = Vec::new();
        for cache in caches {
            match cache.snapshot() {
                Ok(snapshot) => entries.extend(snapshot),
                Err(e) => warn!(variant = cache.variant(), "Skipping cache in memory report: {}", e),
            }
        }

        let report = MemoryReport::analyze(&entries, REPORT_THRESHOLD_BYTES);
        info!(run_id = %run_id, "Cache memory report\n{}", report);
        self.runtime.store_report(report);
    }
}

#[async_trait]
impl<E: PromptExecutor> PromptExecutor for NoCacheExecutor<E> {
    async fn execute(
        &self,
        prompt: Arc<Prompt>,
        observer: &dyn NodeObserver,
    ) -> Result<ExecutionSummary, CoreError> {
        let config_override = resolve_run_override(&prompt).map_err(|e| {
            error!("Refusing to run prompt: {}", e);
            e
        })?;

        let scope = RunScope::new(config_override).with_prompt(prompt.clone());
        let run_id = scope.run_id();
        scope
            .scope(self.run_in_scope(run_id, prompt, observer))
            .await
    }
}

impl<E> std::fmt::Debug for NoCacheExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoCacheExecutor")
            .field("runtime", &self.runtime)
            .finish()
    }
}
