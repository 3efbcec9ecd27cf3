//! Process-wide NoCache state
//!
//! One [`NoCacheRuntime`] per host process owns the configuration, the class
//! registry, the classifier and the reclamation worker, and remembers every
//! cache it installed the write interceptor on so that each run can purge all
//! of them.

use nocache_core::{
    Classifier, ConfigStore, NoCacheInterceptor, NodeClassInfo, NodeClassRegistry, OutputCache,
    StalePurger, CONFIG_NODE_CLASS,
};
use nocache_monitoring::{MemoryReclaimer, MemoryReport, ReclaimWorker};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

use crate::session::NoCacheExecutor;
use crate::PromptExecutor;

/// Shared state of the cache-bypass layer
pub struct NoCacheRuntime {
    config: Arc<ConfigStore>,
    registry: Arc<NodeClassRegistry>,
    classifier: Arc<Classifier>,
    purger: StalePurger,
    reclaimer: ReclaimWorker,
    caches: RwLock<Vec<Arc<dyn OutputCache>>>,
    last_report: Mutex<Option<MemoryReport>>,
}

impl NoCacheRuntime {
    /// Create a runtime with an empty class registry and no reclaimer
    pub fn new(config: ConfigStore) -> Self {
        Self::with_parts(
            Arc::new(config),
            Arc::new(NodeClassRegistry::new()),
            ReclaimWorker::default(),
        )
    }

    /// Create a runtime from explicit collaborators
    pub fn with_parts(
        config: Arc<ConfigStore>,
        registry: Arc<NodeClassRegistry>,
        reclaimer: ReclaimWorker,
    ) -> Self {
        // The configuration node's own output must never be cached.
        registry.register(
            NodeClassInfo::new(CONFIG_NODE_CLASS)
                .with_display_name("No Cache Config")
                .never_cache(),
        );

        let classifier = Arc::new(Classifier::new(registry.clone()));
        info!(
            config_file = ?config.path(),
            defaults = ?config.defaults(),
            "NoCache runtime initialized"
        );

        Self {
            purger: StalePurger::new(classifier.clone()),
            config,
            registry,
            classifier,
            reclaimer,
            caches: RwLock::new(Vec::new()),
            last_report: Mutex::new(None),
        }
    }

    /// Replace the reclaimer
    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn MemoryReclaimer>) -> Self {
        self.reclaimer = ReclaimWorker::new(reclaimer).with_schedule(self.reclaimer.schedule());
        self
    }

    /// Replace the reclamation worker
    pub fn with_reclaim_worker(mut self, reclaimer: ReclaimWorker) -> Self {
        self.reclaimer = reclaimer;
        self
    }

    /// Configuration store
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Node class registry
    pub fn registry(&self) -> &Arc<NodeClassRegistry> {
        &self.registry
    }

    /// Eligibility classifier
    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    /// Stale-entry purger
    pub fn purger(&self) -> &StalePurger {
        &self.purger
    }

    /// Reclamation worker
    pub fn reclaimer(&self) -> &ReclaimWorker {
        &self.reclaimer
    }

    /// Install the write interceptor on `cache` and register it for purging.
    ///
    /// Returns the cache the host must write through. Installing a cache
    /// again, wrapped or not, returns the already installed wrapper.
    pub fn install_cache(&self, cache: Arc<dyn OutputCache>) -> Arc<dyn OutputCache> {
        let mut caches = self.caches.write();
        if let Some(installed) = caches.iter().find(|installed| same_cache(installed, &cache)) {
            debug!(variant = cache.variant(), "Cache already installed");
            return installed.clone();
        }

        let wrapped =
            NoCacheInterceptor::install(cache, self.classifier.clone(), self.config.clone());
        info!(variant = wrapped.variant(), "Installed cache write interceptor");
        caches.push(wrapped.clone());
        wrapped
    }

    /// Installed caches
    pub fn caches(&self) -> Vec<Arc<dyn OutputCache>> {
        self.caches.read().clone()
    }

    /// Decorate `inner` with the run lifecycle hooks
    pub fn wrap_executor<E: PromptExecutor>(self: &Arc<Self>, inner: E) -> NoCacheExecutor<E> {
        NoCacheExecutor::new(inner, self.clone())
    }

    /// Report of the most recent debug run
    pub fn last_report(&self) -> Option<MemoryReport> {
        self.last_report.lock().clone()
    }

    pub(crate) fn store_report(&self, report: MemoryReport) {
        *self.last_report.lock() = Some(report);
    }
}

impl std::fmt::Debug for NoCacheRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoCacheRuntime")
            .field("config", &self.config)
            .field("caches", &self.caches.read().len())
            .field("reclaimer", &self.reclaimer)
            .finish()
    }
}

fn data_ptr(cache: &Arc<dyn OutputCache>) -> *const () {
    Arc::as_ptr(cache) as *const ()
}

/// Whether `installed` is `candidate` or wraps it
fn same_cache(installed: &Arc<dyn OutputCache>, candidate: &Arc<dyn OutputCache>) -> bool {
    if data_ptr(installed) == data_ptr(candidate) {
        return true;
    }
    installed
        .as_any()
        .downcast_ref::<NoCacheInterceptor>()
        .map_or(false, |interceptor| data_ptr(interceptor.inner()) == data_ptr(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nocache_cache_inmemory::{BasicCache, LruOutputCache};
    use nocache_core::ClassifierConfig;

    fn runtime() -> NoCacheRuntime {
        NoCacheRuntime::new(ConfigStore::new(ClassifierConfig::default()))
    }

    #[test]
    fn test_install_is_idempotent() {
        let runtime = runtime();
        let cache: Arc<dyn OutputCache> = Arc::new(BasicCache::new());

        let first = runtime.install_cache(cache.clone());
        let again = runtime.install_cache(cache);
        let rewrapped = runtime.install_cache(first.clone());

        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &rewrapped));
        assert_eq!(runtime.caches().len(), 1);
        assert!(NoCacheInterceptor::is_installed(first.as_ref()));
    }

    #[test]
    fn test_distinct_caches_are_all_registered() {
        let runtime = runtime();
        runtime.install_cache(Arc::new(BasicCache::new()));
        runtime.install_cache(Arc::new(LruOutputCache::new(4)));

        let variants: Vec<_> = runtime.caches().iter().map(|cache| cache.variant()).collect();
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn test_config_node_class_is_never_cached() {
        let runtime = runtime();
        assert!(runtime.registry().is_never_cache(CONFIG_NODE_CLASS));
    }
}
