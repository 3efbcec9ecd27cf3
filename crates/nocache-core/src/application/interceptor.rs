//! Cache-write interceptor
//!
//! `NoCacheInterceptor` decorates any `OutputCache`. Writes for nodes that are
//! classified non-cacheable are dropped before they reach the wrapped cache,
//! and reads for them always miss; everything else is delegated unchanged.
//!
//! Nodes are resolved against the prompt of the run bound to the current task
//! when there is one, so overlapping runs on a shared cache classify their own
//! nodes. Outside a run the wrapped cache's bound prompt is used.

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::application::config_store::ConfigStore;
use crate::application::run_scope::RunScope;
use crate::domain::cache::{CacheEntrySnapshot, CacheShard, OutputCache, PurgeTarget};
use crate::domain::classifier::Classifier;
use crate::domain::node::{NodeDescriptor, NodeId};
use crate::domain::prompt::Prompt;
use crate::types::NodeOutput;
use crate::CoreError;

/// Decorator that suppresses cache writes for non-cacheable nodes
pub struct NoCacheInterceptor {
    inner: Arc<dyn OutputCache>,
    classifier: Arc<Classifier>,
    config: Arc<ConfigStore>,
    last_notice: Mutex<Option<String>>,
    suppressed: AtomicU64,
    notices: AtomicU64,
}

impl NoCacheInterceptor {
    /// Wrap `inner`, unless it already is an interceptor.
    ///
    /// Installing twice yields the same cache, so writes are never
    /// classified or reported more than once.
    pub fn install(
        inner: Arc<dyn OutputCache>,
        classifier: Arc<Classifier>,
        config: Arc<ConfigStore>,
    ) -> Arc<dyn OutputCache> {
        if Self::is_installed(inner.as_ref()) {
            debug!(variant = inner.variant(), "Cache write interceptor already installed");
            return inner;
        }

        debug!(variant = inner.variant(), "Installing cache write interceptor");
        Arc::new(Self {
            inner,
            classifier,
            config,
            last_notice: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            notices: AtomicU64::new(0),
        })
    }

    /// Whether `cache` is already wrapped
    pub fn is_installed(cache: &dyn OutputCache) -> bool {
        cache.as_any().is::<NoCacheInterceptor>()
    }

    /// The wrapped cache
    pub fn inner(&self) -> &Arc<dyn OutputCache> {
        &self.inner
    }

    /// Number of writes dropped so far
    pub fn suppressed_writes(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Number of skip notices emitted so far
    pub fn notices_emitted(&self) -> u64 {
        self.notices.load(Ordering::Relaxed)
    }

    /// Resolve the node; lookup failures yield no descriptor, which fails open.
    fn lookup(&self, node_id: &NodeId) -> Option<NodeDescriptor> {
        if let Some(prompt) = RunScope::current_prompt() {
            return prompt.get(node_id).cloned();
        }
        match self.inner.describe_node(node_id) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(node_id = %node_id, "Metadata lookup failed, allowing cache write: {}", e);
                None
            }
        }
    }

    fn notice(&self, node_id: &NodeId, descriptor: Option<&NodeDescriptor>) {
        let title = descriptor.and_then(NodeDescriptor::title).unwrap_or("");
        let message = format!("Skipping cache for node {} ({})", node_id, title);

        let mut last = self.last_notice.lock();
        if last.as_deref() == Some(message.as_str()) {
            return;
        }
        info!("{}", message);
        self.notices.fetch_add(1, Ordering::Relaxed);
        *last = Some(message);
    }
}

impl fmt::Debug for NoCacheInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoCacheInterceptor")
            .field("inner", &self.inner)
            .field("suppressed", &self.suppressed_writes())
            .finish()
    }
}

impl PurgeTarget for NoCacheInterceptor {
    fn resolve_shard(&self, node_id: &NodeId) -> Option<Arc<dyn CacheShard>> {
        self.inner.resolve_shard(node_id)
    }
}

impl OutputCache for NoCacheInterceptor {
    fn variant(&self) -> &'static str {
        self.inner.variant()
    }

    fn bind_prompt(&self, prompt: Arc<Prompt>) {
        self.inner.bind_prompt(prompt)
    }

    fn describe_node(&self, node_id: &NodeId) -> Result<Option<NodeDescriptor>, CoreError> {
        self.inner.describe_node(node_id)
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeOutput> {
        let config = self.config.effective();
        if config.enabled {
            let descriptor = self.lookup(node_id);
            if self
                .classifier
                .is_non_cacheable(node_id, descriptor.as_ref(), &config)
            {
                trace!(node_id = %node_id, "Non-cacheable node, bypassing cache read");
                return None;
            }
        }
        self.inner.get(node_id)
    }

    fn set(&self, node_id: &NodeId, value: NodeOutput) {
        let config = self.config.effective();
        if !config.enabled {
            return self.inner.set(node_id, value);
        }

        let descriptor = self.lookup(node_id);
        if !self
            .classifier
            .is_non_cacheable(node_id, descriptor.as_ref(), &config)
        {
            return self.inner.set(node_id, value);
        }

        self.suppressed.fetch_add(1, Ordering::Relaxed);
        if config.debug {
            self.notice(node_id, descriptor.as_ref());
        }
    }

    fn snapshot(&self) -> Result<Vec<CacheEntrySnapshot>, CoreError> {
        self.inner.snapshot()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
