//!
//! NoCache Core - selective cache bypass for node-graph executors
//!
//! This crate decides, per node, whether a computed result may enter the
//! host executor's result cache, wraps the host caches' write path with that
//! decision, and purges stale entries of non-cacheable nodes before a run.
//! It owns no cache and no scheduler: the host implements the traits in
//! [`domain::cache`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - nodes, prompts, configuration, eligibility rules and cache interfaces
pub mod domain;

/// Application services - interception, purging and run-scoped configuration
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::CoreError;
pub use types::{Device, MemoryFootprint, NodeOutput, OutputValue, Tensor};

pub use domain::cache::{
    AuxiliaryStore, CacheEntrySnapshot, CacheKey, CacheShard, OutputCache, PurgeTarget,
};
pub use domain::classifier::{
    title_requests_no_cache, title_requests_reclaim, Classifier, Exclusion, NO_CACHE_MARKERS,
    RECLAIM_MARKER,
};
pub use domain::config::{ClassifierConfig, ConfigOverride};
pub use domain::node::{NodeDescriptor, NodeId, NodeInput};
pub use domain::prompt::Prompt;
pub use domain::registry::{NodeClassInfo, NodeClassRegistry};

pub use application::config_store::ConfigStore;
pub use application::interceptor::NoCacheInterceptor;
pub use application::purger::{PurgeReport, StalePurger};
pub use application::run_scope::{resolve_run_override, RunId, RunScope, CONFIG_NODE_CLASS};
