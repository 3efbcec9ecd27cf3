//! NoCache runtime integration
//!
//! Wires the cache-bypass layer into a host's run lifecycle: install the write
//! interceptor on the host caches with [`NoCacheRuntime::install_cache`], then
//! run prompts through the executor returned by
//! [`NoCacheRuntime::wrap_executor`].

pub mod executor;
pub mod runtime;
pub mod session;

pub use executor::{
    topological_order, CachedGraphExecutor, ExecutionSummary, NodeObserver, NodeRunner,
    NoopObserver, PromptExecutor, ResolvedInputs,
};
pub use runtime::NoCacheRuntime;
pub use session::NoCacheExecutor;
