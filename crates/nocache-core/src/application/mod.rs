/// Run-scoped configuration context
pub mod run_scope;

/// Process-wide configuration store
pub mod config_store;

/// Cache-write interceptor
pub mod interceptor;

/// Stale-entry purger
pub mod purger;
