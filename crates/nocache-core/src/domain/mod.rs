/// Node identity and descriptors
pub mod node;

/// Node set of a run
pub mod prompt;

/// Classifier configuration
pub mod config;

/// Node class registry
pub mod registry;

/// Cache eligibility rules
pub mod classifier;

/// Cache interfaces
pub mod cache;
