use thiserror::Error;

/// Core error type for the cache-bypass layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// More than one configuration node was declared in a single run
    #[error("Configuration ambiguity: {count} configuration nodes in one run ({})", .node_ids.join(", "))]
    ConfigurationAmbiguity {
        /// Number of configuration nodes found
        count: usize,
        /// Ids of the offending nodes
        node_ids: Vec<String>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Node metadata could not be resolved
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// Cache-internal error (missing shard, structural mismatch, ...)
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Graph execution error
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether this error must halt the run rather than degrade gracefully
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            CoreError::ConfigurationAmbiguity { .. } | CoreError::ExecutionError(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
