use thiserror::Error;

/// Errors from validating an externally supplied run ID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunIdError {
    #[error("run ID is required")]
    Empty,

    #[error("run ID '{0}' contains illegal path characters")]
    IllegalPath(String),

    #[error("run ID '{0}' has an invalid format")]
    BadFormat(String),
}

/// Errors from run store operations (used by the `RunStore` port in flowrun-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    InvalidRunId(#[from] RunIdError),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<serde_yaml_ng::Error> for StoreError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
