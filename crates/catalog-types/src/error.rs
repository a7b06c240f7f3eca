//! Error types for the catalog domain types.

use thiserror::Error;

/// Unified error type for domain type operations.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid argument (unknown index name, bad update type, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
