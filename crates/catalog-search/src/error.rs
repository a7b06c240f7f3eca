//! Search error types.

use thiserror::Error;

/// Errors that can occur in the index engine.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Tantivy index error
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema mismatch
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Index is locked (another writer holds it, or a mutex was poisoned)
    #[error("Index is locked: {0}")]
    IndexLocked(String),
}

impl SearchError {
    /// True when retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::Io(_) | SearchError::IndexLocked(_) => true,
            SearchError::Tantivy(e) => matches!(
                e,
                tantivy::TantivyError::LockFailure(..) | tantivy::TantivyError::IoError(_)
            ),
            SearchError::SchemaMismatch(_) => false,
        }
    }
}
