//! Error types for the index build pipeline.

use std::time::Duration;

use catalog_search::SearchError;
use catalog_storage::StorageError;
use catalog_types::{IndexType, TypesError};
use thiserror::Error;

/// Errors that can occur in the index build pipeline.
///
/// `InvalidArgument` and `IllegalState` are configuration errors and are
/// never retried. `Transient` errors are retried per group; everything
/// else fails the group or the run.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Bad input or configuration (zero group size, unknown index name, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Pipeline wired incorrectly (no downstream stage, ...)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Collaborator failure that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Collaborator failure that aborts the run
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// A group did not finish within the per-group timeout
    #[error("Group {group} timed out after {timeout:?}")]
    GroupTimeout { group: usize, timeout: Duration },

    /// The run was cancelled between groups
    #[error("Build of {index_type} cancelled")]
    Cancelled { index_type: IndexType },

    /// Some groups kept failing after every retry; the rest were committed
    #[error("Build of {index_type}: {failed_groups} group(s) failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        index_type: IndexType,
        failed_groups: usize,
        attempts: u32,
        last_error: String,
    },

    /// The run stopped without completing
    #[error("Build of {index_type} failed: {reason}")]
    BuildFailed { index_type: IndexType, reason: String },
}

impl PipelineError {
    /// True for errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }

    /// True for configuration errors (fail fast).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidArgument(_) | PipelineError::IllegalState(_)
        )
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidNotification(msg) => PipelineError::InvalidArgument(msg),
            e if e.is_retryable() => PipelineError::Transient(e.to_string()),
            e => PipelineError::Fatal(e.to_string()),
        }
    }
}

impl From<SearchError> for PipelineError {
    fn from(err: SearchError) -> Self {
        if err.is_retryable() {
            PipelineError::Transient(err.to_string())
        } else {
            PipelineError::Fatal(err.to_string())
        }
    }
}

impl From<TypesError> for PipelineError {
    fn from(err: TypesError) -> Self {
        match err {
            TypesError::InvalidArgument(msg) | TypesError::Config(msg) => {
                PipelineError::InvalidArgument(msg)
            }
            e => PipelineError::Fatal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::RetriesExhausted {
            index_type: IndexType::Product,
            failed_groups: 1,
            attempts: 3,
            last_error: "loader unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Build of product: 1 group(s) failed after 3 attempt(s): loader unavailable"
        );
    }

    #[test]
    fn test_classification() {
        assert!(PipelineError::Transient("busy".into()).is_transient());
        assert!(!PipelineError::Fatal("corrupt".into()).is_transient());
        assert!(PipelineError::IllegalState("no downstream".into()).is_configuration());
        assert!(!PipelineError::GroupTimeout {
            group: 2,
            timeout: Duration::from_secs(1)
        }
        .is_transient());
    }

    #[test]
    fn test_from_types_error() {
        let err: PipelineError = IndexType::from_name("").unwrap_err().into();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[test]
    fn test_from_search_error() {
        let err: PipelineError = SearchError::IndexLocked("held".into()).into();
        assert!(err.is_transient());
        let err: PipelineError = SearchError::SchemaMismatch("doc_id".into()).into();
        assert!(matches!(err, PipelineError::Fatal(_)));
    }
}
