//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Notification rejected before it was stored
    #[error("Invalid notification: {0}")]
    InvalidNotification(String),
}

impl StorageError {
    /// True when retrying the same operation may succeed (busy/locked/IO).
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::RocksDb(e) => matches!(
                e.kind(),
                rocksdb::ErrorKind::Busy
                    | rocksdb::ErrorKind::TimedOut
                    | rocksdb::ErrorKind::TryAgain
                    | rocksdb::ErrorKind::IOError
                    | rocksdb::ErrorKind::Incomplete
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<catalog_types::TypesError> for StorageError {
    fn from(err: catalog_types::TypesError) -> Self {
        match err {
            catalog_types::TypesError::InvalidArgument(msg) => {
                StorageError::InvalidNotification(msg)
            }
            other => StorageError::Serialization(other.to_string()),
        }
    }
}
