//! Per-index write exclusion.
//!
//! Commit, optimize and delete-all on one index type never overlap, even
//! across concurrent build and optimize runs. Different index types do not
//! block each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use catalog_types::IndexType;

/// One async mutex per index type, shared by every run of a service.
#[derive(Clone)]
pub struct IndexWriteLocks {
    locks: Arc<HashMap<IndexType, Arc<Mutex<()>>>>,
}

impl IndexWriteLocks {
    pub fn new() -> Self {
        let locks = IndexType::ALL
            .iter()
            .map(|index_type| (*index_type, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            locks: Arc::new(locks),
        }
    }

    /// Wait for exclusive write access to `index_type`.
    pub async fn lock(&self, index_type: IndexType) -> OwnedMutexGuard<()> {
        match self.locks.get(&index_type) {
            Some(lock) => lock.clone().lock_owned().await,
            // Every index type is registered in `new`
            None => Arc::new(Mutex::new(())).lock_owned().await,
        }
    }

    /// True if someone currently holds the lock for `index_type`.
    pub fn is_locked(&self, index_type: IndexType) -> bool {
        self.locks
            .get(&index_type)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

impl Default for IndexWriteLocks {
    fn default() -> Self {
        Self::new()
    }
}
