//! Interfaces to the systems the pipeline drives.
//!
//! The pipeline only talks to these traits. RocksDB and Tantivy
//! implementations live in [`crate::adapters`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use catalog_types::{
    EntityRecord, IndexDocument, IndexNotification, IndexType, RelatedEntity, Uid,
};

use crate::error::PipelineError;

pub use catalog_search::SearchIndexLocator;

/// Durable store of pending notifications and of per-index build times.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Append a notification; returns its id.
    async fn put(&self, notification: IndexNotification) -> Result<u64, PipelineError>;

    /// Pending notifications of one index type, in store order.
    async fn find_by_index_type(
        &self,
        index_type: IndexType,
    ) -> Result<Vec<IndexNotification>, PipelineError>;

    /// Every pending notification, in store order.
    async fn find_all(&self) -> Result<Vec<IndexNotification>, PipelineError>;

    /// Remove consumed notifications.
    async fn remove(&self, ids: &[u64]) -> Result<usize, PipelineError>;

    /// Start time of the latest build of `index_type` that finished
    /// without failed groups.
    async fn last_build_time(
        &self,
        index_type: IndexType,
    ) -> Result<Option<DateTime<Utc>>, PipelineError>;

    async fn set_last_build_time(
        &self,
        index_type: IndexType,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError>;
}

/// Loads domain entities for indexing.
#[async_trait]
pub trait EntityLoader: Send + Sync {
    /// Load entities by uid; uids without an entity are left out.
    async fn load_entities(
        &self,
        index_type: IndexType,
        uids: &[Uid],
    ) -> Result<Vec<EntityRecord>, PipelineError>;

    /// Up to `limit` indexable uids greater than `after`, ascending, for
    /// full rebuilds. A page shorter than `limit` is the last one.
    async fn all_uids(
        &self,
        index_type: IndexType,
        after: Option<Uid>,
        limit: usize,
    ) -> Result<Vec<Uid>, PipelineError>;

    /// Uids of entities changed at or after `since`.
    async fn modified_since(
        &self,
        index_type: IndexType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Uid>, PipelineError>;

    /// Uids affected by a change to a related entity.
    async fn related_uids(
        &self,
        index_type: IndexType,
        related: &RelatedEntity,
    ) -> Result<Vec<Uid>, PipelineError>;
}

/// Converts a loaded entity into an index document.
pub trait DocumentTranslator: Send + Sync {
    fn to_document(&self, entity: &EntityRecord) -> Result<IndexDocument, PipelineError>;
}

/// Engine-reported numbers for one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Live committed documents
    pub num_docs: u64,
    /// Deleted documents not yet merged away
    pub deleted_docs: u64,
    /// Operations issued since the last commit
    pub pending_operations: u64,
}

/// Storage, commit and optimize primitives of the search engine.
#[async_trait]
pub trait IndexEngine: Send + Sync {
    /// Upsert documents by uid.
    async fn add_documents(
        &self,
        index_type: IndexType,
        documents: &[IndexDocument],
    ) -> Result<usize, PipelineError>;

    /// Delete documents by uid; unknown uids are no-ops.
    async fn delete(&self, index_type: IndexType, uids: &[Uid]) -> Result<usize, PipelineError>;

    async fn delete_all(&self, index_type: IndexType) -> Result<(), PipelineError>;

    async fn commit(&self, index_type: IndexType) -> Result<(), PipelineError>;

    /// Discard uncommitted operations.
    async fn rollback(&self, index_type: IndexType) -> Result<(), PipelineError>;

    async fn optimize(&self, index_type: IndexType) -> Result<(), PipelineError>;

    async fn index_exists(&self, index_type: IndexType) -> Result<bool, PipelineError>;

    async fn stats(&self, index_type: IndexType) -> Result<EngineStats, PipelineError>;
}

/// The collaborator set a build run works with.
#[derive(Clone)]
pub struct Collaborators {
    pub notification_store: Arc<dyn NotificationStore>,
    pub entity_loader: Arc<dyn EntityLoader>,
    pub translator: Arc<dyn DocumentTranslator>,
    pub engine: Arc<dyn IndexEngine>,
}
