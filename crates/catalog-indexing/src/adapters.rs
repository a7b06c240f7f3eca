//! Collaborator implementations over RocksDB storage and Tantivy.
//!
//! Both backends are synchronous. Storage calls and document writes run on
//! the calling task; Tantivy commits and segment merges can take seconds
//! and run on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use catalog_search::{SearchError, TantivyIndexEngine};
use catalog_storage::Storage;
use catalog_types::{EntityRecord, IndexDocument, IndexNotification, IndexType, RelatedEntity, Uid};

use crate::collaborators::{EngineStats, EntityLoader, IndexEngine, NotificationStore};
use crate::error::PipelineError;

#[async_trait]
impl NotificationStore for Storage {
    async fn put(&self, notification: IndexNotification) -> Result<u64, PipelineError> {
        Ok(self.put_notification(notification)?)
    }

    async fn find_by_index_type(
        &self,
        index_type: IndexType,
    ) -> Result<Vec<IndexNotification>, PipelineError> {
        Ok(self.find_notifications_by_index_type(index_type)?)
    }

    async fn find_all(&self) -> Result<Vec<IndexNotification>, PipelineError> {
        Ok(self.find_all_notifications()?)
    }

    async fn remove(&self, ids: &[u64]) -> Result<usize, PipelineError> {
        Ok(self.remove_notifications(ids)?)
    }

    async fn last_build_time(
        &self,
        index_type: IndexType,
    ) -> Result<Option<DateTime<Utc>>, PipelineError> {
        Ok(Storage::last_build_time(self, index_type)?)
    }

    async fn set_last_build_time(
        &self,
        index_type: IndexType,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        Ok(Storage::set_last_build_time(self, index_type, at)?)
    }
}

#[async_trait]
impl EntityLoader for Storage {
    async fn load_entities(
        &self,
        index_type: IndexType,
        uids: &[Uid],
    ) -> Result<Vec<EntityRecord>, PipelineError> {
        Ok(Storage::load_entities(self, index_type, uids)?)
    }

    async fn all_uids(
        &self,
        index_type: IndexType,
        after: Option<Uid>,
        limit: usize,
    ) -> Result<Vec<Uid>, PipelineError> {
        Ok(self.entity_uids_page(index_type, after, limit)?)
    }

    async fn modified_since(
        &self,
        index_type: IndexType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Uid>, PipelineError> {
        Ok(self.entity_uids_modified_since(index_type, since)?)
    }

    async fn related_uids(
        &self,
        index_type: IndexType,
        related: &RelatedEntity,
    ) -> Result<Vec<Uid>, PipelineError> {
        Ok(self.related_entity_uids(index_type, related)?)
    }
}

/// Run a blocking engine call on the blocking pool. The engine clone
/// shares its index handles with `engine`.
async fn run_blocking<T, F>(engine: &TantivyIndexEngine, call: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(TantivyIndexEngine) -> Result<T, SearchError> + Send + 'static,
{
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || call(engine))
        .await
        .map_err(|e| PipelineError::Fatal(format!("engine task failed: {}", e)))?
        .map_err(PipelineError::from)
}

#[async_trait]
impl IndexEngine for TantivyIndexEngine {
    async fn add_documents(
        &self,
        index_type: IndexType,
        documents: &[IndexDocument],
    ) -> Result<usize, PipelineError> {
        Ok(TantivyIndexEngine::add_documents(self, index_type, documents)?)
    }

    async fn delete(&self, index_type: IndexType, uids: &[Uid]) -> Result<usize, PipelineError> {
        Ok(TantivyIndexEngine::delete(self, index_type, uids)?)
    }

    async fn delete_all(&self, index_type: IndexType) -> Result<(), PipelineError> {
        Ok(TantivyIndexEngine::delete_all(self, index_type)?)
    }

    async fn commit(&self, index_type: IndexType) -> Result<(), PipelineError> {
        run_blocking(self, move |engine| engine.commit(index_type)).await?;
        Ok(())
    }

    async fn rollback(&self, index_type: IndexType) -> Result<(), PipelineError> {
        TantivyIndexEngine::rollback(self, index_type)?;
        Ok(())
    }

    async fn optimize(&self, index_type: IndexType) -> Result<(), PipelineError> {
        run_blocking(self, move |engine| engine.optimize(index_type)).await
    }

    async fn index_exists(&self, index_type: IndexType) -> Result<bool, PipelineError> {
        Ok(TantivyIndexEngine::index_exists(self, index_type))
    }

    async fn stats(&self, index_type: IndexType) -> Result<EngineStats, PipelineError> {
        let stats = TantivyIndexEngine::stats(self, index_type)?;
        Ok(EngineStats {
            num_docs: stats.num_docs,
            deleted_docs: stats.deleted_docs,
            pending_operations: stats.pending_operations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use catalog_search::DirectorySearchIndexLocator;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_storage_as_collaborators() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .put_entity(&EntityRecord::new(IndexType::Product, 7).with_relation("category", 3))
            .unwrap();
        let id = storage
            .put_notification(IndexNotification::update(IndexType::Product, 7))
            .unwrap();

        let store: &dyn NotificationStore = &storage;
        let loader: &dyn EntityLoader = &storage;

        assert_eq!(store.find_by_index_type(IndexType::Product).await.unwrap().len(), 1);
        assert_eq!(loader.load_entities(IndexType::Product, &[7, 8]).await.unwrap().len(), 1);
        assert_eq!(loader.all_uids(IndexType::Product, None, 10).await.unwrap(), vec![7]);
        assert!(loader.all_uids(IndexType::Product, Some(7), 10).await.unwrap().is_empty());
        assert_eq!(
            loader
                .modified_since(IndexType::Product, Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap(),
            vec![7]
        );
        assert_eq!(
            loader
                .related_uids(IndexType::Product, &RelatedEntity::new("category", 3))
                .await
                .unwrap(),
            vec![7]
        );

        store.remove(&[id]).await.unwrap();
        assert!(store.find_all().await.unwrap().is_empty());

        let requeued = store.put(IndexNotification::rebuild(IndexType::Product)).await.unwrap();
        assert!(requeued > id);

        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        assert!(store.last_build_time(IndexType::Product).await.unwrap().is_none());
        store.set_last_build_time(IndexType::Product, at).await.unwrap();
        assert_eq!(store.last_build_time(IndexType::Product).await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn test_tantivy_as_engine() {
        let dir = TempDir::new().unwrap();
        let engine = TantivyIndexEngine::new(Arc::new(DirectorySearchIndexLocator::new(dir.path())));
        let engine: &dyn IndexEngine = &engine;

        assert!(!engine.index_exists(IndexType::Sku).await.unwrap());
        engine
            .add_documents(IndexType::Sku, &[IndexDocument::new(IndexType::Sku, 1).with_field("code", "A-1")])
            .await
            .unwrap();
        engine.commit(IndexType::Sku).await.unwrap();

        assert!(engine.index_exists(IndexType::Sku).await.unwrap());
        assert_eq!(engine.stats(IndexType::Sku).await.unwrap().num_docs, 1);

        // Merge on the blocking pool; the engine's own handles see the result
        for uid in 2..=3 {
            engine
                .add_documents(IndexType::Sku, &[IndexDocument::new(IndexType::Sku, uid)])
                .await
                .unwrap();
            engine.commit(IndexType::Sku).await.unwrap();
        }
        engine.delete(IndexType::Sku, &[2]).await.unwrap();
        engine.commit(IndexType::Sku).await.unwrap();
        engine.optimize(IndexType::Sku).await.unwrap();
        let stats = engine.stats(IndexType::Sku).await.unwrap();
        assert_eq!(stats.num_docs, 2);
        assert_eq!(stats.deleted_docs, 0);

        // Schema errors are not retried
        let wrong = engine
            .add_documents(IndexType::Sku, &[IndexDocument::new(IndexType::Product, 2)])
            .await;
        assert!(matches!(wrong, Err(PipelineError::Fatal(_))));
    }
}
