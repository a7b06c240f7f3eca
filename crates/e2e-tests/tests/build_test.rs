//! End-to-end build tests over RocksDB storage and Tantivy indexes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;

use catalog_indexing::{
    metrics, Collaborators, EntityLoader, FieldCopyTranslator, IndexBuildService, PipelineError,
    ThresholdIndexBuildPolicy,
};
use catalog_storage::Storage;
use catalog_types::{
    EntityRecord, IndexNotification, IndexType, RelatedEntity, Settings, Uid, UpdateType,
};
use e2e_tests::{test_settings, TestHarness};

#[tokio::test]
async fn test_incremental_build_is_idempotent() {
    let harness = TestHarness::new();
    harness.seed_entities(IndexType::Product, 1..=25);
    harness.notify(IndexNotification::update_many(IndexType::Product, (1..=25).collect()));
    let service = harness.service(test_settings());

    // The first run creates the index from a full scan
    let first = service.build_index(IndexType::Product).await.unwrap();
    assert_eq!(first.documents_added, 25);
    assert_eq!(harness.pending_notifications(IndexType::Product), 0);

    let second = service.build_index(IndexType::Product).await.unwrap();
    assert_eq!(second.documents_added, 0);
    assert_eq!(harness.indexed_uids(IndexType::Product), (1..=25).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_update_twice_indexes_one_document() {
    let harness = TestHarness::new();
    let service = harness.service(test_settings());
    service.build_index(IndexType::Product).await.unwrap();

    harness.seed_entities(IndexType::Product, [7]);
    harness.notify(IndexNotification::update(IndexType::Product, 7));
    harness.notify(IndexNotification::update(IndexType::Product, 7));

    let report = service.build_index(IndexType::Product).await.unwrap();

    assert!(!report.rebuilt);
    assert_eq!(report.notifications_consumed, 2);
    assert_eq!(harness.indexed_uids(IndexType::Product), vec![7]);
}

#[tokio::test]
async fn test_delete_all_category_empties_index() {
    let harness = TestHarness::new();
    harness.seed_entities(IndexType::Category, 1..=6);
    let service = harness.service(test_settings());
    service.build_index(IndexType::Category).await.unwrap();
    assert_eq!(harness.indexed_uids(IndexType::Category).len(), 6);

    harness.notify(IndexNotification::delete_all(IndexType::Category));
    service.build_index(IndexType::Category).await.unwrap();

    assert!(harness.indexed_uids(IndexType::Category).is_empty());
    assert_eq!(harness.pending_notifications(IndexType::Category), 0);
}

#[tokio::test]
async fn test_delete_notifications_remove_documents() {
    let harness = TestHarness::new();
    harness.seed_entities(IndexType::Sku, 1..=4);
    let service = harness.service(test_settings());
    service.build_index(IndexType::Sku).await.unwrap();

    harness.storage.delete_entity(IndexType::Sku, 2).unwrap();
    harness.notify(IndexNotification::delete(IndexType::Sku, 2));
    harness.notify(IndexNotification::delete(IndexType::Sku, 99));
    let report = service.build_index(IndexType::Sku).await.unwrap();

    assert_eq!(report.documents_deleted, 2);
    assert_eq!(harness.indexed_uids(IndexType::Sku), vec![1, 3, 4]);
}

#[tokio::test]
async fn test_related_change_reindexes_products() {
    let harness = TestHarness::new();
    let service = harness.service(test_settings());
    service.build_index(IndexType::Product).await.unwrap();

    for uid in [10, 11] {
        harness
            .storage
            .put_entity(&EntityRecord::new(IndexType::Product, uid).with_relation("brand", 5))
            .unwrap();
    }
    harness.notify(IndexNotification::related(
        IndexType::Product,
        UpdateType::Update,
        RelatedEntity::new("brand", 5),
    ));

    let report = service.build_index(IndexType::Product).await.unwrap();

    assert_eq!(report.documents_added, 2);
    assert_eq!(harness.indexed_uids(IndexType::Product), vec![10, 11]);
}

#[tokio::test]
async fn test_transient_load_failure_on_group_two_of_five() {
    let harness = TestHarness::new();
    let service = harness.service(test_settings());
    service.build_index(IndexType::Product).await.unwrap();

    harness.seed_entities(IndexType::Product, 1..=5);
    for uid in 1..=5 {
        harness.notify(IndexNotification::update(IndexType::Product, uid));
    }

    let loader = Arc::new(FlakyLoader::new(harness.storage.clone(), 2, 1));
    let collaborators = Collaborators {
        entity_loader: loader.clone(),
        ..harness.collaborators()
    };
    let mut settings = test_settings();
    settings.group_size = 1;
    let flaky_service = IndexBuildService::new(
        collaborators,
        Arc::new(ThresholdIndexBuildPolicy::default()),
        settings,
    );

    let report = flaky_service.build_index(IndexType::Product).await.unwrap();

    assert_eq!(loader.failures(), 1);
    assert_eq!(report.groups, 5);
    assert_eq!(report.performance.counter(metrics::GROUPS_RETRIED), 1);
    assert_eq!(harness.indexed_uids(IndexType::Product), vec![1, 2, 3, 4, 5]);
    assert_eq!(harness.pending_notifications(IndexType::Product), 0);
}

#[tokio::test]
async fn test_rebuild_by_name_drops_stale_documents() {
    let harness = TestHarness::new();
    harness.seed_entities(IndexType::Promotion, 1..=3);
    let service = harness.service(test_settings());
    service.build_index(IndexType::Promotion).await.unwrap();

    // Removed without a notification; only a rebuild notices
    harness.storage.delete_entity(IndexType::Promotion, 3).unwrap();
    let report = service.rebuild_index("promotion").await.unwrap();

    assert!(report.rebuilt);
    assert_eq!(harness.indexed_uids(IndexType::Promotion), vec![1, 2]);
}

#[tokio::test]
async fn test_optimize_after_deletes() {
    let harness = TestHarness::new();
    harness.seed_entities(IndexType::Customer, 1..=10);
    let mut settings = Settings::default();
    settings.pipeline = test_settings();
    settings.policy.optimize_threshold = 1;
    settings.optimize_exclusions = vec!["sku".to_string()];
    let collaborators = Collaborators {
        translator: Arc::new(FieldCopyTranslator::new().without_relations()),
        ..harness.collaborators()
    };
    let service = IndexBuildService::from_settings(collaborators, &settings).unwrap();
    service.build_index(IndexType::Customer).await.unwrap();

    for uid in 1..=4 {
        harness.notify(IndexNotification::delete(IndexType::Customer, uid));
    }
    service.build_index(IndexType::Customer).await.unwrap();

    let report = service.optimize_indices().await.unwrap();
    assert!(report.skipped.contains(&IndexType::Sku));
    assert!(report.optimized.contains(&IndexType::Customer));
    assert_eq!(harness.engine.stats(IndexType::Customer).unwrap().deleted_docs, 0);
    assert_eq!(harness.indexed_uids(IndexType::Customer), (5..=10).collect::<Vec<_>>());
}

/// Loader that fails the first loads containing one uid.
struct FlakyLoader {
    storage: Arc<Storage>,
    uid: Uid,
    remaining: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyLoader {
    fn new(storage: Arc<Storage>, uid: Uid, times: usize) -> Self {
        Self {
            storage,
            uid,
            remaining: AtomicUsize::new(times),
            failures: AtomicUsize::new(0),
        }
    }

    fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityLoader for FlakyLoader {
    async fn load_entities(
        &self,
        index_type: IndexType,
        uids: &[Uid],
    ) -> Result<Vec<EntityRecord>, PipelineError> {
        let fail = uids.contains(&self.uid)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(PipelineError::Transient("entity store busy".into()));
        }
        EntityLoader::load_entities(&*self.storage, index_type, uids).await
    }

    async fn all_uids(
        &self,
        index_type: IndexType,
        after: Option<Uid>,
        limit: usize,
    ) -> Result<Vec<Uid>, PipelineError> {
        EntityLoader::all_uids(&*self.storage, index_type, after, limit).await
    }

    async fn modified_since(
        &self,
        index_type: IndexType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Uid>, PipelineError> {
        EntityLoader::modified_since(&*self.storage, index_type, since).await
    }

    async fn related_uids(
        &self,
        index_type: IndexType,
        related: &RelatedEntity,
    ) -> Result<Vec<Uid>, PipelineError> {
        EntityLoader::related_uids(&*self.storage, index_type, related).await
    }
}
