//! End-to-end test infrastructure for catalog search indexing.
//!
//! Provides a shared TestHarness backed by real RocksDB storage and
//! Tantivy indexes in a temp directory, plus helpers for seeding entities
//! and notifications.

use std::path::PathBuf;
use std::sync::Arc;

use catalog_indexing::{
    Collaborators, FieldCopyTranslator, IndexBuildService, ThresholdIndexBuildPolicy,
};
use catalog_search::{DirectorySearchIndexLocator, TantivyIndexEngine};
use catalog_storage::Storage;
use catalog_types::{EntityRecord, IndexNotification, IndexType, PipelineSettings, Uid};

/// Writer budget for test indexes (Tantivy's minimum).
pub const TEST_WRITER_MEMORY_MB: usize = 15;

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    /// Notification and entity storage
    pub storage: Arc<Storage>,
    /// One Tantivy index per index type under `search_index_path`
    pub engine: Arc<TantivyIndexEngine>,
    pub search_index_path: PathBuf,
}

impl TestHarness {
    /// Create a new test harness with temp directory, storage and engine.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage = Arc::new(
            Storage::open(&temp_dir.path().join("db")).expect("Failed to open test storage"),
        );

        let search_index_path = temp_dir.path().join("search");
        std::fs::create_dir_all(&search_index_path).expect("Failed to create search index dir");
        let locator = Arc::new(DirectorySearchIndexLocator::new(search_index_path.clone()));
        let engine =
            Arc::new(TantivyIndexEngine::new(locator).with_writer_memory_mb(TEST_WRITER_MEMORY_MB));

        Self {
            _temp_dir: temp_dir,
            storage,
            engine,
            search_index_path,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            notification_store: self.storage.clone(),
            entity_loader: self.storage.clone(),
            translator: Arc::new(FieldCopyTranslator::new()),
            engine: self.engine.clone(),
        }
    }

    /// Service over the harness with the default policy.
    pub fn service(&self, settings: PipelineSettings) -> IndexBuildService {
        IndexBuildService::new(
            self.collaborators(),
            Arc::new(ThresholdIndexBuildPolicy::default()),
            settings,
        )
    }

    /// Uids committed to the index of `index_type`.
    pub fn indexed_uids(&self, index_type: IndexType) -> Vec<Uid> {
        self.engine
            .indexed_uids(index_type)
            .expect("Failed to read indexed uids")
    }

    /// Store one entity per uid with a `name` field.
    pub fn seed_entities(&self, index_type: IndexType, uids: impl IntoIterator<Item = Uid>) {
        for uid in uids {
            let entity = EntityRecord::new(index_type, uid)
                .with_field("name", format!("{} {}", index_type, uid));
            self.storage.put_entity(&entity).expect("Failed to put entity");
        }
    }

    /// Store a notification and return its id.
    pub fn notify(&self, notification: IndexNotification) -> u64 {
        self.storage
            .put_notification(notification)
            .expect("Failed to put notification")
    }

    pub fn pending_notifications(&self, index_type: IndexType) -> usize {
        self.storage
            .find_notifications_by_index_type(index_type)
            .expect("Failed to read notifications")
            .len()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline settings with short retry intervals.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        retry_initial_interval_ms: 1,
        ..Default::default()
    }
}
