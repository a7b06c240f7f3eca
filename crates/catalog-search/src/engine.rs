//! Write-side engine over one Tantivy index per index type.
//!
//! Each index keeps a single IndexWriter behind a Mutex. Documents are
//! keyed by uid: adding a document deletes the uid term first, so adding
//! the same uid twice leaves one document. Nothing is visible until
//! `commit` is called.
//!
//! An index directory is created on first use; it counts as existing once
//! Tantivy has written its `meta.json`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tantivy::collector::DocSetCollector;
use tantivy::query::AllQuery;
use tantivy::schema::Value;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, warn};

use catalog_types::{IndexDocument, IndexType, Uid};

use crate::error::SearchError;
use crate::locator::SearchIndexLocator;
use crate::schema::{build_catalog_schema, CatalogSchema};

/// Default IndexWriter memory budget per index
pub const DEFAULT_WRITER_MEMORY_MB: usize = 50;

/// Point-in-time numbers for one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Live (committed, not deleted) documents
    pub num_docs: u64,
    /// Deleted documents still occupying segments
    pub deleted_docs: u64,
    /// Searchable segments
    pub segments: usize,
    /// Adds/deletes issued since the last commit
    pub pending_operations: u64,
}

fn index_exists_at(path: &Path) -> bool {
    path.join("meta.json").exists()
}

/// An open index with its only writer and a manually reloaded reader.
struct IndexHandle {
    index: Index,
    schema: CatalogSchema,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    pending_ops: AtomicU64,
}

impl IndexHandle {
    fn open(path: &Path, writer_memory_mb: usize) -> Result<Self, SearchError> {
        let index = if index_exists_at(path) {
            debug!(path = ?path, "Opening existing index");
            Index::open_in_dir(path)?
        } else {
            info!(path = ?path, "Creating new index");
            std::fs::create_dir_all(path)?;
            Index::create_in_dir(path, build_catalog_schema().schema().clone())?
        };
        // Existing indexes must carry every catalog field
        let schema = CatalogSchema::from_schema(index.schema())?;

        let writer = index.writer(writer_memory_mb * 1024 * 1024)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        debug!(path = ?path, memory_mb = writer_memory_mb, "Opened index writer");

        Ok(Self {
            index,
            schema,
            writer: Mutex::new(writer),
            reader,
            pending_ops: AtomicU64::new(0),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, IndexWriter>, SearchError> {
        self.writer
            .lock()
            .map_err(|e| SearchError::IndexLocked(e.to_string()))
    }

    fn uid_term(&self, uid: Uid) -> Term {
        Term::from_field_text(self.schema.doc_id, &uid.to_string())
    }
}

/// Tantivy-backed index engine.
///
/// Clones share the open indexes, so a clone can be moved onto a blocking
/// thread for long commits and merges.
#[derive(Clone)]
pub struct TantivyIndexEngine {
    locator: Arc<dyn SearchIndexLocator>,
    writer_memory_mb: usize,
    handles: Arc<Mutex<HashMap<IndexType, Arc<IndexHandle>>>>,
}

impl TantivyIndexEngine {
    pub fn new(locator: Arc<dyn SearchIndexLocator>) -> Self {
        Self {
            locator,
            writer_memory_mb: DEFAULT_WRITER_MEMORY_MB,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_writer_memory_mb(mut self, mb: usize) -> Self {
        self.writer_memory_mb = mb;
        self
    }

    /// Open (creating if missing) the index of `index_type`.
    fn handle(&self, index_type: IndexType) -> Result<Arc<IndexHandle>, SearchError> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| SearchError::IndexLocked(e.to_string()))?;

        if let Some(handle) = handles.get(&index_type) {
            return Ok(handle.clone());
        }

        let path = self.locator.search_index_location(index_type);
        let handle = Arc::new(IndexHandle::open(&path, self.writer_memory_mb)?);
        info!(index_type = %index_type, path = ?path, "Opened search index");
        handles.insert(index_type, handle.clone());
        Ok(handle)
    }

    /// True if the index of `index_type` has been created on disk.
    pub fn index_exists(&self, index_type: IndexType) -> bool {
        index_exists_at(&self.locator.search_index_location(index_type))
    }

    /// Upsert documents by uid. Returns the number of documents added.
    pub fn add_documents(
        &self,
        index_type: IndexType,
        documents: &[IndexDocument],
    ) -> Result<usize, SearchError> {
        let handle = self.handle(index_type)?;
        let schema = handle.schema.clone();
        let writer = handle.writer()?;

        for document in documents {
            if document.index_type != index_type {
                return Err(SearchError::SchemaMismatch(format!(
                    "document {} belongs to {}, not {}",
                    document.uid, document.index_type, index_type
                )));
            }

            writer.delete_term(handle.uid_term(document.uid));
            writer.add_document(doc!(
                schema.doc_id => document.uid.to_string(),
                schema.index_type => index_type.index_name().to_string(),
                schema.text => document.text(),
            ))?;
        }

        handle
            .pending_ops
            .fetch_add(documents.len() as u64, Ordering::SeqCst);
        debug!(index_type = %index_type, count = documents.len(), "Added documents");
        Ok(documents.len())
    }

    /// Delete documents by uid. Unknown uids are no-ops.
    pub fn delete(&self, index_type: IndexType, uids: &[Uid]) -> Result<usize, SearchError> {
        let handle = self.handle(index_type)?;
        let writer = handle.writer()?;

        for uid in uids {
            writer.delete_term(handle.uid_term(*uid));
        }

        handle
            .pending_ops
            .fetch_add(uids.len() as u64, Ordering::SeqCst);
        debug!(index_type = %index_type, count = uids.len(), "Deleted documents");
        Ok(uids.len())
    }

    /// Remove every document of the index (visible after commit).
    pub fn delete_all(&self, index_type: IndexType) -> Result<(), SearchError> {
        let handle = self.handle(index_type)?;
        let writer = handle.writer()?;
        writer.delete_all_documents()?;
        handle.pending_ops.fetch_add(1, Ordering::SeqCst);
        info!(index_type = %index_type, "Deleted all documents");
        Ok(())
    }

    /// Commit pending changes and refresh the reader.
    pub fn commit(&self, index_type: IndexType) -> Result<u64, SearchError> {
        let handle = self.handle(index_type)?;
        let opstamp = {
            let mut writer = handle.writer()?;
            writer.commit()?
        };
        handle.reader.reload()?;
        let pending = handle.pending_ops.swap(0, Ordering::SeqCst);
        info!(index_type = %index_type, opstamp, operations = pending, "Committed index changes");
        Ok(opstamp)
    }

    /// Discard uncommitted changes.
    pub fn rollback(&self, index_type: IndexType) -> Result<u64, SearchError> {
        let handle = self.handle(index_type)?;
        let opstamp = handle.writer()?.rollback()?;
        handle.pending_ops.store(0, Ordering::SeqCst);
        warn!(index_type = %index_type, opstamp, "Rolled back index changes");
        Ok(opstamp)
    }

    /// Merge all searchable segments into one, purging deleted documents.
    pub fn optimize(&self, index_type: IndexType) -> Result<(), SearchError> {
        let handle = self.handle(index_type)?;
        let before = self.stats(index_type)?;
        let segment_ids = handle.index.searchable_segment_ids()?;

        let mut writer = handle.writer()?;
        if segment_ids.len() > 1 || (segment_ids.len() == 1 && before.deleted_docs > 0) {
            writer.merge(&segment_ids).wait()?;
        }
        writer.garbage_collect_files().wait()?;
        drop(writer);

        handle.reader.reload()?;
        info!(
            index_type = %index_type,
            segments = before.segments,
            deleted_docs = before.deleted_docs,
            "Optimized index"
        );
        Ok(())
    }

    /// Committed document counts and segment layout.
    pub fn stats(&self, index_type: IndexType) -> Result<IndexStats, SearchError> {
        let handle = self.handle(index_type)?;
        handle.reader.reload()?;
        let searcher = handle.reader.searcher();
        let segment_readers = searcher.segment_readers();

        Ok(IndexStats {
            num_docs: searcher.num_docs(),
            deleted_docs: segment_readers
                .iter()
                .map(|r| r.num_deleted_docs() as u64)
                .sum(),
            segments: segment_readers.len(),
            pending_operations: handle.pending_ops.load(Ordering::SeqCst),
        })
    }

    /// Uids of all committed documents, sorted.
    pub fn indexed_uids(&self, index_type: IndexType) -> Result<Vec<Uid>, SearchError> {
        let handle = self.handle(index_type)?;
        handle.reader.reload()?;
        let searcher = handle.reader.searcher();
        let doc_id = handle.schema.doc_id;

        let mut uids = Vec::new();
        for address in searcher.search(&AllQuery, &DocSetCollector)? {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(uid) = doc
                .get_first(doc_id)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uid>().ok())
            {
                uids.push(uid);
            }
        }
        uids.sort_unstable();
        Ok(uids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::DirectorySearchIndexLocator;
    use tempfile::TempDir;

    fn create_engine() -> (TantivyIndexEngine, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let locator = Arc::new(DirectorySearchIndexLocator::new(temp_dir.path()));
        let engine = TantivyIndexEngine::new(locator).with_writer_memory_mb(15);
        (engine, temp_dir)
    }

    fn product(uid: Uid, name: &str) -> IndexDocument {
        IndexDocument::new(IndexType::Product, uid).with_field("name", name)
    }

    #[test]
    fn test_index_exists_only_after_first_write() {
        let (engine, _temp) = create_engine();
        assert!(!engine.index_exists(IndexType::Product));

        engine.add_documents(IndexType::Product, &[product(1, "Shoe")]).unwrap();
        engine.commit(IndexType::Product).unwrap();

        assert!(engine.index_exists(IndexType::Product));
        assert!(!engine.index_exists(IndexType::Sku));
    }

    #[test]
    fn test_reopen_keeps_committed_documents() {
        let temp_dir = TempDir::new().unwrap();
        let locator = Arc::new(DirectorySearchIndexLocator::new(temp_dir.path()));
        {
            let engine = TantivyIndexEngine::new(locator.clone()).with_writer_memory_mb(15);
            engine.add_documents(IndexType::Product, &[product(4, "Lamp")]).unwrap();
            engine.commit(IndexType::Product).unwrap();
        }

        // The first engine released its writer
        let engine = TantivyIndexEngine::new(locator).with_writer_memory_mb(15);
        assert!(engine.index_exists(IndexType::Product));
        assert_eq!(engine.indexed_uids(IndexType::Product).unwrap(), vec![4]);
    }

    #[test]
    fn test_clones_share_open_indexes() {
        let (engine, _temp) = create_engine();
        let clone = engine.clone();
        clone.add_documents(IndexType::Sku, &[IndexDocument::new(IndexType::Sku, 9)]).unwrap();

        assert_eq!(engine.stats(IndexType::Sku).unwrap().pending_operations, 1);
        engine.commit(IndexType::Sku).unwrap();
        assert_eq!(clone.indexed_uids(IndexType::Sku).unwrap(), vec![9]);
    }

    #[test]
    fn test_documents_visible_after_commit() {
        let (engine, _temp) = create_engine();
        engine
            .add_documents(IndexType::Product, &[product(1, "Shoe"), product(2, "Boot")])
            .unwrap();

        let stats = engine.stats(IndexType::Product).unwrap();
        assert_eq!(stats.num_docs, 0);
        assert_eq!(stats.pending_operations, 2);

        engine.commit(IndexType::Product).unwrap();
        let stats = engine.stats(IndexType::Product).unwrap();
        assert_eq!(stats.num_docs, 2);
        assert_eq!(stats.pending_operations, 0);
    }

    #[test]
    fn test_same_uid_twice_is_one_document() {
        let (engine, _temp) = create_engine();
        engine.add_documents(IndexType::Product, &[product(7, "v1")]).unwrap();
        engine.commit(IndexType::Product).unwrap();
        engine.add_documents(IndexType::Product, &[product(7, "v2")]).unwrap();
        engine.commit(IndexType::Product).unwrap();

        assert_eq!(engine.indexed_uids(IndexType::Product).unwrap(), vec![7]);
    }

    #[test]
    fn test_delete_and_delete_all() {
        let (engine, _temp) = create_engine();
        let docs: Vec<IndexDocument> = (1..=4).map(|uid| product(uid, "x")).collect();
        engine.add_documents(IndexType::Product, &docs).unwrap();
        engine.commit(IndexType::Product).unwrap();

        engine.delete(IndexType::Product, &[2, 99]).unwrap();
        engine.commit(IndexType::Product).unwrap();
        assert_eq!(engine.indexed_uids(IndexType::Product).unwrap(), vec![1, 3, 4]);

        engine.delete_all(IndexType::Product).unwrap();
        engine.commit(IndexType::Product).unwrap();
        assert_eq!(engine.stats(IndexType::Product).unwrap().num_docs, 0);
    }

    #[test]
    fn test_rollback_discards_uncommitted() {
        let (engine, _temp) = create_engine();
        engine.add_documents(IndexType::Sku, &[IndexDocument::new(IndexType::Sku, 1)]).unwrap();
        engine.rollback(IndexType::Sku).unwrap();
        engine.commit(IndexType::Sku).unwrap();
        assert_eq!(engine.stats(IndexType::Sku).unwrap().num_docs, 0);
    }

    #[test]
    fn test_rejects_document_of_other_type() {
        let (engine, _temp) = create_engine();
        let result = engine.add_documents(IndexType::Category, &[product(1, "Shoe")]);
        assert!(matches!(result, Err(SearchError::SchemaMismatch(_))));
    }

    #[test]
    fn test_optimize_merges_segments() {
        let (engine, _temp) = create_engine();
        for uid in 1..=3 {
            engine.add_documents(IndexType::Product, &[product(uid, "x")]).unwrap();
            engine.commit(IndexType::Product).unwrap();
        }
        engine.delete(IndexType::Product, &[1]).unwrap();
        engine.commit(IndexType::Product).unwrap();

        engine.optimize(IndexType::Product).unwrap();

        let stats = engine.stats(IndexType::Product).unwrap();
        assert_eq!(stats.num_docs, 2);
        assert_eq!(stats.deleted_docs, 0);
        assert!(stats.segments <= 1);
    }
}
