//! RocksDB wrapper for catalog-search storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Notification append (sequence-assigned), scan and batch removal
//! - Entity put/get, batch load, cursor-paged uid scans and relation lookups
//! - Last build time per index type

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info};

use catalog_types::{EntityRecord, IndexNotification, IndexType, RelatedEntity, Uid};

use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_BUILD_STATUS, CF_ENTITIES, CF_NOTIFICATIONS,
};
use crate::error::StorageError;
use crate::keys::{BuildStatusKey, EntityKey, NotificationKey};

/// Main storage interface for catalog-search
pub struct Storage {
    db: DB,
    /// Notification sequence counter; ids start at 1
    notification_sequence: AtomicU64,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let notification_sequence = Self::load_notification_sequence(&db)?;

        Ok(Self {
            db,
            notification_sequence: AtomicU64::new(notification_sequence),
        })
    }

    /// Next free sequence: one past the highest stored key
    fn load_notification_sequence(db: &DB) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_NOTIFICATIONS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_NOTIFICATIONS.to_string()))?;

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        if let Some(result) = iter.next() {
            let (key, _) = result?;
            let key = NotificationKey::from_bytes(&key)?;
            return Ok(key.sequence + 1);
        }
        Ok(1)
    }

    fn next_notification_sequence(&self) -> u64 {
        self.notification_sequence.fetch_add(1, Ordering::SeqCst)
    }

    // ==================== Notification Methods ====================

    /// Append a notification, assigning its id.
    ///
    /// Rejects notifications whose update type and affected entities disagree.
    pub fn put_notification(&self, notification: IndexNotification) -> Result<u64, StorageError> {
        notification.validate()?;

        let cf = self
            .db
            .cf_handle(CF_NOTIFICATIONS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_NOTIFICATIONS.to_string()))?;

        let id = self.next_notification_sequence();
        let notification = notification.with_id(id);
        self.db.put_cf(
            &cf,
            NotificationKey::new(id).to_bytes(),
            notification.to_bytes()?,
        )?;

        debug!(
            id,
            index_type = %notification.index_type,
            update_type = %notification.update_type,
            "Stored notification"
        );
        Ok(id)
    }

    /// All pending notifications, in store order.
    pub fn find_all_notifications(&self) -> Result<Vec<IndexNotification>, StorageError> {
        self.scan_notifications(|_| true)
    }

    /// Pending notifications of one index type, in store order.
    pub fn find_notifications_by_index_type(
        &self,
        index_type: IndexType,
    ) -> Result<Vec<IndexNotification>, StorageError> {
        self.scan_notifications(|n| n.index_type == index_type)
    }

    fn scan_notifications(
        &self,
        keep: impl Fn(&IndexNotification) -> bool,
    ) -> Result<Vec<IndexNotification>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_NOTIFICATIONS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_NOTIFICATIONS.to_string()))?;

        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let notification = IndexNotification::from_bytes(&value)?;
            if keep(&notification) {
                results.push(notification);
            }
        }
        Ok(results)
    }

    /// Remove notifications by id in one atomic batch.
    ///
    /// Unknown ids are ignored. Returns the number of ids submitted.
    pub fn remove_notifications(&self, ids: &[u64]) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let cf = self
            .db
            .cf_handle(CF_NOTIFICATIONS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_NOTIFICATIONS.to_string()))?;

        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(&cf, NotificationKey::new(*id).to_bytes());
        }
        self.db.write(batch)?;

        debug!(count = ids.len(), "Removed notifications");
        Ok(ids.len())
    }

    /// Pending notification count per index type.
    pub fn pending_notification_counts(&self) -> Result<BTreeMap<IndexType, usize>, StorageError> {
        let mut counts = BTreeMap::new();
        for notification in self.find_all_notifications()? {
            *counts.entry(notification.index_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    // ==================== Entity Methods ====================

    /// Store (or replace) an entity.
    pub fn put_entity(&self, entity: &EntityRecord) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        let key = EntityKey::new(entity.index_type, entity.uid);
        self.db.put_cf(&cf, key.to_bytes(), entity.to_bytes()?)?;
        debug!(index_type = %entity.index_type, uid = entity.uid, "Stored entity");
        Ok(())
    }

    pub fn get_entity(
        &self,
        index_type: IndexType,
        uid: Uid,
    ) -> Result<Option<EntityRecord>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        match self.db.get_cf(&cf, EntityKey::new(index_type, uid).to_bytes())? {
            Some(bytes) => Ok(Some(EntityRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_entity(&self, index_type: IndexType, uid: Uid) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        self.db
            .delete_cf(&cf, EntityKey::new(index_type, uid).to_bytes())?;
        Ok(())
    }

    /// Load entities by uid. Missing uids are skipped; order follows `uids`.
    pub fn load_entities(
        &self,
        index_type: IndexType,
        uids: &[Uid],
    ) -> Result<Vec<EntityRecord>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        let keys: Vec<Vec<u8>> = uids
            .iter()
            .map(|uid| EntityKey::new(index_type, *uid).to_bytes())
            .collect();

        let mut entities = Vec::with_capacity(uids.len());
        for value in self.db.multi_get_cf(keys.iter().map(|k| (cf, k))) {
            if let Some(bytes) = value? {
                entities.push(EntityRecord::from_bytes(&bytes)?);
            }
        }
        Ok(entities)
    }

    /// Up to `limit` uids of an index type greater than `after`, in uid
    /// order. Seeks straight to the cursor, so a full scan stays linear.
    pub fn entity_uids_page(
        &self,
        index_type: IndexType,
        after: Option<Uid>,
        limit: usize,
    ) -> Result<Vec<Uid>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        let prefix = EntityKey::prefix(index_type);
        let start = match after {
            Some(uid) => EntityKey::new(index_type, uid).to_bytes(),
            None => prefix.clone(),
        };
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut uids = Vec::with_capacity(limit);
        for item in iter {
            if uids.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let uid = EntityKey::from_bytes(&key)?.uid;
            // The cursor itself
            if after == Some(uid) {
                continue;
            }
            uids.push(uid);
        }
        Ok(uids)
    }

    /// Uids of entities of `index_type` updated at or after `since`.
    pub fn entity_uids_modified_since(
        &self,
        index_type: IndexType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Uid>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        let prefix = EntityKey::prefix(index_type);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut uids = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let entity = EntityRecord::from_bytes(&value)?;
            if entity.updated_at >= since {
                uids.push(entity.uid);
            }
        }
        Ok(uids)
    }

    /// Uids of entities of `index_type` that reference `related`.
    pub fn related_entity_uids(
        &self,
        index_type: IndexType,
        related: &RelatedEntity,
    ) -> Result<Vec<Uid>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_ENTITIES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_ENTITIES.to_string()))?;

        let prefix = EntityKey::prefix(index_type);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut uids = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let entity = EntityRecord::from_bytes(&value)?;
            if entity.is_related_to(&related.entity_type, related.uid) {
                uids.push(entity.uid);
            }
        }
        Ok(uids)
    }

    // ==================== Build Status Methods ====================

    /// Record when the latest clean build of `index_type` started.
    pub fn set_last_build_time(
        &self,
        index_type: IndexType,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(CF_BUILD_STATUS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_BUILD_STATUS.to_string()))?;

        self.db.put_cf(
            &cf,
            BuildStatusKey::new(index_type).to_bytes(),
            at.timestamp_millis().to_be_bytes(),
        )?;
        debug!(index_type = %index_type, at = %at, "Stored last build time");
        Ok(())
    }

    pub fn last_build_time(
        &self,
        index_type: IndexType,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_BUILD_STATUS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_BUILD_STATUS.to_string()))?;

        let Some(bytes) = self.db.get_cf(&cf, BuildStatusKey::new(index_type).to_bytes())? else {
            return Ok(None);
        };
        let millis: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            StorageError::Serialization(format!("build time of {} is {} bytes", index_type, bytes.len()))
        })?;
        let at = DateTime::from_timestamp_millis(i64::from_be_bytes(millis)).ok_or_else(|| {
            StorageError::Serialization(format!("build time of {} is out of range", index_type))
        })?;
        Ok(Some(at))
    }

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }

    // ===== Admin Operations =====

    /// Get database statistics.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        if let Some(cf) = self.db.cf_handle(CF_NOTIFICATIONS) {
            stats.notification_count = self.count_cf_entries(cf)?;
        }

        if let Some(cf) = self.db.cf_handle(CF_ENTITIES) {
            stats.entity_count = self.count_cf_entries(cf)?;
        }

        stats.disk_usage_bytes = self.get_disk_usage();

        Ok(stats)
    }

    fn count_cf_entries(&self, cf: &rocksdb::ColumnFamily) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn get_disk_usage(&self) -> u64 {
        std::fs::read_dir(self.db.path())
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|entry| entry.metadata().ok())
                    .map(|metadata| metadata.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Number of pending notifications
    pub notification_count: u64,
    /// Number of stored entities
    pub entity_count: u64,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_types::{AffectedEntities, UpdateType};
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in ALL_CF_NAMES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[test]
    fn test_notification_ids_are_sequential() {
        let (storage, _temp) = create_test_storage();

        let first = storage
            .put_notification(IndexNotification::update(IndexType::Product, 7))
            .unwrap();
        let second = storage
            .put_notification(IndexNotification::delete(IndexType::Product, 8))
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let all = storage.find_all_notifications().unwrap();
        assert_eq!(all.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            storage
                .put_notification(IndexNotification::update(IndexType::Sku, 1))
                .unwrap();
            storage
                .put_notification(IndexNotification::update(IndexType::Sku, 2))
                .unwrap();
        }

        let storage = Storage::open(temp_dir.path()).unwrap();
        let id = storage
            .put_notification(IndexNotification::update(IndexType::Sku, 3))
            .unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn test_put_notification_rejects_invalid() {
        let (storage, _temp) = create_test_storage();
        let bad = IndexNotification::new(
            IndexType::Product,
            UpdateType::Rebuild,
            AffectedEntities::Single(1),
        );
        assert!(matches!(
            storage.put_notification(bad),
            Err(StorageError::InvalidNotification(_))
        ));
        assert!(storage.find_all_notifications().unwrap().is_empty());
    }

    #[test]
    fn test_find_by_index_type_and_remove() {
        let (storage, _temp) = create_test_storage();
        storage
            .put_notification(IndexNotification::update(IndexType::Product, 1))
            .unwrap();
        storage
            .put_notification(IndexNotification::delete_all(IndexType::Category))
            .unwrap();
        storage
            .put_notification(IndexNotification::update(IndexType::Product, 2))
            .unwrap();

        let products = storage
            .find_notifications_by_index_type(IndexType::Product)
            .unwrap();
        assert_eq!(products.len(), 2);

        let counts = storage.pending_notification_counts().unwrap();
        assert_eq!(counts.get(&IndexType::Product), Some(&2));
        assert_eq!(counts.get(&IndexType::Category), Some(&1));

        let ids: Vec<u64> = products.iter().map(|n| n.id).collect();
        storage.remove_notifications(&ids).unwrap();

        let remaining = storage.find_all_notifications().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].index_type, IndexType::Category);
    }

    #[test]
    fn test_entity_roundtrip() {
        let (storage, _temp) = create_test_storage();
        let entity = EntityRecord::new(IndexType::Product, 7).with_field("name", "Trail Shoe");
        storage.put_entity(&entity).unwrap();

        let loaded = storage.get_entity(IndexType::Product, 7).unwrap().unwrap();
        assert_eq!(loaded.fields.get("name").map(String::as_str), Some("Trail Shoe"));
        assert!(storage.get_entity(IndexType::Sku, 7).unwrap().is_none());

        storage.delete_entity(IndexType::Product, 7).unwrap();
        assert!(storage.get_entity(IndexType::Product, 7).unwrap().is_none());
    }

    #[test]
    fn test_load_entities_skips_missing() {
        let (storage, _temp) = create_test_storage();
        for uid in [1, 3] {
            storage
                .put_entity(&EntityRecord::new(IndexType::Product, uid))
                .unwrap();
        }

        let loaded = storage
            .load_entities(IndexType::Product, &[3, 2, 1])
            .unwrap();
        assert_eq!(loaded.iter().map(|e| e.uid).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn test_entity_uids_page() {
        let (storage, _temp) = create_test_storage();
        for uid in 1..=5 {
            storage
                .put_entity(&EntityRecord::new(IndexType::Category, uid))
                .unwrap();
        }
        storage
            .put_entity(&EntityRecord::new(IndexType::Customer, 99))
            .unwrap();

        let first = storage.entity_uids_page(IndexType::Category, None, 2).unwrap();
        assert_eq!(first, vec![1, 2]);
        let second = storage
            .entity_uids_page(IndexType::Category, first.last().copied(), 2)
            .unwrap();
        assert_eq!(second, vec![3, 4]);
        let last = storage
            .entity_uids_page(IndexType::Category, Some(4), 2)
            .unwrap();
        assert_eq!(last, vec![5]);
        assert!(storage
            .entity_uids_page(IndexType::Category, Some(5), 2)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_entity_uids_page_resumes_after_removed_cursor() {
        let (storage, _temp) = create_test_storage();
        for uid in [10, 20, 30] {
            storage
                .put_entity(&EntityRecord::new(IndexType::Sku, uid))
                .unwrap();
        }
        // The cursor entity went away between two pages
        storage.delete_entity(IndexType::Sku, 20).unwrap();

        assert_eq!(
            storage.entity_uids_page(IndexType::Sku, Some(20), 10).unwrap(),
            vec![30]
        );
        assert_eq!(
            storage.entity_uids_page(IndexType::Sku, Some(15), 1).unwrap(),
            vec![30]
        );
    }

    #[test]
    fn test_entity_uids_modified_since() {
        let (storage, _temp) = create_test_storage();
        let since = Utc::now();
        storage
            .put_entity(&EntityRecord::new(IndexType::Product, 1).with_updated_at(since - chrono::Duration::hours(1)))
            .unwrap();
        storage
            .put_entity(&EntityRecord::new(IndexType::Product, 2).with_updated_at(since + chrono::Duration::minutes(1)))
            .unwrap();
        storage
            .put_entity(&EntityRecord::new(IndexType::Sku, 3).with_updated_at(since + chrono::Duration::minutes(1)))
            .unwrap();

        assert_eq!(
            storage
                .entity_uids_modified_since(IndexType::Product, since)
                .unwrap(),
            vec![2]
        );
    }

    #[test]
    fn test_last_build_time_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            assert!(storage.last_build_time(IndexType::Promotion).unwrap().is_none());
            storage.set_last_build_time(IndexType::Promotion, at).unwrap();
        }

        let storage = Storage::open(temp_dir.path()).unwrap();
        assert_eq!(storage.last_build_time(IndexType::Promotion).unwrap(), Some(at));
        assert!(storage.last_build_time(IndexType::Product).unwrap().is_none());
    }

    #[test]
    fn test_related_entity_uids() {
        let (storage, _temp) = create_test_storage();
        storage
            .put_entity(&EntityRecord::new(IndexType::Product, 1).with_relation("category", 12))
            .unwrap();
        storage
            .put_entity(&EntityRecord::new(IndexType::Product, 2).with_relation("category", 13))
            .unwrap();
        storage
            .put_entity(&EntityRecord::new(IndexType::Product, 3).with_relation("category", 12))
            .unwrap();

        let uids = storage
            .related_entity_uids(IndexType::Product, &RelatedEntity::new("category", 12))
            .unwrap();
        assert_eq!(uids, vec![1, 3]);
    }

    #[test]
    fn test_get_stats() {
        let (storage, _temp) = create_test_storage();
        storage
            .put_entity(&EntityRecord::new(IndexType::Sku, 1))
            .unwrap();
        storage
            .put_notification(IndexNotification::update(IndexType::Sku, 1))
            .unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.entity_count, 1);
        assert_eq!(stats.notification_count, 1);
    }
}
