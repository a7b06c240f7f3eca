//! In-memory collaborators for tests.
//!
//! Enabled for this crate's unit tests and, through the `test-support`
//! feature, for integration tests and downstream crates.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use catalog_types::{EntityRecord, IndexDocument, IndexNotification, IndexType, RelatedEntity, Uid};

use crate::collaborators::{EngineStats, EntityLoader, IndexEngine, NotificationStore};
use crate::error::PipelineError;
use crate::stage::{IndexingStage, StageOutput, UidGroup};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Error injected a limited number of times.
struct Injected {
    uid: Option<Uid>,
    error: PipelineError,
    remaining: usize,
}

/// Take one injected error. With `uids`, only uid-specific injections
/// matching one of them apply; without, only the others do.
fn take_injected(failures: &Mutex<Vec<Injected>>, uids: Option<&[Uid]>) -> Option<PipelineError> {
    let mut failures = lock(failures);
    let failure = failures.iter_mut().find(|f| {
        f.remaining > 0
            && match (f.uid, uids) {
                (Some(uid), Some(uids)) => uids.contains(&uid),
                (None, None) => true,
                _ => false,
            }
    })?;
    failure.remaining -= 1;
    Some(failure.error.clone())
}

/// Terminal stage that records every group it receives.
#[derive(Default)]
pub struct RecordingStage {
    groups: Mutex<Vec<UidGroup>>,
    fail_on: Option<(usize, PipelineError)>,
}

impl RecordingStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call_index`-th call (0-based). The failing group is still
    /// recorded.
    pub fn failing_on(call_index: usize, error: PipelineError) -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
            fail_on: Some((call_index, error)),
        }
    }

    pub fn groups(&self) -> Vec<UidGroup> {
        lock(&self.groups).clone()
    }

    pub fn uid_groups(&self) -> Vec<Vec<Uid>> {
        lock(&self.groups).iter().map(|g| g.uids.clone()).collect()
    }
}

#[async_trait]
impl IndexingStage<UidGroup> for RecordingStage {
    async fn send(&self, group: UidGroup) -> Result<StageOutput, PipelineError> {
        let call = {
            let mut groups = lock(&self.groups);
            groups.push(group);
            groups.len() - 1
        };
        match &self.fail_on {
            Some((index, error)) if *index == call => Err(error.clone()),
            _ => Ok(StageOutput::default()),
        }
    }
}

/// Entity source backed by a map.
#[derive(Default)]
pub struct InMemoryEntityLoader {
    entities: Mutex<BTreeMap<(IndexType, Uid), EntityRecord>>,
    failures: Mutex<Vec<Injected>>,
    delays: Mutex<HashMap<Uid, Duration>>,
    load_calls: AtomicUsize,
}

impl InMemoryEntityLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, entity: EntityRecord) {
        lock(&self.entities).insert((entity.index_type, entity.uid), entity);
    }

    pub fn remove(&self, index_type: IndexType, uid: Uid) {
        lock(&self.entities).remove(&(index_type, uid));
    }

    /// Fail the next `times` loads whose uids include `uid`.
    pub fn fail_loads_containing(&self, uid: Uid, error: PipelineError, times: usize) {
        lock(&self.failures).push(Injected {
            uid: Some(uid),
            error,
            remaining: times,
        });
    }

    /// Fail the next `times` rebuild page scans.
    pub fn fail_page_scans(&self, error: PipelineError, times: usize) {
        lock(&self.failures).push(Injected {
            uid: None,
            error,
            remaining: times,
        });
    }

    /// Sleep before every load whose uids include `uid`.
    pub fn delay_loads_containing(&self, uid: Uid, delay: Duration) {
        lock(&self.delays).insert(uid, delay);
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    fn delay_for(&self, uids: &[Uid]) -> Option<Duration> {
        let delays = lock(&self.delays);
        uids.iter().filter_map(|uid| delays.get(uid)).max().copied()
    }
}

#[async_trait]
impl EntityLoader for InMemoryEntityLoader {
    async fn load_entities(
        &self,
        index_type: IndexType,
        uids: &[Uid],
    ) -> Result<Vec<EntityRecord>, PipelineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay_for(uids) {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = take_injected(&self.failures, Some(uids)) {
            return Err(error);
        }

        let entities = lock(&self.entities);
        Ok(uids
            .iter()
            .filter_map(|uid| entities.get(&(index_type, *uid)).cloned())
            .collect())
    }

    async fn all_uids(
        &self,
        index_type: IndexType,
        after: Option<Uid>,
        limit: usize,
    ) -> Result<Vec<Uid>, PipelineError> {
        if let Some(error) = take_injected(&self.failures, None) {
            return Err(error);
        }

        let start = match after {
            Some(uid) => Bound::Excluded((index_type, uid)),
            None => Bound::Included((index_type, Uid::MIN)),
        };
        Ok(lock(&self.entities)
            .range((start, Bound::Unbounded))
            .map(|(key, _)| *key)
            .take_while(|(t, _)| *t == index_type)
            .map(|(_, uid)| uid)
            .take(limit)
            .collect())
    }

    async fn modified_since(
        &self,
        index_type: IndexType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Uid>, PipelineError> {
        Ok(lock(&self.entities)
            .values()
            .filter(|e| e.index_type == index_type && e.updated_at >= since)
            .map(|e| e.uid)
            .collect())
    }

    async fn related_uids(
        &self,
        index_type: IndexType,
        related: &RelatedEntity,
    ) -> Result<Vec<Uid>, PipelineError> {
        Ok(lock(&self.entities)
            .values()
            .filter(|e| e.index_type == index_type && e.is_related_to(&related.entity_type, related.uid))
            .map(|e| e.uid)
            .collect())
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Add(IndexDocument),
    Delete(Uid),
    DeleteAll,
}

#[derive(Debug, Default)]
struct MemoryIndex {
    exists: bool,
    committed: BTreeMap<Uid, IndexDocument>,
    pending: Vec<PendingOp>,
    deleted_since_optimize: u64,
}

/// Index engine keeping committed documents in memory. Operations become
/// visible on commit and are dropped on rollback.
pub struct InMemoryIndexEngine {
    indices: Mutex<HashMap<IndexType, MemoryIndex>>,
    missing_by_default: bool,
    commit_failures: Mutex<Vec<Injected>>,
    add_calls: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    optimizations: AtomicUsize,
    delete_all_calls: AtomicUsize,
}

impl Default for InMemoryIndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIndexEngine {
    /// Every index exists and is empty.
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(HashMap::new()),
            missing_by_default: false,
            commit_failures: Mutex::new(Vec::new()),
            add_calls: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            optimizations: AtomicUsize::new(0),
            delete_all_calls: AtomicUsize::new(0),
        }
    }

    /// No index exists until its first commit.
    pub fn without_indexes() -> Self {
        Self {
            missing_by_default: true,
            ..Self::new()
        }
    }

    /// Fail the next `times` commits.
    pub fn fail_commits(&self, error: PipelineError, times: usize) {
        lock(&self.commit_failures).push(Injected {
            uid: None,
            error,
            remaining: times,
        });
    }

    fn with_index<R>(&self, index_type: IndexType, f: impl FnOnce(&mut MemoryIndex) -> R) -> R {
        let mut indices = lock(&self.indices);
        let index = indices.entry(index_type).or_insert_with(|| MemoryIndex {
            exists: !self.missing_by_default,
            ..Default::default()
        });
        f(index)
    }

    pub fn committed_uids(&self, index_type: IndexType) -> Vec<Uid> {
        self.with_index(index_type, |index| index.committed.keys().copied().collect())
    }

    pub fn committed_document(&self, index_type: IndexType, uid: Uid) -> Option<IndexDocument> {
        self.with_index(index_type, |index| index.committed.get(&uid).cloned())
    }

    pub fn pending_operations(&self, index_type: IndexType) -> usize {
        self.with_index(index_type, |index| index.pending.len())
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn optimizations(&self) -> usize {
        self.optimizations.load(Ordering::SeqCst)
    }

    pub fn delete_all_calls(&self) -> usize {
        self.delete_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexEngine for InMemoryIndexEngine {
    async fn add_documents(
        &self,
        index_type: IndexType,
        documents: &[IndexDocument],
    ) -> Result<usize, PipelineError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(wrong) = documents.iter().find(|d| d.index_type != index_type) {
            return Err(PipelineError::Fatal(format!(
                "document {} belongs to {}, not {}",
                wrong.uid, wrong.index_type, index_type
            )));
        }
        self.with_index(index_type, |index| {
            index
                .pending
                .extend(documents.iter().cloned().map(PendingOp::Add));
        });
        Ok(documents.len())
    }

    async fn delete(&self, index_type: IndexType, uids: &[Uid]) -> Result<usize, PipelineError> {
        self.with_index(index_type, |index| {
            index.pending.extend(uids.iter().copied().map(PendingOp::Delete));
        });
        Ok(uids.len())
    }

    async fn delete_all(&self, index_type: IndexType) -> Result<(), PipelineError> {
        self.delete_all_calls.fetch_add(1, Ordering::SeqCst);
        self.with_index(index_type, |index| index.pending.push(PendingOp::DeleteAll));
        Ok(())
    }

    async fn commit(&self, index_type: IndexType) -> Result<(), PipelineError> {
        if let Some(error) = take_injected(&self.commit_failures, None) {
            return Err(error);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.with_index(index_type, |index| {
            for op in std::mem::take(&mut index.pending) {
                match op {
                    PendingOp::Add(document) => {
                        index.committed.insert(document.uid, document);
                    }
                    PendingOp::Delete(uid) => {
                        if index.committed.remove(&uid).is_some() {
                            index.deleted_since_optimize += 1;
                        }
                    }
                    PendingOp::DeleteAll => {
                        index.deleted_since_optimize += index.committed.len() as u64;
                        index.committed.clear();
                    }
                }
            }
            index.exists = true;
        });
        Ok(())
    }

    async fn rollback(&self, index_type: IndexType) -> Result<(), PipelineError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.with_index(index_type, |index| index.pending.clear());
        Ok(())
    }

    async fn optimize(&self, index_type: IndexType) -> Result<(), PipelineError> {
        self.optimizations.fetch_add(1, Ordering::SeqCst);
        self.with_index(index_type, |index| index.deleted_since_optimize = 0);
        Ok(())
    }

    async fn index_exists(&self, index_type: IndexType) -> Result<bool, PipelineError> {
        Ok(self.with_index(index_type, |index| index.exists))
    }

    async fn stats(&self, index_type: IndexType) -> Result<EngineStats, PipelineError> {
        Ok(self.with_index(index_type, |index| EngineStats {
            num_docs: index.committed.len() as u64,
            deleted_docs: index.deleted_since_optimize,
            pending_operations: index.pending.len() as u64,
        }))
    }
}

/// Notification store backed by an ordered map.
pub struct InMemoryNotificationStore {
    notifications: Mutex<BTreeMap<u64, IndexNotification>>,
    next_id: AtomicU64,
    build_times: Mutex<HashMap<IndexType, DateTime<Utc>>>,
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            notifications: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            build_times: Mutex::new(HashMap::new()),
        }
    }

    /// Store a notification and return its id.
    pub fn push(&self, notification: IndexNotification) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.notifications).insert(id, notification.with_id(id));
        id
    }

    pub fn len(&self) -> usize {
        lock(&self.notifications).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids still pending, ascending.
    pub fn ids(&self) -> Vec<u64> {
        lock(&self.notifications).keys().copied().collect()
    }

    /// Pending notifications, in id order.
    pub fn notifications(&self) -> Vec<IndexNotification> {
        lock(&self.notifications).values().cloned().collect()
    }

    pub fn build_time(&self, index_type: IndexType) -> Option<DateTime<Utc>> {
        lock(&self.build_times).get(&index_type).copied()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn put(&self, notification: IndexNotification) -> Result<u64, PipelineError> {
        notification.validate()?;
        Ok(self.push(notification))
    }

    async fn find_by_index_type(
        &self,
        index_type: IndexType,
    ) -> Result<Vec<IndexNotification>, PipelineError> {
        Ok(lock(&self.notifications)
            .values()
            .filter(|n| n.index_type == index_type)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<IndexNotification>, PipelineError> {
        Ok(lock(&self.notifications).values().cloned().collect())
    }

    async fn remove(&self, ids: &[u64]) -> Result<usize, PipelineError> {
        let mut notifications = lock(&self.notifications);
        Ok(ids
            .iter()
            .filter(|id| notifications.remove(*id).is_some())
            .count())
    }

    async fn last_build_time(
        &self,
        index_type: IndexType,
    ) -> Result<Option<DateTime<Utc>>, PipelineError> {
        Ok(self.build_time(index_type))
    }

    async fn set_last_build_time(
        &self,
        index_type: IndexType,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        lock(&self.build_times).insert(index_type, at);
        Ok(())
    }
}
