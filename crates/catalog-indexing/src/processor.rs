//! Retrieval and classification of pending notifications.
//!
//! [`NotificationProcessor`] reads notifications from the store without
//! removing them. [`NotificationBatch::classify`] coalesces them into the
//! work a build run has to do and remembers which notifications each uid
//! came from, so only fully processed notifications get consumed.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use catalog_types::{AffectedEntities, IndexNotification, IndexType, RelatedEntity, Uid, UpdateType};

use crate::collaborators::NotificationStore;
use crate::error::PipelineError;

/// Final action for one uid and the notification it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidAction {
    pub notification_id: u64,
    /// `Update` or `Delete`
    pub update_type: UpdateType,
}

/// A related-entity change still to be resolved into uids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedChange {
    pub notification_id: u64,
    pub update_type: UpdateType,
    pub related: RelatedEntity,
}

/// Coalesced view of one index type's pending notifications.
#[derive(Debug, Clone)]
pub struct NotificationBatch {
    pub index_type: IndexType,
    /// Id of the latest REBUILD notification
    pub rebuild_marker: Option<u64>,
    /// Id of the latest DELETE_ALL notification
    pub delete_all_marker: Option<u64>,
    actions: BTreeMap<Uid, UidAction>,
    /// Entities changed since the last build with no notification of their own
    modified: BTreeSet<Uid>,
    related: Vec<RelatedChange>,
    /// Notifications newer than the reset point and the uids they touch
    coverage: Vec<(u64, Vec<Uid>)>,
    /// Notifications at or before the reset point
    reset_covered: Vec<u64>,
    notification_ids: Vec<u64>,
}

impl NotificationBatch {
    /// Coalesce `notifications` of `index_type` (others are ignored).
    ///
    /// Only notifications newer than the latest DELETE_ALL or REBUILD are
    /// applied per uid; for each uid the most recent notification wins.
    pub fn classify(index_type: IndexType, notifications: &[IndexNotification]) -> Self {
        let mut ordered: Vec<&IndexNotification> = notifications
            .iter()
            .filter(|n| n.index_type == index_type)
            .collect();
        ordered.sort_by_key(|n| n.id);

        let latest = |update_type: UpdateType| {
            ordered
                .iter()
                .filter(|n| n.update_type == update_type)
                .map(|n| n.id)
                .max()
        };
        let rebuild_marker = latest(UpdateType::Rebuild);
        let delete_all_marker = latest(UpdateType::DeleteAll);
        let reset_point = rebuild_marker.max(delete_all_marker);

        let mut batch = Self {
            index_type,
            rebuild_marker,
            delete_all_marker,
            actions: BTreeMap::new(),
            modified: BTreeSet::new(),
            related: Vec::new(),
            coverage: Vec::new(),
            reset_covered: Vec::new(),
            notification_ids: ordered.iter().map(|n| n.id).collect(),
        };

        for notification in ordered {
            if reset_point.is_some_and(|reset| notification.id <= reset) {
                batch.reset_covered.push(notification.id);
                continue;
            }

            match &notification.affected {
                AffectedEntities::Single(_) | AffectedEntities::Many(_) => {
                    let uids = notification.affected.uids();
                    for uid in &uids {
                        batch.actions.insert(
                            *uid,
                            UidAction {
                                notification_id: notification.id,
                                update_type: notification.update_type,
                            },
                        );
                    }
                    batch.coverage.push((notification.id, uids));
                }
                AffectedEntities::Related(related) => batch.related.push(RelatedChange {
                    notification_id: notification.id,
                    update_type: notification.update_type,
                    related: related.clone(),
                }),
                // Index-wide notifications are always at or before the reset point
                AffectedEntities::All => batch.reset_covered.push(notification.id),
            }
        }

        batch
    }

    /// Id of the latest index-wide notification.
    pub fn reset_point(&self) -> Option<u64> {
        self.rebuild_marker.max(self.delete_all_marker)
    }

    /// True when the latest index-wide notification is a REBUILD.
    pub fn is_rebuild(&self) -> bool {
        self.rebuild_marker.is_some() && self.rebuild_marker == self.reset_point()
    }

    /// True when the latest index-wide notification is a DELETE_ALL.
    pub fn is_delete_all(&self) -> bool {
        self.delete_all_marker.is_some() && self.delete_all_marker == self.reset_point()
    }

    /// Uids whose final action is an upsert, including modified entities
    /// no notification mentions.
    pub fn upserts(&self) -> Vec<Uid> {
        let mut uids = self.uids_with(UpdateType::Update);
        uids.extend(
            self.modified
                .iter()
                .filter(|uid| !self.actions.contains_key(*uid)),
        );
        uids.sort_unstable();
        uids
    }

    /// Add entities changed since the last build. Uids that already have
    /// an action keep it.
    pub fn add_modified(&mut self, uids: &[Uid]) {
        self.modified.extend(
            uids.iter()
                .copied()
                .filter(|uid| !self.actions.contains_key(uid)),
        );
    }

    /// Modified entities that are upserted without a notification.
    pub fn modified_count(&self) -> usize {
        self.modified
            .iter()
            .filter(|uid| !self.actions.contains_key(*uid))
            .count()
    }

    /// Uids whose final action is a delete.
    pub fn deletes(&self) -> Vec<Uid> {
        self.uids_with(UpdateType::Delete)
    }

    fn uids_with(&self, update_type: UpdateType) -> Vec<Uid> {
        self.actions
            .iter()
            .filter(|(_, action)| action.update_type == update_type)
            .map(|(uid, _)| *uid)
            .collect()
    }

    pub fn action(&self, uid: Uid) -> Option<UidAction> {
        self.actions.get(&uid).copied()
    }

    /// Related-entity changes awaiting resolution, oldest first.
    pub fn related(&self) -> &[RelatedChange] {
        &self.related
    }

    /// Merge the resolved uids of a related-entity change. A uid keeps its
    /// current action if that came from a newer notification.
    pub fn apply_related(&mut self, notification_id: u64, uids: &[Uid]) {
        let Some(change) = self
            .related
            .iter()
            .find(|c| c.notification_id == notification_id)
            .cloned()
        else {
            return;
        };

        for uid in uids {
            let newer_exists = self
                .actions
                .get(uid)
                .is_some_and(|action| action.notification_id > notification_id);
            if !newer_exists {
                self.actions.insert(
                    *uid,
                    UidAction {
                        notification_id,
                        update_type: change.update_type,
                    },
                );
            }
        }
        self.coverage.push((notification_id, uids.to_vec()));
    }

    /// Ids of every notification in the batch, in store order.
    pub fn notification_ids(&self) -> &[u64] {
        &self.notification_ids
    }

    pub fn max_notification_id(&self) -> Option<u64> {
        self.notification_ids.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.notification_ids.is_empty()
    }

    /// True if there is anything to apply to the index.
    pub fn has_work(&self) -> bool {
        self.reset_point().is_some()
            || !self.actions.is_empty()
            || !self.related.is_empty()
            || !self.modified.is_empty()
    }

    /// Notifications that may be removed from the store.
    ///
    /// A pending reset must have been carried out (`reset_done`); other
    /// notifications qualify when every uid they touch is in `processed`.
    pub fn consumable_ids(&self, processed: &HashSet<Uid>, reset_done: bool) -> Vec<u64> {
        if self.reset_point().is_some() && !reset_done {
            return Vec::new();
        }

        let mut ids: Vec<u64> = self.reset_covered.clone();
        ids.extend(
            self.coverage
                .iter()
                .filter(|(_, uids)| uids.iter().all(|uid| processed.contains(uid)))
                .map(|(id, _)| *id),
        );
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Reads pending notifications for an index type.
///
/// The latest fetch is cached so callers can classify it again without
/// going back to the store.
pub struct NotificationProcessor {
    store: Arc<dyn NotificationStore>,
    notifications: Mutex<Vec<IndexNotification>>,
}

impl NotificationProcessor {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            notifications: Mutex::new(Vec::new()),
        }
    }

    fn cached(&self) -> MutexGuard<'_, Vec<IndexNotification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch every pending notification of `index_type`, in store order.
    /// The result replaces the cached notifications.
    pub async fn notifications_for(
        &self,
        index_type: IndexType,
    ) -> Result<Vec<IndexNotification>, PipelineError> {
        self.fetch(index_type, None).await
    }

    /// Same as [`notifications_for`](Self::notifications_for) by index
    /// name; empty or unknown names fail with `InvalidArgument`.
    pub async fn notifications_for_name(
        &self,
        name: &str,
    ) -> Result<Vec<IndexNotification>, PipelineError> {
        let index_type = IndexType::from_name(name)?;
        self.notifications_for(index_type).await
    }

    /// Fetch the notifications of `index_type` with an id above `after`
    /// and classify them.
    pub async fn fetch_batch(
        &self,
        index_type: IndexType,
        after: Option<u64>,
    ) -> Result<NotificationBatch, PipelineError> {
        let notifications = self.fetch(index_type, after).await?;
        Ok(NotificationBatch::classify(index_type, &notifications))
    }

    async fn fetch(
        &self,
        index_type: IndexType,
        after: Option<u64>,
    ) -> Result<Vec<IndexNotification>, PipelineError> {
        let mut notifications = self.store.find_by_index_type(index_type).await?;
        if let Some(after) = after {
            notifications.retain(|n| n.id > after);
        }
        debug!(index_type = %index_type, count = notifications.len(), after = ?after, "Fetched notifications");
        *self.cached() = notifications.clone();
        Ok(notifications)
    }

    /// Notifications from the latest fetch; empty before the first one.
    pub fn notifications(&self) -> Vec<IndexNotification> {
        self.cached().clone()
    }

    /// Classify the cached notifications.
    pub fn classify(&self, index_type: IndexType) -> NotificationBatch {
        NotificationBatch::classify(index_type, &self.cached())
    }

    /// True when a REBUILD or DELETE_ALL is pending for `index_type`.
    pub async fn is_rebuild_requested(&self, index_type: IndexType) -> Result<bool, PipelineError> {
        Ok(self
            .store
            .find_by_index_type(index_type)
            .await?
            .iter()
            .any(|n| n.update_type.is_index_wide()))
    }

    /// Index types with at least one pending notification.
    pub async fn pending_index_types(&self) -> Result<Vec<IndexType>, PipelineError> {
        let mut types: Vec<IndexType> = self
            .store
            .find_all()
            .await?
            .iter()
            .map(|n| n.index_type)
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }
}
