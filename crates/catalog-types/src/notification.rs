//! Index notifications: "an entity changed, reflect it in the index".
//!
//! Notifications are written by whatever changes domain entities and are
//! consumed by the indexing pipeline. A notification is removed from the
//! store only after the commit covering it succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::index_type::IndexType;

/// Entity identifier.
pub type Uid = u64;

/// What kind of change a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    /// Entity added or modified; (re)build its document
    Update,
    /// Entity removed; delete its document
    Delete,
    /// Remove every document of the index type
    DeleteAll,
    /// Clear and repopulate the whole index from a full scan
    Rebuild,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Update => "update",
            UpdateType::Delete => "delete",
            UpdateType::DeleteAll => "delete_all",
            UpdateType::Rebuild => "rebuild",
        }
    }

    /// True for update types that affect the whole index.
    pub fn is_index_wide(&self) -> bool {
        matches!(self, UpdateType::DeleteAll | UpdateType::Rebuild)
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UpdateType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "update" => Ok(UpdateType::Update),
            "delete" => Ok(UpdateType::Delete),
            "delete_all" => Ok(UpdateType::DeleteAll),
            "rebuild" => Ok(UpdateType::Rebuild),
            other => Err(TypesError::InvalidArgument(format!(
                "unknown update type: {}",
                other
            ))),
        }
    }
}

/// Reference to a related entity whose change affects many indexed entities,
/// e.g. every product in a category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedEntity {
    /// Kind of the related entity ("category", "brand", "store", ...)
    pub entity_type: String,
    /// Identifier of the related entity
    pub uid: Uid,
}

impl RelatedEntity {
    pub fn new(entity_type: impl Into<String>, uid: Uid) -> Self {
        Self {
            entity_type: entity_type.into(),
            uid,
        }
    }
}

/// The entities a notification points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectedEntities {
    /// A single entity
    Single(Uid),
    /// An explicit list of entities
    Many(Vec<Uid>),
    /// Entities found through a related entity (resolved by the entity loader)
    Related(RelatedEntity),
    /// Every entity of the index type
    All,
}

impl AffectedEntities {
    /// Directly listed uids; empty for `Related` and `All`.
    pub fn uids(&self) -> Vec<Uid> {
        match self {
            AffectedEntities::Single(uid) => vec![*uid],
            AffectedEntities::Many(uids) => uids.clone(),
            AffectedEntities::Related(_) | AffectedEntities::All => Vec::new(),
        }
    }
}

/// A pending index notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexNotification {
    /// Store-assigned sequence number (0 until stored)
    pub id: u64,

    /// Index the change concerns
    pub index_type: IndexType,

    /// Kind of change
    pub update_type: UpdateType,

    /// Affected entities
    pub affected: AffectedEntities,

    /// Creation time (milliseconds since epoch in JSON)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl IndexNotification {
    /// Create a notification. The store assigns the id.
    pub fn new(index_type: IndexType, update_type: UpdateType, affected: AffectedEntities) -> Self {
        Self {
            id: 0,
            index_type,
            update_type,
            affected,
            created_at: Utc::now(),
        }
    }

    /// Entity added or modified.
    pub fn update(index_type: IndexType, uid: Uid) -> Self {
        Self::new(index_type, UpdateType::Update, AffectedEntities::Single(uid))
    }

    /// Several entities added or modified.
    pub fn update_many(index_type: IndexType, uids: Vec<Uid>) -> Self {
        Self::new(index_type, UpdateType::Update, AffectedEntities::Many(uids))
    }

    /// Entity removed.
    pub fn delete(index_type: IndexType, uid: Uid) -> Self {
        Self::new(index_type, UpdateType::Delete, AffectedEntities::Single(uid))
    }

    /// Several entities removed.
    pub fn delete_many(index_type: IndexType, uids: Vec<Uid>) -> Self {
        Self::new(index_type, UpdateType::Delete, AffectedEntities::Many(uids))
    }

    /// Change to a related entity.
    pub fn related(index_type: IndexType, update_type: UpdateType, related: RelatedEntity) -> Self {
        Self::new(index_type, update_type, AffectedEntities::Related(related))
    }

    /// Remove every document of the index type.
    pub fn delete_all(index_type: IndexType) -> Self {
        Self::new(index_type, UpdateType::DeleteAll, AffectedEntities::All)
    }

    /// Rebuild the whole index.
    pub fn rebuild(index_type: IndexType) -> Self {
        Self::new(index_type, UpdateType::Rebuild, AffectedEntities::All)
    }

    /// Set the store id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Check that the update type and affected entities agree.
    pub fn validate(&self) -> Result<(), TypesError> {
        match (self.update_type.is_index_wide(), &self.affected) {
            (true, AffectedEntities::All) => Ok(()),
            (true, _) => Err(TypesError::InvalidArgument(format!(
                "{} notification must affect all entities",
                self.update_type
            ))),
            (false, AffectedEntities::All) => Err(TypesError::InvalidArgument(format!(
                "{} notification cannot affect all entities",
                self.update_type
            ))),
            (false, AffectedEntities::Many(uids)) if uids.is_empty() => Err(
                TypesError::InvalidArgument("notification affects no entities".to_string()),
            ),
            (false, _) => Ok(()),
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
