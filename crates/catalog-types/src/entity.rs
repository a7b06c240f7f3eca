//! Loaded domain entities and the index documents built from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::index_type::IndexType;
use crate::notification::Uid;

/// A domain entity as returned by the entity loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub index_type: IndexType,
    pub uid: Uid,
    /// Attribute name -> value
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Related entities, keyed by related entity type ("category" -> [12, 14])
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<Uid>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(index_type: IndexType, uid: Uid) -> Self {
        Self {
            index_type,
            uid,
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Add an attribute.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add a relation to another entity.
    pub fn with_relation(mut self, entity_type: impl Into<String>, uid: Uid) -> Self {
        self.relations.entry(entity_type.into()).or_default().push(uid);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Check whether this entity is related to `uid` of `entity_type`.
    pub fn is_related_to(&self, entity_type: &str, uid: Uid) -> bool {
        self.relations
            .get(entity_type)
            .is_some_and(|uids| uids.contains(&uid))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A translated document ready for the index engine.
///
/// The uid is the document's primary key: adding a document for a uid that
/// is already indexed replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub index_type: IndexType,
    pub uid: Uid,
    pub fields: BTreeMap<String, String>,
}

impl IndexDocument {
    pub fn new(index_type: IndexType, uid: Uid) -> Self {
        Self {
            index_type,
            uid,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// All field values joined for full-text indexing, in field-name order.
    pub fn text(&self) -> String {
        self.fields
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
