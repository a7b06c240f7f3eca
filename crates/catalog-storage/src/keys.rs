//! Key encoding and decoding for storage layer.
//!
//! - notifications: `notification:{sequence:020}`
//! - entities: `{index_name}:{uid:020}`
//! - build status: `last_build:{index_name}`
//!
//! Zero padding keeps lexicographic order equal to numeric order, so
//! forward iteration yields notifications in store order and entities in
//! uid order.

use catalog_types::{IndexType, Uid};

use crate::error::StorageError;

/// Key for a pending notification
/// Format: notification:{sequence:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationKey {
    /// Monotonic sequence number (also the notification id)
    pub sequence: u64,
}

impl NotificationKey {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("notification:{:020}", self.sequence).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let sequence = s
            .strip_prefix("notification:")
            .ok_or_else(|| StorageError::Key(format!("Invalid notification key format: {}", s)))?
            .parse::<u64>()
            .map_err(|e| StorageError::Key(format!("Invalid sequence: {}", e)))?;

        Ok(Self { sequence })
    }
}

/// Key for an indexable entity
/// Format: {index_name}:{uid:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityKey {
    pub index_type: IndexType,
    pub uid: Uid,
}

impl EntityKey {
    pub fn new(index_type: IndexType, uid: Uid) -> Self {
        Self { index_type, uid }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}:{:020}", self.index_type.index_name(), self.uid).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;

        let (name, uid) = s
            .split_once(':')
            .ok_or_else(|| StorageError::Key(format!("Invalid entity key format: {}", s)))?;
        let index_type =
            IndexType::from_name(name).map_err(|e| StorageError::Key(e.to_string()))?;
        let uid: Uid = uid
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid uid: {}", e)))?;

        Ok(Self { index_type, uid })
    }

    /// Prefix covering every entity of an index type.
    pub fn prefix(index_type: IndexType) -> Vec<u8> {
        format!("{}:", index_type.index_name()).into_bytes()
    }
}

/// Key for the last build time of an index type
/// Format: last_build:{index_name}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStatusKey {
    pub index_type: IndexType,
}

impl BuildStatusKey {
    pub fn new(index_type: IndexType) -> Self {
        Self { index_type }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("last_build:{}", self.index_type.index_name()).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_key_parse() {
        let key = NotificationKey::new(42);
        assert_eq!(key.to_bytes(), b"notification:00000000000000000042".to_vec());
        assert_eq!(NotificationKey::from_bytes(&key.to_bytes()).unwrap(), key);
        assert!(NotificationKey::from_bytes(b"outbox:1").is_err());
    }

    #[test]
    fn test_notification_keys_sort_numerically() {
        assert!(NotificationKey::new(9).to_bytes() < NotificationKey::new(10).to_bytes());
    }

    #[test]
    fn test_entity_key_parse() {
        let key = EntityKey::new(IndexType::CmUser, 7);
        assert_eq!(key.to_bytes(), b"cmuser:00000000000000000007".to_vec());
        assert_eq!(EntityKey::from_bytes(&key.to_bytes()).unwrap(), key);
        assert!(EntityKey::from_bytes(b"warehouse:00000000000000000001").is_err());
        assert!(EntityKey::from_bytes(b"product").is_err());
    }

    #[test]
    fn test_build_status_key() {
        assert_eq!(
            BuildStatusKey::new(IndexType::Sku).to_bytes(),
            b"last_build:sku".to_vec()
        );
    }

    #[test]
    fn test_entity_prefix_matches_only_its_type() {
        let product = EntityKey::new(IndexType::Product, 1).to_bytes();
        assert!(product.starts_with(&EntityKey::prefix(IndexType::Product)));
        assert!(!product.starts_with(&EntityKey::prefix(IndexType::Promotion)));
    }
}
