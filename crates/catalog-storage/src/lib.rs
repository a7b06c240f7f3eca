//! Storage layer for catalog-search.
//!
//! Provides RocksDB-backed storage with:
//! - A notification queue keyed by monotonic sequence (store order = id order)
//! - An entity store keyed by index type and uid for loading and full scans
//! - Atomic multi-key removal via WriteBatch
//! - The start time of the last clean build per index type

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;

pub use db::{Storage, StorageStats};
pub use error::StorageError;
pub use keys::{BuildStatusKey, EntityKey, NotificationKey};
