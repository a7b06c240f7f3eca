//! # catalog-types
//!
//! Shared domain types for the catalog search indexing system.
//!
//! This crate defines the data structures passed between the notification
//! store, the indexing pipeline and the index engine:
//! - [`IndexType`]: the kind of entity an index (or notification) concerns
//! - [`IndexNotification`]: a pending "something changed" record
//! - [`EntityRecord`] / [`IndexDocument`]: loaded entities and their translated documents
//! - [`Settings`]: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use catalog_types::{IndexType, IndexNotification};
//!
//! let notification = IndexNotification::update(IndexType::Product, 7);
//! assert_eq!(notification.index_type, IndexType::Product);
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod index_type;
pub mod notification;

pub use config::{PipelineSettings, PolicySettings, ScheduleSettings, Settings};
pub use entity::{EntityRecord, IndexDocument};
pub use error::TypesError;
pub use index_type::IndexType;
pub use notification::{AffectedEntities, IndexNotification, RelatedEntity, Uid, UpdateType};
