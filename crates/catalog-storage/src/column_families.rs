//! Column family definitions for RocksDB.
//!
//! - notifications: pending index notifications, removed once consumed
//! - entities: indexable domain entities, one key per (index type, uid)
//! - build_status: start time of the last clean build per index type

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for pending index notifications
pub const CF_NOTIFICATIONS: &str = "notifications";

/// Column family name for indexable entities
pub const CF_ENTITIES: &str = "entities";

/// Column family name for per-index build bookkeeping
pub const CF_BUILD_STATUS: &str = "build_status";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[CF_NOTIFICATIONS, CF_ENTITIES, CF_BUILD_STATUS];

/// Entities are read far more than written; compress them.
fn entities_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_NOTIFICATIONS, Options::default()),
        ColumnFamilyDescriptor::new(CF_ENTITIES, entities_options()),
        ColumnFamilyDescriptor::new(CF_BUILD_STATUS, Options::default()),
    ]
}
