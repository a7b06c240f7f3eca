//! # catalog-search
//!
//! Tantivy storage for catalog search indexes.
//!
//! One physical index per [`IndexType`](catalog_types::IndexType), located
//! by a [`SearchIndexLocator`]. The [`TantivyIndexEngine`] offers the write
//! primitives the indexing pipeline needs: upsert by uid, delete, delete-all,
//! commit, optimize (segment merge) and stats. There is no query path.

pub mod engine;
pub mod error;
pub mod locator;
pub mod schema;

pub use engine::{IndexStats, TantivyIndexEngine, DEFAULT_WRITER_MEMORY_MB};
pub use error::SearchError;
pub use locator::{DirectorySearchIndexLocator, SearchIndexLocator};
pub use schema::{build_catalog_schema, CatalogSchema};
