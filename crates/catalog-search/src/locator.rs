//! Where each index type's physical index lives.

use std::path::{Path, PathBuf};

use catalog_types::IndexType;

/// Resolves the on-disk location of an index type's search index.
pub trait SearchIndexLocator: Send + Sync {
    fn search_index_location(&self, index_type: IndexType) -> PathBuf;
}

/// One sub-directory per index name under a common root.
#[derive(Debug, Clone)]
pub struct DirectorySearchIndexLocator {
    root: PathBuf,
}

impl DirectorySearchIndexLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SearchIndexLocator for DirectorySearchIndexLocator {
    fn search_index_location(&self, index_type: IndexType) -> PathBuf {
        self.root.join(index_type.index_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_per_index_name() {
        let locator = DirectorySearchIndexLocator::new("/var/lib/catalog/indexes");
        assert_eq!(
            locator.search_index_location(IndexType::ShippingServiceLevel),
            PathBuf::from("/var/lib/catalog/indexes/shippingservicelevel")
        );
        assert_ne!(
            locator.search_index_location(IndexType::Product),
            locator.search_index_location(IndexType::Sku)
        );
    }
}
