//! Index types: the partition key of every index and notification.

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Kind of indexable commerce entity.
///
/// Every physical search index, every notification and every build run
/// belongs to exactly one index type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Product,
    Category,
    Sku,
    Customer,
    Promotion,
    CmUser,
    ShippingServiceLevel,
}

impl IndexType {
    /// All index types, in a stable order.
    pub const ALL: [IndexType; 7] = [
        IndexType::Product,
        IndexType::Category,
        IndexType::Sku,
        IndexType::Customer,
        IndexType::Promotion,
        IndexType::CmUser,
        IndexType::ShippingServiceLevel,
    ];

    /// Stable index name, used for directories, storage keys and the CLI.
    pub fn index_name(&self) -> &'static str {
        match self {
            IndexType::Product => "product",
            IndexType::Category => "category",
            IndexType::Sku => "sku",
            IndexType::Customer => "customer",
            IndexType::Promotion => "promotion",
            IndexType::CmUser => "cmuser",
            IndexType::ShippingServiceLevel => "shippingservicelevel",
        }
    }

    /// Look up an index type by its index name (case-insensitive).
    ///
    /// Empty or unknown names are rejected with `InvalidArgument`.
    pub fn from_name(name: &str) -> Result<Self, TypesError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(TypesError::InvalidArgument(
                "index type name must not be empty".to_string(),
            ));
        }

        Self::ALL
            .iter()
            .copied()
            .find(|t| t.index_name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| TypesError::InvalidArgument(format!("unknown index type: {}", name)))
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.index_name())
    }
}

impl std::str::FromStr for IndexType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}
