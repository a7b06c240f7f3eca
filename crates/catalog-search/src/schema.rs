//! Tantivy schema for catalog documents.
//!
//! The engine only needs to store a document by identifier; every
//! attribute is folded into one searchable text field.

use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};

use crate::error::SearchError;

/// Schema field handles
#[derive(Debug, Clone)]
pub struct CatalogSchema {
    schema: Schema,
    /// Primary key: the entity uid as decimal text (STRING | STORED)
    pub doc_id: Field,
    /// Index name of the owning index type (STRING | STORED)
    pub index_type: Field,
    /// Concatenated field values (TEXT)
    pub text: Field,
}

impl CatalogSchema {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Recover field handles from an index opened from disk.
    pub fn from_schema(schema: Schema) -> Result<Self, SearchError> {
        let doc_id = schema
            .get_field("doc_id")
            .map_err(|_| SearchError::SchemaMismatch("missing doc_id field".into()))?;
        let index_type = schema
            .get_field("index_type")
            .map_err(|_| SearchError::SchemaMismatch("missing index_type field".into()))?;
        let text = schema
            .get_field("text")
            .map_err(|_| SearchError::SchemaMismatch("missing text field".into()))?;

        Ok(Self {
            schema,
            doc_id,
            index_type,
            text,
        })
    }
}

/// Build the catalog document schema.
pub fn build_catalog_schema() -> CatalogSchema {
    let mut schema_builder = Schema::builder();

    let doc_id = schema_builder.add_text_field("doc_id", STRING | STORED);
    let index_type = schema_builder.add_text_field("index_type", STRING | STORED);
    let text = schema_builder.add_text_field("text", TEXT);

    CatalogSchema {
        schema: schema_builder.build(),
        doc_id,
        index_type,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_schema() {
        let original = build_catalog_schema();
        let rebuilt = CatalogSchema::from_schema(original.schema().clone()).unwrap();
        assert_eq!(rebuilt.doc_id, original.doc_id);
        assert_eq!(rebuilt.text, original.text);
    }

    #[test]
    fn test_from_schema_rejects_foreign_schema() {
        let mut builder = Schema::builder();
        builder.add_text_field("title", TEXT);
        assert!(matches!(
            CatalogSchema::from_schema(builder.build()),
            Err(SearchError::SchemaMismatch(_))
        ));
    }
}
