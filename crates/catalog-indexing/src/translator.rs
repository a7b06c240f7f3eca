//! Default entity -> document translation.

use std::collections::BTreeSet;

use catalog_types::{EntityRecord, IndexDocument};

use crate::collaborators::DocumentTranslator;
use crate::error::PipelineError;

/// Copies entity fields into the document, optionally restricted to a
/// field allow-list. Relations become `related.{entity_type}` fields
/// holding the related uids separated by spaces.
#[derive(Debug, Clone)]
pub struct FieldCopyTranslator {
    fields: Option<BTreeSet<String>>,
    include_relations: bool,
}

impl FieldCopyTranslator {
    /// Copy every field and relation.
    pub fn new() -> Self {
        Self {
            fields: None,
            include_relations: true,
        }
    }

    /// Copy only the named fields.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_relations(mut self) -> Self {
        self.include_relations = false;
        self
    }
}

impl Default for FieldCopyTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentTranslator for FieldCopyTranslator {
    fn to_document(&self, entity: &EntityRecord) -> Result<IndexDocument, PipelineError> {
        let mut document = IndexDocument::new(entity.index_type, entity.uid);

        for (name, value) in &entity.fields {
            if self.fields.as_ref().map_or(true, |allowed| allowed.contains(name)) {
                document.fields.insert(name.clone(), value.clone());
            }
        }

        if self.include_relations {
            for (entity_type, uids) in &entity.relations {
                let joined = uids
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                document
                    .fields
                    .insert(format!("related.{}", entity_type), joined);
            }
        }

        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_types::IndexType;

    fn entity() -> EntityRecord {
        EntityRecord::new(IndexType::Product, 7)
            .with_field("name", "Trail Shoe")
            .with_field("internal_note", "do not index")
            .with_relation("category", 12)
            .with_relation("category", 14)
    }

    #[test]
    fn test_copies_all_fields_and_relations() {
        let doc = FieldCopyTranslator::new().to_document(&entity()).unwrap();
        assert_eq!(doc.uid, 7);
        assert_eq!(doc.index_type, IndexType::Product);
        assert_eq!(doc.fields.get("name").map(String::as_str), Some("Trail Shoe"));
        assert_eq!(
            doc.fields.get("related.category").map(String::as_str),
            Some("12 14")
        );
    }

    #[test]
    fn test_field_allow_list() {
        let doc = FieldCopyTranslator::new()
            .with_fields(["name"])
            .without_relations()
            .to_document(&entity())
            .unwrap();
        assert_eq!(doc.fields.len(), 1);
        assert!(doc.fields.contains_key("name"));
    }
}
