//! Tantivy schema for the circle index.
//!
//! Text fields carry relevance, numeric fast fields carry filters and the
//! sort chain. `create_time` is stored as epoch millis for sorting while
//! `create_time_text` keeps the original ISO-8601 string for output.

use tantivy::schema::{Field, Schema, FAST, INDEXED, STORED, STRING, TEXT};

use crate::SearchError;

/// Schema field handles for efficient access
#[derive(Debug, Clone)]
pub struct CircleSchema {
    schema: Schema,
    /// Primary key, equal to the source circle id (i64 | INDEXED | STORED | FAST)
    pub circle_id: Field,
    /// Analyzed circle name (TEXT | STORED)
    pub name: Field,
    /// Raw name for exact match (STRING | FAST)
    pub name_keyword: Field,
    /// Analyzed description (TEXT | STORED)
    pub description: Field,
    /// Avatar reference, not searchable (STRING | STORED)
    pub avatar_url: Field,
    pub hot: Field,
    pub category_id: Field,
    pub member_count: Field,
    pub post_count: Field,
    /// Creation time in epoch milliseconds
    pub create_time: Field,
    /// Creation time as received (STORED)
    pub create_time_text: Field,
    pub status: Field,
    pub deleted: Field,
    pub join_type: Field,
}

impl CircleSchema {
    /// Get the underlying Tantivy schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create a CircleSchema from an existing Tantivy Schema.
    ///
    /// Fails with `SchemaMismatch` when an index on disk predates a field.
    pub fn from_schema(schema: Schema) -> Result<Self, SearchError> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| SearchError::SchemaMismatch(format!("missing {} field", name)))
        };

        Ok(Self {
            circle_id: field("circle_id")?,
            name: field("name")?,
            name_keyword: field("name_keyword")?,
            description: field("description")?,
            avatar_url: field("avatar_url")?,
            hot: field("hot")?,
            category_id: field("category_id")?,
            member_count: field("member_count")?,
            post_count: field("post_count")?,
            create_time: field("create_time")?,
            create_time_text: field("create_time_text")?,
            status: field("status")?,
            deleted: field("deleted")?,
            join_type: field("join_type")?,
            schema,
        })
    }
}

/// Build the circle schema.
pub fn build_circle_schema() -> CircleSchema {
    let mut schema_builder = Schema::builder();

    let circle_id = schema_builder.add_i64_field("circle_id", INDEXED | STORED | FAST);

    let name = schema_builder.add_text_field("name", TEXT | STORED);
    let name_keyword = schema_builder.add_text_field("name_keyword", STRING | FAST);
    let description = schema_builder.add_text_field("description", TEXT | STORED);
    let avatar_url = schema_builder.add_text_field("avatar_url", STRING | STORED);

    // Sort chain
    let hot = schema_builder.add_i64_field("hot", INDEXED | STORED | FAST);
    let member_count = schema_builder.add_i64_field("member_count", INDEXED | STORED | FAST);
    let post_count = schema_builder.add_i64_field("post_count", INDEXED | STORED | FAST);
    let create_time = schema_builder.add_i64_field("create_time", INDEXED | STORED | FAST);
    let create_time_text = schema_builder.add_text_field("create_time_text", STORED);

    // Filters
    let category_id = schema_builder.add_i64_field("category_id", INDEXED | STORED | FAST);
    let status = schema_builder.add_i64_field("status", INDEXED | STORED | FAST);
    let deleted = schema_builder.add_i64_field("deleted", INDEXED | STORED | FAST);
    let join_type = schema_builder.add_i64_field("join_type", INDEXED | STORED | FAST);

    let schema = schema_builder.build();

    CircleSchema {
        schema,
        circle_id,
        name,
        name_keyword,
        description,
        avatar_url,
        hot,
        category_id,
        member_count,
        post_count,
        create_time,
        create_time_text,
        status,
        deleted,
        join_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tantivy::schema::FieldType;

    #[test]
    fn test_build_schema() {
        let schema = build_circle_schema();
        for name in ["circle_id", "name", "name_keyword", "description", "create_time_text"] {
            assert!(schema.schema().get_field(name).is_ok(), "missing {}", name);
        }
    }

    #[test]
    fn test_sort_fields_are_fast_i64() {
        let schema = build_circle_schema();
        for field in [schema.hot, schema.member_count, schema.post_count, schema.create_time] {
            let entry = schema.schema().get_field_entry(field);
            assert!(matches!(entry.field_type(), FieldType::I64(_)));
            assert!(entry.is_fast());
        }
    }

    #[test]
    fn test_from_schema() {
        let original = build_circle_schema();
        let rebuilt = CircleSchema::from_schema(original.schema().clone()).unwrap();
        assert_eq!(rebuilt.circle_id, original.circle_id);
        assert_eq!(rebuilt.name, original.name);
        assert_eq!(rebuilt.join_type, original.join_type);
    }

    #[test]
    fn test_from_schema_missing_field() {
        let mut builder = Schema::builder();
        builder.add_i64_field("circle_id", INDEXED | STORED);
        let result = CircleSchema::from_schema(builder.build());
        assert!(matches!(result, Err(SearchError::SchemaMismatch(_))));
    }
}
