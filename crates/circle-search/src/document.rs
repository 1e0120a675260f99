//! Mapping between sync messages, circle documents and Tantivy documents.

use serde::{Deserialize, Serialize};
use tantivy::doc;
use tantivy::schema::Value;
use tantivy::TantivyDocument;

use circle_types::SyncMessage;

use crate::error::SearchError;
use crate::schema::CircleSchema;

/// Searchable representation of a circle, keyed by the circle id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleDocument {
    pub circle_id: i64,
    pub name: String,
    pub avatar_url: String,
    pub description: String,
    pub hot: i64,
    pub category_id: i64,
    pub member_count: i64,
    pub post_count: i64,
    /// ISO-8601 creation time as received
    pub create_time: String,
    /// Creation time in epoch milliseconds, used for sorting
    #[serde(skip)]
    pub create_time_ms: i64,
    pub status: i16,
    pub deleted: i16,
    pub join_type: i16,
}

impl CircleDocument {
    /// Build a document from the snapshot carried by a sync message.
    pub fn from_message(message: &SyncMessage) -> Result<Self, SearchError> {
        let create_time_ms = message.create_time_millis()?;

        Ok(Self {
            circle_id: message.circle_id,
            name: message.name.clone(),
            avatar_url: message.avatar_url.clone(),
            description: message.description.clone(),
            hot: message.hot,
            category_id: message.category_id,
            member_count: message.member_count,
            post_count: message.post_count,
            create_time: message.create_time.clone(),
            create_time_ms,
            status: message.status,
            deleted: message.deleted,
            join_type: message.join_type,
        })
    }

    /// Convert to a Tantivy document.
    pub fn to_tantivy(&self, schema: &CircleSchema) -> TantivyDocument {
        doc!(
            schema.circle_id => self.circle_id,
            schema.name => self.name.clone(),
            schema.name_keyword => self.name.clone(),
            schema.description => self.description.clone(),
            schema.avatar_url => self.avatar_url.clone(),
            schema.hot => self.hot,
            schema.category_id => self.category_id,
            schema.member_count => self.member_count,
            schema.post_count => self.post_count,
            schema.create_time => self.create_time_ms,
            schema.create_time_text => self.create_time.clone(),
            schema.status => i64::from(self.status),
            schema.deleted => i64::from(self.deleted),
            schema.join_type => i64::from(self.join_type)
        )
    }

    /// Decode a stored hit.
    ///
    /// The id and name are required; a hit without them means the index
    /// holds a document this code did not write. Other fields fall back
    /// to their zero values.
    pub fn from_tantivy(schema: &CircleSchema, doc: &TantivyDocument) -> Result<Self, SearchError> {
        let int = |field| doc.get_first(field).and_then(|v| v.as_i64());
        let text = |field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let small = |field, name: &str| -> Result<i16, SearchError> {
            let value = int(field).unwrap_or_default();
            i16::try_from(value)
                .map_err(|_| SearchError::Decode(format!("{} out of range: {}", name, value)))
        };

        let circle_id = int(schema.circle_id)
            .ok_or_else(|| SearchError::Decode("hit without circle_id".to_string()))?;
        let name = text(schema.name)
            .ok_or_else(|| SearchError::Decode(format!("circle {} has no stored name", circle_id)))?;

        Ok(Self {
            circle_id,
            name,
            avatar_url: text(schema.avatar_url).unwrap_or_default(),
            description: text(schema.description).unwrap_or_default(),
            hot: int(schema.hot).unwrap_or_default(),
            category_id: int(schema.category_id).unwrap_or_default(),
            member_count: int(schema.member_count).unwrap_or_default(),
            post_count: int(schema.post_count).unwrap_or_default(),
            create_time: text(schema.create_time_text).unwrap_or_default(),
            create_time_ms: int(schema.create_time).unwrap_or_default(),
            status: small(schema.status, "status")?,
            deleted: small(schema.deleted, "deleted")?,
            join_type: small(schema.join_type, "join_type")?,
        })
    }
}
