//! Search error types.

use thiserror::Error;

/// Errors that can occur during index or query operations.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Tantivy index error
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Sync message could not be turned into a document
    #[error("Invalid message: {0}")]
    Message(#[from] circle_types::CircleError),

    /// Schema mismatch
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Another writer holds the index, or the writer mutex was poisoned
    #[error("Index is locked: {0}")]
    IndexLocked(String),

    /// A stored hit could not be decoded into a circle document
    #[error("Decode error: {0}")]
    Decode(String),

    /// Pagination cursor is malformed or does not fit the sort order
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}
