//! Error types for the sync pipeline.

use std::time::Duration;

use circle_search::SearchError;
use circle_types::CircleError;
use thiserror::Error;

/// Errors that can occur while publishing, consuming or applying sync
/// messages.
#[derive(Error, Debug)]
pub enum SyncError {
    /// AMQP protocol or connection failure
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// Broker is not reachable or refused the subscription
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused to take responsibility for a published message
    #[error("Broker nacked the published message")]
    Nacked,

    /// Publish did not complete in time
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message failed validation
    #[error("Invalid message: {0}")]
    Message(#[from] CircleError),

    /// Search index error
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    /// Primary store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
