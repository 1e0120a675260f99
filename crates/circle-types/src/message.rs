//! Sync message carried by the broker from the write path to the indexer.
//!
//! A message is a self-contained snapshot: the consumer never goes back to
//! the relational store to apply it.

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::circle::{CircleSnapshot, NOT_DELETED, SOFT_DELETED};
use crate::error::CircleError;

/// What the consumer should do with the index document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    /// Create and update both replace the whole document.
    pub fn is_upsert(&self) -> bool {
        matches!(self, SyncAction::Create | SyncAction::Update)
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncAction {
    type Err = CircleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(CircleError::InvalidInput(format!(
                "unknown sync action: {}",
                other
            ))),
        }
    }
}

/// Wire form of a circle mutation (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub action: SyncAction,
    pub circle_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar_url: String,
    pub description: String,
    pub hot: i64,
    pub category_id: i64,
    pub member_count: i64,
    pub post_count: i64,
    /// ISO-8601 creation time, second precision
    pub create_time: String,
    pub status: i16,
    pub deleted: i16,
    pub join_type: i16,
}

impl SyncMessage {
    /// Build a message from a committed snapshot.
    pub fn from_snapshot(action: SyncAction, snapshot: &CircleSnapshot) -> Self {
        Self {
            action,
            circle_id: snapshot.circle_id,
            name: snapshot.name.clone(),
            avatar_url: snapshot.avatar_url.clone(),
            description: snapshot.description.clone(),
            hot: snapshot.hot,
            category_id: snapshot.category_id,
            member_count: snapshot.member_count,
            post_count: snapshot.post_count,
            create_time: snapshot
                .create_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            status: snapshot.status.code(),
            deleted: if snapshot.deleted {
                SOFT_DELETED
            } else {
                NOT_DELETED
            },
            join_type: snapshot.join_type.code(),
        }
    }

    /// Parse the creation time into epoch milliseconds.
    pub fn create_time_millis(&self) -> Result<i64, CircleError> {
        DateTime::parse_from_rfc3339(&self.create_time)
            .map(|t| t.timestamp_millis())
            .map_err(|e| CircleError::InvalidTimestamp {
                value: self.create_time.clone(),
                reason: e.to_string(),
            })
    }

    /// Check the invariants the indexer relies on.
    ///
    /// Deletes only need a valid id; upserts need a name and a parseable
    /// creation time because both feed the sort order.
    pub fn validate(&self) -> Result<(), CircleError> {
        if self.circle_id <= 0 {
            return Err(CircleError::InvalidInput(format!(
                "circle_id must be positive, got {}",
                self.circle_id
            )));
        }
        if self.action.is_upsert() {
            if self.name.trim().is_empty() {
                return Err(CircleError::InvalidInput(format!(
                    "circle {} has an empty name",
                    self.circle_id
                )));
            }
            self.create_time_millis()?;
        }
        Ok(())
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, CircleError> {
        serde_json::to_vec(self).map_err(CircleError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CircleError> {
        serde_json::from_slice(bytes).map_err(CircleError::from)
    }
}
