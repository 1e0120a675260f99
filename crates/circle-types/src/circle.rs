//! Circle entity snapshot and its small-integer enumerations.
//!
//! A `CircleSnapshot` is what the relational store hands back after a
//! committed write. It carries the generated id and creation time and is
//! the only input the publisher needs to build a sync message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Moderation status of a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleStatus {
    /// Awaiting review
    Pending,
    /// Visible and usable
    #[default]
    Normal,
    /// Frozen by moderators
    Banned,
}

impl CircleStatus {
    pub fn code(&self) -> i16 {
        match self {
            CircleStatus::Pending => 0,
            CircleStatus::Normal => 1,
            CircleStatus::Banned => 2,
        }
    }
}

/// How new members get into a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Anyone can join directly
    #[default]
    Open,
    /// Join requests need approval
    Approval,
    /// Invitation only; never listed in public search
    Private,
}

impl JoinType {
    pub fn code(&self) -> i16 {
        match self {
            JoinType::Open => 0,
            JoinType::Approval => 1,
            JoinType::Private => 2,
        }
    }
}

/// Soft-delete flag codes.
pub const NOT_DELETED: i16 = 0;
pub const SOFT_DELETED: i16 = 1;

/// Committed circle row as returned by the store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleSnapshot {
    pub circle_id: i64,
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
    pub description: String,
    #[serde(default)]
    pub hot: i64,
    #[serde(default)]
    pub category_id: i64,
    #[serde(default)]
    pub member_count: i64,
    #[serde(default)]
    pub post_count: i64,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub status: CircleStatus,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub join_type: JoinType,
}

impl CircleSnapshot {
    /// Snapshot of a freshly created circle: one member (the creator),
    /// no posts, zero heat, normal status.
    pub fn new(
        circle_id: i64,
        name: impl Into<String>,
        description: impl Into<String>,
        create_time: DateTime<Utc>,
    ) -> Self {
        Self {
            circle_id,
            name: name.into(),
            avatar_url: String::new(),
            description: description.into(),
            hot: 0,
            category_id: 0,
            member_count: 1,
            post_count: 0,
            create_time,
            status: CircleStatus::Normal,
            deleted: false,
            join_type: JoinType::Open,
        }
    }

    pub fn with_category(mut self, category_id: i64) -> Self {
        self.category_id = category_id;
        self
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = avatar_url.into();
        self
    }

    pub fn with_counts(mut self, hot: i64, member_count: i64, post_count: i64) -> Self {
        self.hot = hot;
        self.member_count = member_count;
        self.post_count = post_count;
        self
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn with_status(mut self, status: CircleStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_codes() {
        assert_eq!(CircleStatus::Pending.code(), 0);
        assert_eq!(CircleStatus::Normal.code(), 1);
        assert_eq!(CircleStatus::Banned.code(), 2);
        assert_eq!(JoinType::Approval.code(), 1);
        assert_eq!(JoinType::Private.code(), 2);
    }

    #[test]
    fn test_new_snapshot_defaults() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let snapshot = CircleSnapshot::new(42, "Rustaceans", "All things Rust", created);

        assert_eq!(snapshot.member_count, 1);
        assert_eq!(snapshot.post_count, 0);
        assert_eq!(snapshot.status, CircleStatus::Normal);
        assert_eq!(snapshot.join_type, JoinType::Open);
        assert!(!snapshot.deleted);
    }

    #[test]
    fn test_builders() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let snapshot = CircleSnapshot::new(7, "Secret club", "Invite only", created)
            .with_join_type(JoinType::Private)
            .with_status(CircleStatus::Banned);
        assert_eq!(snapshot.join_type, JoinType::Private);
        assert_eq!(snapshot.status, CircleStatus::Banned);
    }
}
