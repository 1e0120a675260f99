//! Write path: commit to the primary store, then publish a sync message.
//!
//! The store is the source of truth. Its result is returned unchanged
//! whatever happens to the publish; a lost message only leaves the index
//! stale until the next write to the same circle.

use async_trait::async_trait;
use tracing::{info, warn};

use circle_types::{CircleError, CircleSnapshot, JoinType, SyncAction, SyncMessage};

use crate::error::SyncError;
use crate::publisher::SyncPublisher;

/// User-supplied fields of a circle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircleDraft {
    pub name: String,
    pub avatar_url: String,
    pub description: String,
    pub category_id: i64,
    pub join_type: JoinType,
}

impl CircleDraft {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar_url: String::new(),
            description: description.into(),
            category_id: 0,
            join_type: JoinType::Open,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = avatar_url.into();
        self
    }

    pub fn with_category(mut self, category_id: i64) -> Self {
        self.category_id = category_id;
        self
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    /// Trim free-text fields and reject an empty name.
    fn normalized(&self) -> Result<Self, SyncError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CircleError::InvalidInput("circle name must not be empty".to_string()).into());
        }
        Ok(Self {
            name: name.to_string(),
            description: self.description.trim().to_string(),
            ..self.clone()
        })
    }
}

/// Relational store boundary. Every call returns the committed row.
#[async_trait]
pub trait CircleStore: Send + Sync {
    async fn create(&self, draft: &CircleDraft) -> Result<CircleSnapshot, SyncError>;

    async fn update(&self, circle_id: i64, draft: &CircleDraft)
        -> Result<CircleSnapshot, SyncError>;

    /// Mark the circle deleted and return the row as it now stands.
    async fn soft_delete(&self, circle_id: i64) -> Result<CircleSnapshot, SyncError>;
}

/// Circle writes with index sync.
pub struct CircleSyncService<S> {
    store: S,
    publisher: SyncPublisher,
}

impl<S: CircleStore> CircleSyncService<S> {
    pub fn new(store: S, publisher: SyncPublisher) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn create(&self, draft: &CircleDraft) -> Result<CircleSnapshot, SyncError> {
        let snapshot = self.store.create(&draft.normalized()?).await?;
        info!(circle_id = snapshot.circle_id, "Created circle");
        self.sync(SyncAction::Create, &snapshot).await;
        Ok(snapshot)
    }

    pub async fn update(
        &self,
        circle_id: i64,
        draft: &CircleDraft,
    ) -> Result<CircleSnapshot, SyncError> {
        let snapshot = self.store.update(circle_id, &draft.normalized()?).await?;
        info!(circle_id, "Updated circle");
        self.sync(SyncAction::Update, &snapshot).await;
        Ok(snapshot)
    }

    pub async fn soft_delete(&self, circle_id: i64) -> Result<CircleSnapshot, SyncError> {
        let snapshot = self.store.soft_delete(circle_id).await?;
        info!(circle_id, "Deleted circle");
        self.sync(SyncAction::Delete, &snapshot).await;
        Ok(snapshot)
    }

    async fn sync(&self, action: SyncAction, snapshot: &CircleSnapshot) {
        let message = SyncMessage::from_snapshot(action, snapshot);
        let outcome = self.publisher.publish(&message).await;
        if !outcome.is_published() {
            warn!(
                circle_id = snapshot.circle_id,
                action = %action,
                outcome = ?outcome,
                "Search index will be stale for this circle until its next write"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryCircleStore};
    use std::sync::Arc;

    fn service() -> (CircleSyncService<MemoryCircleStore>, MemoryBroker) {
        let broker = MemoryBroker::new();
        let publisher = SyncPublisher::new(Arc::new(broker.clone()));
        (
            CircleSyncService::new(MemoryCircleStore::new(), publisher),
            broker,
        )
    }

    fn published(broker: &MemoryBroker) -> Vec<SyncMessage> {
        broker
            .queued()
            .iter()
            .map(|payload| SyncMessage::from_bytes(payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_create_publishes_snapshot() {
        let (service, broker) = service();
        let draft = CircleDraft::new("  Hiking  ", " Trails every weekend ")
            .with_category(4)
            .with_join_type(JoinType::Approval);

        let snapshot = service.create(&draft).await.unwrap();
        assert_eq!(snapshot.name, "Hiking");
        assert_eq!(snapshot.member_count, 1);

        let messages = published(&broker);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].action, SyncAction::Create);
        assert_eq!(messages[0].circle_id, snapshot.circle_id);
        assert_eq!(messages[0].description, "Trails every weekend");
        assert_eq!(messages[0].join_type, 1);
    }

    #[tokio::test]
    async fn test_write_succeeds_when_publish_fails() {
        let (service, broker) = service();
        broker.fail_sends(true);

        let snapshot = service
            .create(&CircleDraft::new("Pottery", "Clay and kilns"))
            .await
            .unwrap();

        assert!(service.store().get(snapshot.circle_id).is_some());
        assert!(broker.queued().is_empty());
    }

    #[tokio::test]
    async fn test_soft_delete_publishes_delete() {
        let (service, broker) = service();
        let snapshot = service
            .create(&CircleDraft::new("Cycling", "Road and gravel"))
            .await
            .unwrap();

        let deleted = service.soft_delete(snapshot.circle_id).await.unwrap();
        assert!(deleted.deleted);

        let messages = published(&broker);
        assert_eq!(messages[1].action, SyncAction::Delete);
        assert_eq!(messages[1].deleted, 1);
    }

    #[tokio::test]
    async fn test_update_publishes_update() {
        let (service, broker) = service();
        let snapshot = service
            .create(&CircleDraft::new("Jazz", "Standards"))
            .await
            .unwrap();

        service
            .update(snapshot.circle_id, &CircleDraft::new("Jazz Club", "Standards and bebop"))
            .await
            .unwrap();

        let messages = published(&broker);
        assert_eq!(messages[1].action, SyncAction::Update);
        assert_eq!(messages[1].name, "Jazz Club");
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let (service, broker) = service();

        assert!(service.create(&CircleDraft::new("   ", "blank")).await.is_err());
        assert!(service.soft_delete(99).await.is_err());
        assert!(broker.queued().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_store_write_publishes_nothing() {
        let (service, broker) = service();
        let snapshot = service
            .create(&CircleDraft::new("Choir", "Tuesday rehearsals"))
            .await
            .unwrap();
        service.store().fail_writes(true);

        assert!(matches!(
            service
                .update(snapshot.circle_id, &CircleDraft::new("Choir", "Moved to Thursday"))
                .await,
            Err(SyncError::Store(_))
        ));
        assert!(service.soft_delete(snapshot.circle_id).await.is_err());

        assert_eq!(published(&broker).len(), 1);
        assert_eq!(
            service.store().get(snapshot.circle_id).unwrap().description,
            "Tuesday rehearsals"
        );
    }
}
