//! Publishing sync messages after a committed write.
//!
//! Publishing is fire-and-forget from the caller's point of view: the
//! primary write has already succeeded, so every failure here is logged
//! and reported as a `PublishOutcome`, never as an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use tracing::{debug, error};

use circle_types::SyncMessage;

use crate::broker::BrokerTopology;
use crate::error::SyncError;

/// Default bound on a single publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Broker boundary for outgoing payloads.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hand one payload to the broker.
    async fn send(&self, payload: &[u8]) -> Result<(), SyncError>;
}

/// Publishes to one exchange/routing key over a shared lapin channel.
#[derive(Clone)]
pub struct AmqpSink {
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl AmqpSink {
    pub fn new(
        channel: Channel,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Sink for the sync queue.
    pub fn for_sync_queue(channel: Channel, topology: &BrokerTopology) -> Self {
        Self::new(channel, &topology.exchange, &topology.routing_key)
    }

    /// Sink for the dead-letter queue.
    pub fn for_dead_letters(channel: Channel, topology: &BrokerTopology) -> Self {
        Self::new(channel, &topology.exchange, &topology.dead_letter_routing_key)
    }
}

/// A publish counts only once the broker has acked it. Channels opened
/// by [`crate::BrokerConnection`] are in confirm mode.
fn check_confirmation(confirmation: Confirmation) -> Result<(), SyncError> {
    match confirmation {
        Confirmation::Nack(_) => Err(SyncError::Nacked),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

#[async_trait]
impl MessageSink for AmqpSink {
    async fn send(&self, payload: &[u8]) -> Result<(), SyncError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        check_confirmation(confirmation)?;

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            bytes = payload.len(),
            "Published payload"
        );
        Ok(())
    }
}

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Serialization or broker failure
    Failed,
    /// The sink did not finish within the publish timeout
    TimedOut,
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published)
    }
}

/// Turns committed circle snapshots into broker messages.
#[derive(Clone)]
pub struct SyncPublisher {
    sink: Arc<dyn MessageSink>,
    timeout: Duration,
}

impl SyncPublisher {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish one message. Never fails; the outcome says what happened.
    pub async fn publish(&self, message: &SyncMessage) -> PublishOutcome {
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    circle_id = message.circle_id,
                    action = %message.action,
                    error = %e,
                    "Failed to serialize circle sync message"
                );
                return PublishOutcome::Failed;
            }
        };

        match tokio::time::timeout(self.timeout, self.sink.send(&payload)).await {
            Ok(Ok(())) => {
                debug!(
                    circle_id = message.circle_id,
                    action = %message.action,
                    "Published circle sync message"
                );
                PublishOutcome::Published
            }
            Ok(Err(e)) => {
                error!(
                    circle_id = message.circle_id,
                    action = %message.action,
                    error = %e,
                    "Failed to publish circle sync message"
                );
                PublishOutcome::Failed
            }
            Err(_) => {
                error!(
                    circle_id = message.circle_id,
                    action = %message.action,
                    error = %SyncError::Timeout(self.timeout),
                    "Failed to publish circle sync message"
                );
                PublishOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use chrono::{TimeZone, Utc};
    use circle_types::{CircleSnapshot, SyncAction};

    fn sample_message() -> SyncMessage {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let snapshot = CircleSnapshot::new(12, "Film Club", "Weekly screenings", created);
        SyncMessage::from_snapshot(SyncAction::Create, &snapshot)
    }

    #[test]
    fn test_nacked_publish_is_an_error() {
        assert!(matches!(
            check_confirmation(Confirmation::Nack(None)),
            Err(SyncError::Nacked)
        ));
        assert!(check_confirmation(Confirmation::Ack(None)).is_ok());
    }

    #[tokio::test]
    async fn test_publish_delivers_wire_payload() {
        let broker = MemoryBroker::new();
        let publisher = SyncPublisher::new(Arc::new(broker.clone()));

        let outcome = publisher.publish(&sample_message()).await;
        assert_eq!(outcome, PublishOutcome::Published);

        let queued = broker.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(SyncMessage::from_bytes(&queued[0]).unwrap(), sample_message());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_not_raised() {
        let broker = MemoryBroker::new();
        broker.fail_sends(true);
        let publisher = SyncPublisher::new(Arc::new(broker.clone()));

        let outcome = publisher.publish(&sample_message()).await;
        assert_eq!(outcome, PublishOutcome::Failed);
        assert!(broker.queued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_times_out() {
        let broker = MemoryBroker::new();
        broker.stall_sends(true);
        let publisher =
            SyncPublisher::new(Arc::new(broker.clone())).with_timeout(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let outcome = publisher.publish(&sample_message()).await;

        assert_eq!(outcome, PublishOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_each_publish_is_a_separate_message() {
        let broker = MemoryBroker::new();
        let publisher = SyncPublisher::new(Arc::new(broker.clone()));

        publisher.publish(&sample_message()).await;
        publisher.publish(&sample_message()).await;

        assert_eq!(broker.queued().len(), 2);
    }
}
