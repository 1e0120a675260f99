//! Inbound side of the broker boundary.
//!
//! The consumer only sees these traits; the AMQP implementations below
//! and the in-memory broker in [`crate::memory`] plug in behind them.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use tokio::sync::Mutex;
use tracing::{info, warn};

use circle_types::BrokerSettings;

use crate::broker::BrokerConnection;
use crate::error::SyncError;
use crate::publisher::{AmqpSink, MessageSink};

/// Unacknowledged deliveries per consumer. One keeps application strictly
/// sequential.
const PREFETCH: u16 = 1;

/// One received message that must be settled exactly once.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool;

    async fn ack(&self) -> Result<(), SyncError>;

    /// Negative-acknowledge and put the message back on the queue.
    async fn requeue(&self) -> Result<(), SyncError>;

    /// Republish the payload to the dead-letter queue, then ack the
    /// original. On error the original is left unsettled.
    async fn dead_letter(&self) -> Result<(), SyncError>;
}

/// Ordered deliveries from one subscription.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or None once the subscription has ended.
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, SyncError>>;
}

/// Opens a subscription to the sync queue.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn DeliveryStream>, SyncError>;
}

/// A delivery received over AMQP.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
    dead_letters: AmqpSink,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(&self) -> Result<(), SyncError> {
        self.inner.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn requeue(&self) -> Result<(), SyncError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }

    async fn dead_letter(&self) -> Result<(), SyncError> {
        self.dead_letters.send(&self.inner.data).await?;
        self.ack().await
    }
}

/// Deliveries from a lapin consumer.
pub struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
    dead_letters: AmqpSink,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, SyncError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|inner| {
                Box::new(AmqpDelivery {
                    inner,
                    dead_letters: self.dead_letters.clone(),
                }) as Box<dyn Delivery>
            })
            .map_err(SyncError::from),
        )
    }
}

/// Subscribes to the sync queue over a fresh broker connection per
/// attempt and keeps the live connection for shutdown.
pub struct AmqpSubscriber {
    settings: BrokerSettings,
    connection: Mutex<Option<BrokerConnection>>,
}

impl AmqpSubscriber {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            connection: Mutex::new(None),
        }
    }

    /// Close the connection held for the current subscription, if any.
    pub async fn close(&self) -> Result<(), SyncError> {
        match self.connection.lock().await.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    async fn start_consuming(
        broker: &BrokerConnection,
    ) -> Result<AmqpDeliveryStream, SyncError> {
        let channel = broker.channel();
        let topology = broker.topology();

        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;

        // Empty tag lets the broker assign one; acks are manual
        let consumer = channel
            .basic_consume(
                &topology.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %topology.queue,
            consumer_tag = %consumer.tag(),
            "Consuming circle sync messages"
        );

        Ok(AmqpDeliveryStream {
            consumer,
            dead_letters: AmqpSink::for_dead_letters(channel, topology),
        })
    }
}

#[async_trait]
impl Subscriber for AmqpSubscriber {
    async fn subscribe(&self) -> Result<Box<dyn DeliveryStream>, SyncError> {
        // A previous subscription that ended still owns its connection
        if let Err(e) = self.close().await {
            warn!(error = %e, "Failed to close previous broker connection");
        }

        let broker = BrokerConnection::open(&self.settings).await?;
        match Self::start_consuming(&broker).await {
            Ok(stream) => {
                *self.connection.lock().await = Some(broker);
                Ok(Box::new(stream))
            }
            Err(e) => {
                if let Err(close_err) = broker.close().await {
                    warn!(error = %close_err, "Failed to close broker after subscribe error");
                }
                Err(e)
            }
        }
    }
}
