//! Broker-driven sync of circle writes into the search index.
//!
//! ## Key Components
//!
//! - [`CircleSyncService`]: commits a write to the store, then publishes
//! - [`SyncPublisher`]: serializes a [`circle_types::SyncMessage`] and hands it to a [`MessageSink`]
//! - [`SyncConsumer`]: applies deliveries to an [`IndexApplier`], acking only after commit
//! - [`ConsumerSupervisor`]: subscribes with [`LinearBackoff`] and runs the consumer
//! - [`BrokerConnection`]: AMQP connection with the declared [`BrokerTopology`]
//! - [`MemoryBroker`] / [`MemoryCircleStore`]: in-process stand-ins used by tests
//!
//! ## Flow
//!
//! 1. The store commits a circle write
//! 2. The service publishes a persistent message to the durable queue
//! 3. The consumer takes one delivery at a time (prefetch 1)
//! 4. Upsert or delete, then commit the index
//! 5. Ack on success; requeue a failed index write after a pause; requeue a
//!    rejected payload until the redelivery cap, then dead-letter it

pub mod applier;
pub mod broker;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod service;
pub mod supervisor;

pub use applier::{ConsumerStats, IndexApplier};
pub use broker::{BrokerConnection, BrokerTopology};
pub use consumer::{Disposition, RedeliveryTracker, SyncConsumer, INDEX_RETRY_DELAY};
pub use delivery::{AmqpSubscriber, Delivery, DeliveryStream, Subscriber};
pub use error::SyncError;
pub use memory::{MemoryBroker, MemoryCircleStore};
pub use publisher::{AmqpSink, MessageSink, PublishOutcome, SyncPublisher, DEFAULT_PUBLISH_TIMEOUT};
pub use service::{CircleDraft, CircleStore, CircleSyncService};
pub use supervisor::{ConsumerSupervisor, LinearBackoff, SupervisorState};
