//! Retry supervisor for the sync consumer.
//!
//! Subscribes with linear backoff, then hands the delivery stream to the
//! consumer. Giving up only degrades search indexing; the caller keeps
//! running.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::sync::watch;
use tracing::{error, info, warn};

use circle_types::RetrySettings;

use crate::applier::IndexApplier;
use crate::consumer::SyncConsumer;
use crate::delivery::Subscriber;

/// Waits `attempt * base` after the n-th failed attempt and gives up once
/// `max_attempts` attempts have failed.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    max_attempts: u32,
    failed: u32,
}

impl LinearBackoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            failed: 0,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.base_delay(), settings.max_attempts)
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.failed = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failed = self.failed.saturating_add(1);
        if self.failed >= self.max_attempts {
            return None;
        }
        Some(self.base * self.failed)
    }
}

/// Where the supervised consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    /// Subscribing; `attempt` counts from 1
    Connecting { attempt: u32 },
    Consuming,
    /// Retries exhausted, search indexing is degraded
    Failed,
    /// The delivery stream ended
    Stopped,
}

/// Owns a consumer and keeps it subscribed.
pub struct ConsumerSupervisor<A: IndexApplier + ?Sized> {
    subscriber: Arc<dyn Subscriber>,
    consumer: SyncConsumer<A>,
    backoff: LinearBackoff,
    state: watch::Sender<SupervisorState>,
}

impl<A: IndexApplier + ?Sized> ConsumerSupervisor<A> {
    pub fn new(
        subscriber: Arc<dyn Subscriber>,
        consumer: SyncConsumer<A>,
        backoff: LinearBackoff,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            subscriber,
            consumer,
            backoff,
            state,
        }
    }

    /// Watch state transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        self.state.send_replace(next);
    }

    /// Subscribe and consume until the stream ends or retries run out.
    /// Returns the terminal state.
    pub async fn run(mut self) -> SupervisorState {
        self.backoff.reset();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.transition(SupervisorState::Connecting { attempt });

            match self.subscriber.subscribe().await {
                Ok(mut stream) => {
                    self.transition(SupervisorState::Consuming);
                    info!(attempt, "Circle sync consumer subscribed");

                    let stats = self.consumer.run(stream.as_mut()).await;
                    info!(
                        applied = stats.applied,
                        requeued = stats.requeued,
                        dead_lettered = stats.dead_lettered,
                        broker_errors = stats.broker_errors,
                        "Circle sync consumer stopped"
                    );
                    self.transition(SupervisorState::Stopped);
                    return SupervisorState::Stopped;
                }
                Err(e) => match self.backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            attempt,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to start circle sync consumer, retrying"
                        );
                        self.transition(SupervisorState::Disconnected);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            attempts = attempt,
                            error = %e,
                            "Giving up on circle sync consumer, search indexing degraded"
                        );
                        self.transition(SupervisorState::Failed);
                        return SupervisorState::Failed;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::memory::MemoryBroker;
    use circle_search::CircleDocument;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingApplier {
        upserts: Mutex<usize>,
    }

    impl IndexApplier for CountingApplier {
        fn upsert(&self, _doc: &CircleDocument) -> Result<(), SyncError> {
            *self.upserts.lock().unwrap() += 1;
            Ok(())
        }

        fn delete(&self, _circle_id: i64) -> Result<(), SyncError> {
            Ok(())
        }

        fn commit(&self) -> Result<(), SyncError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn supervisor(broker: &MemoryBroker) -> ConsumerSupervisor<CountingApplier> {
        let consumer = SyncConsumer::new(Arc::new(CountingApplier::default()), 5);
        ConsumerSupervisor::new(
            Arc::new(broker.clone()),
            consumer,
            LinearBackoff::new(Duration::from_secs(5), 3),
        )
    }

    #[test]
    fn test_linear_backoff() {
        let mut backoff = LinearBackoff::new(Duration::from_secs(5), 3);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let mut backoff = LinearBackoff::new(Duration::from_secs(5), 1);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribes(10);

        let started = tokio::time::Instant::now();
        let supervisor = supervisor(&broker);
        let state = supervisor.state();

        assert_eq!(supervisor.run().await, SupervisorState::Failed);
        assert_eq!(*state.borrow(), SupervisorState::Failed);

        let offsets: Vec<u64> = broker
            .subscribe_attempts()
            .iter()
            .map(|at| at.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 5, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_and_stops_when_stream_ends() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribes(2);
        broker.enqueue(b"not json".to_vec());
        broker.close();

        let supervisor = supervisor(&broker);
        let state = supervisor.state();

        assert_eq!(supervisor.run().await, SupervisorState::Stopped);
        assert_eq!(*state.borrow(), SupervisorState::Stopped);
        assert_eq!(broker.subscribe_attempts().len(), 3);
        // garbage was requeued until the cap, then dead-lettered
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.requeue_count(), 4);
    }
}
