//! In-process broker and store.
//!
//! `MemoryBroker` follows the queue semantics the consumer relies on:
//! FIFO delivery, requeue to the head with the redelivered flag set,
//! a separate dead-letter list, and a stream that ends once the broker is
//! closed and drained. Failure switches let tests exercise the error
//! paths. `MemoryCircleStore` stands in for the relational store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DurationRound, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use circle_types::{CircleSnapshot, CircleStatus};

use crate::delivery::{Delivery, DeliveryStream, Subscriber};
use crate::error::SyncError;
use crate::publisher::MessageSink;
use crate::service::{CircleDraft, CircleStore};

struct QueuedMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<QueuedMessage>,
    acked: Vec<Vec<u8>>,
    dead_letters: Vec<Vec<u8>>,
    requeues: usize,
    closed: bool,
    fail_sends: bool,
    stall_sends: bool,
    fail_dead_letters: bool,
    subscribe_failures: u32,
    subscribe_attempts: Vec<Instant>,
}

/// Single-queue broker shared by clones.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a raw payload on the queue, bypassing the publisher.
    pub fn enqueue(&self, payload: impl Into<Vec<u8>>) {
        self.state().ready.push_back(QueuedMessage {
            payload: payload.into(),
            redelivered: false,
        });
        self.notify.notify_waiters();
    }

    /// Reject every publish.
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Never complete a publish.
    pub fn stall_sends(&self, stall: bool) {
        self.state().stall_sends = stall;
    }

    /// Reject dead-letter publishes.
    pub fn fail_dead_letters(&self, fail: bool) {
        self.state().fail_dead_letters = fail;
    }

    /// Refuse the next `count` subscriptions.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.state().subscribe_failures = count;
    }

    /// End open streams once the queue is drained.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    /// Payloads waiting to be delivered.
    pub fn queued(&self) -> Vec<Vec<u8>> {
        self.state()
            .ready
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state().dead_letters.clone()
    }

    pub fn requeue_count(&self) -> usize {
        self.state().requeues
    }

    /// When each subscription attempt happened.
    pub fn subscribe_attempts(&self) -> Vec<Instant> {
        self.state().subscribe_attempts.clone()
    }
}

#[async_trait]
impl MessageSink for MemoryBroker {
    async fn send(&self, payload: &[u8]) -> Result<(), SyncError> {
        let (fail, stall) = {
            let state = self.state();
            (state.fail_sends, state.stall_sends)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(SyncError::Unavailable("memory broker rejected publish".to_string()));
        }
        self.enqueue(payload);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(&self) -> Result<Box<dyn DeliveryStream>, SyncError> {
        let mut state = self.state();
        state.subscribe_attempts.push(Instant::now());
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(SyncError::Unavailable("memory broker refused subscription".to_string()));
        }
        Ok(Box::new(MemoryStream {
            broker: self.clone(),
        }))
    }
}

struct MemoryStream {
    broker: MemoryBroker,
}

#[async_trait]
impl DeliveryStream for MemoryStream {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, SyncError>> {
        loop {
            // Registered before checking so a concurrent enqueue is not missed
            let notified = self.broker.notify.notified();
            {
                let mut state = self.broker.state();
                if let Some(message) = state.ready.pop_front() {
                    return Some(Ok(Box::new(MemoryDelivery {
                        payload: message.payload,
                        redelivered: message.redelivered,
                        broker: self.broker.clone(),
                    })));
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    redelivered: bool,
    broker: MemoryBroker,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<(), SyncError> {
        self.broker.state().acked.push(self.payload.clone());
        Ok(())
    }

    async fn requeue(&self) -> Result<(), SyncError> {
        {
            let mut state = self.broker.state();
            state.requeues += 1;
            state.ready.push_front(QueuedMessage {
                payload: self.payload.clone(),
                redelivered: true,
            });
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self) -> Result<(), SyncError> {
        let mut state = self.broker.state();
        if state.fail_dead_letters {
            return Err(SyncError::Unavailable("dead-letter publish rejected".to_string()));
        }
        state.dead_letters.push(self.payload.clone());
        state.acked.push(self.payload.clone());
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<i64, CircleSnapshot>,
    next_id: i64,
    fail_writes: bool,
}

/// Circle table kept in memory.
#[derive(Clone, Default)]
pub struct MemoryCircleStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryCircleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Committed row, including soft-deleted ones.
    pub fn get(&self, circle_id: i64) -> Option<CircleSnapshot> {
        self.state().rows.get(&circle_id).cloned()
    }

    /// Adjust the activity counters of a stored circle, as the post and
    /// membership paths would.
    pub fn set_counts(&self, circle_id: i64, hot: i64, member_count: i64, post_count: i64) {
        if let Some(row) = self.state().rows.get_mut(&circle_id) {
            row.hot = hot;
            row.member_count = member_count;
            row.post_count = post_count;
        }
    }
}

fn store_error(message: &str) -> SyncError {
    SyncError::Store(message.to_string())
}

#[async_trait]
impl CircleStore for MemoryCircleStore {
    async fn create(&self, draft: &CircleDraft) -> Result<CircleSnapshot, SyncError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(store_error("write rejected"));
        }
        if state
            .rows
            .values()
            .any(|row| !row.deleted && row.name == draft.name)
        {
            return Err(SyncError::Store(format!(
                "circle name already exists: {}",
                draft.name
            )));
        }

        state.next_id += 1;
        let created = Utc::now()
            .duration_trunc(TimeDelta::seconds(1))
            .unwrap_or_else(|_| Utc::now());
        let snapshot = CircleSnapshot::new(state.next_id, &draft.name, &draft.description, created)
            .with_avatar(&draft.avatar_url)
            .with_category(draft.category_id)
            .with_join_type(draft.join_type)
            .with_status(CircleStatus::Normal);

        state.rows.insert(snapshot.circle_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn update(&self, circle_id: i64, draft: &CircleDraft) -> Result<CircleSnapshot, SyncError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(store_error("write rejected"));
        }
        let row = state
            .rows
            .get_mut(&circle_id)
            .filter(|row| !row.deleted)
            .ok_or_else(|| SyncError::Store(format!("circle {} not found", circle_id)))?;

        row.name = draft.name.clone();
        row.avatar_url = draft.avatar_url.clone();
        row.description = draft.description.clone();
        row.category_id = draft.category_id;
        row.join_type = draft.join_type;
        Ok(row.clone())
    }

    async fn soft_delete(&self, circle_id: i64) -> Result<CircleSnapshot, SyncError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(store_error("write rejected"));
        }
        let row = state
            .rows
            .get_mut(&circle_id)
            .ok_or_else(|| SyncError::Store(format!("circle {} not found", circle_id)))?;

        row.deleted = true;
        Ok(row.clone())
    }
}
