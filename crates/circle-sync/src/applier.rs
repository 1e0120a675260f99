//! Index applier trait for message-driven index updates.
//!
//! The consumer applies every sync message through this trait, so the
//! dispatch logic can be tested without a Tantivy index.

use circle_search::{CircleDocument, CircleIndexer};

use crate::error::SyncError;

/// Write side of the search index as seen by the consumer.
///
/// Upsert and delete must be idempotent: the broker delivers at least
/// once, so the same message can be applied more than once.
pub trait IndexApplier: Send + Sync {
    /// Insert or fully replace the document with the same circle id.
    fn upsert(&self, doc: &CircleDocument) -> Result<(), SyncError>;

    /// Remove the document for a circle. Absence is not an error.
    fn delete(&self, circle_id: i64) -> Result<(), SyncError>;

    /// Make pending changes durable.
    fn commit(&self) -> Result<(), SyncError>;

    /// Discard pending changes after a failed apply.
    fn rollback(&self) -> Result<(), SyncError> {
        Ok(())
    }

    /// Get the name of this applier for logging.
    fn name(&self) -> &str;
}

impl IndexApplier for CircleIndexer {
    fn upsert(&self, doc: &CircleDocument) -> Result<(), SyncError> {
        CircleIndexer::upsert(self, doc)?;
        Ok(())
    }

    fn delete(&self, circle_id: i64) -> Result<(), SyncError> {
        CircleIndexer::delete(self, circle_id)?;
        Ok(())
    }

    fn commit(&self) -> Result<(), SyncError> {
        CircleIndexer::commit(self)?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), SyncError> {
        CircleIndexer::rollback(self)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "tantivy"
    }
}

/// Running totals of a consumer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages applied and acked
    pub applied: usize,
    /// Messages put back on the queue
    pub requeued: usize,
    /// Messages moved to the dead-letter queue
    pub dead_lettered: usize,
    /// Failed ack/nack/dead-letter calls to the broker
    pub broker_errors: usize,
}

impl ConsumerStats {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&mut self) {
        self.applied += 1;
    }

    pub fn record_requeued(&mut self) {
        self.requeued += 1;
    }

    pub fn record_dead_lettered(&mut self) {
        self.dead_lettered += 1;
    }

    pub fn record_broker_error(&mut self) {
        self.broker_errors += 1;
    }

    /// Total deliveries settled one way or another.
    pub fn total(&self) -> usize {
        self.applied + self.requeued + self.dead_lettered
    }
}
