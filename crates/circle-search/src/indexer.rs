//! Write side of the circle index.
//!
//! Changes stay invisible to searchers until `commit`. A failed apply must
//! `rollback` before the next commit, or its half-done work would be made
//! durable along with the next message.

use std::sync::{Mutex, MutexGuard};

use tantivy::{IndexWriter, Term};
use tracing::{debug, info, warn};

use crate::document::CircleDocument;
use crate::error::SearchError;
use crate::index::CircleIndex;
use crate::schema::CircleSchema;

/// Owns the single writer of a circle index.
///
/// Every write is keyed by circle id, so replaying the same upsert or
/// delete any number of times leaves the index in the same state.
pub struct CircleIndexer {
    writer: Mutex<IndexWriter>,
    schema: CircleSchema,
}

impl CircleIndexer {
    pub fn new(index: &CircleIndex) -> Result<Self, SearchError> {
        Ok(Self {
            writer: Mutex::new(index.writer()?),
            schema: index.schema().clone(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexWriter>, SearchError> {
        self.writer
            .lock()
            .map_err(|e| SearchError::IndexLocked(e.to_string()))
    }

    fn id_term(&self, circle_id: i64) -> Term {
        Term::from_field_i64(self.schema.circle_id, circle_id)
    }

    /// Insert or fully replace the document for a circle.
    pub fn upsert(&self, doc: &CircleDocument) -> Result<(), SearchError> {
        let replacement = doc.to_tantivy(&self.schema);
        let writer = self.lock()?;
        writer.delete_term(self.id_term(doc.circle_id));
        writer.add_document(replacement)?;
        debug!(circle_id = doc.circle_id, "Staged circle upsert");
        Ok(())
    }

    /// Remove the document for a circle. Deleting an absent id succeeds.
    pub fn delete(&self, circle_id: i64) -> Result<(), SearchError> {
        self.lock()?.delete_term(self.id_term(circle_id));
        debug!(circle_id, "Staged circle delete");
        Ok(())
    }

    /// Make staged changes durable and visible to newly reloaded readers.
    pub fn commit(&self) -> Result<u64, SearchError> {
        let opstamp = self.lock()?.commit()?;
        info!(opstamp, "Committed circle index");
        Ok(opstamp)
    }

    /// Drop everything staged since the last commit.
    pub fn rollback(&self) -> Result<u64, SearchError> {
        let opstamp = self.lock()?.rollback()?;
        warn!(opstamp, "Rolled back staged circle changes");
        Ok(opstamp)
    }
}
