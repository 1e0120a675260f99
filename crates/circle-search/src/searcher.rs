//! Circle search with search-after pagination.
//!
//! Hits are collected top-k by `SortKey`; a cursor turns every hit at or
//! before it into a non-candidate, so each page costs O(page size)
//! regardless of how deep the caller has paged.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tantivy::collector::{Count, TopDocs};
use tantivy::columnar::Column;
use tantivy::{DocAddress, DocId, Index, IndexReader, Score, SegmentReader, TantivyDocument};
use tracing::{debug, info, warn};

use crate::document::CircleDocument;
use crate::error::SearchError;
use crate::index::CircleIndex;
use crate::query::{build_query, SearchRequest, SortKey};
use crate::schema::CircleSchema;

/// One page of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub circles: Vec<CircleDocument>,
    /// Resume cursor of each circle, in the same order
    pub cursors: Vec<String>,
    /// Matches for the filters and keyword, ignoring the cursor
    pub total: usize,
    /// Effective page size
    pub size: usize,
    /// Present only when the page is full
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Fast-field columns of the sort chain for one segment.
struct SortColumns {
    hot: Column<i64>,
    member_count: Column<i64>,
    post_count: Column<i64>,
    create_time: Column<i64>,
    circle_id: Column<i64>,
}

impl SortColumns {
    fn open(segment_reader: &SegmentReader) -> tantivy::Result<Self> {
        let fast = segment_reader.fast_fields();
        Ok(Self {
            hot: fast.i64("hot")?,
            member_count: fast.i64("member_count")?,
            post_count: fast.i64("post_count")?,
            create_time: fast.i64("create_time")?,
            circle_id: fast.i64("circle_id")?,
        })
    }

    fn key(&self, doc: DocId, score: Score) -> SortKey {
        SortKey {
            score,
            hot: self.hot.first(doc).unwrap_or_default(),
            member_count: self.member_count.first(doc).unwrap_or_default(),
            post_count: self.post_count.first(doc).unwrap_or_default(),
            create_time_ms: self.create_time.first(doc).unwrap_or_default(),
            circle_id: self.circle_id.first(doc).unwrap_or_default(),
        }
    }
}

/// Scores one hit, or None when it is not strictly after the cursor.
fn candidate(
    columns: &Option<SortColumns>,
    doc: DocId,
    score: Score,
    after: Option<SortKey>,
) -> Option<SortKey> {
    let key = columns.as_ref()?.key(doc, score);
    match after {
        Some(cursor) if key >= cursor => None,
        _ => Some(key),
    }
}

fn open_columns(segment_reader: &SegmentReader) -> Option<SortColumns> {
    match SortColumns::open(segment_reader) {
        Ok(columns) => Some(columns),
        Err(e) => {
            warn!(error = %e, "Segment is missing sort columns, skipping");
            None
        }
    }
}

/// Searcher over the circle index.
pub struct CircleSearcher {
    index: Index,
    reader: IndexReader,
    schema: CircleSchema,
    refresh_interval: Duration,
    last_reload: Mutex<Instant>,
}

impl CircleSearcher {
    /// Create a searcher that picks up new commits at most once per
    /// `refresh_interval` (zero reloads before every query).
    pub fn new(index: &CircleIndex, refresh_interval: Duration) -> Result<Self, SearchError> {
        Ok(Self {
            index: index.index().clone(),
            reader: index.reader()?,
            schema: index.schema().clone(),
            refresh_interval,
            last_reload: Mutex::new(Instant::now()),
        })
    }

    /// Reload the reader to see recent commits.
    pub fn reload(&self) -> Result<(), SearchError> {
        self.reader.reload()?;
        if let Ok(mut last) = self.last_reload.lock() {
            *last = Instant::now();
        }
        debug!("Reloaded search reader");
        Ok(())
    }

    fn refresh_if_stale(&self) -> Result<(), SearchError> {
        let mut last = self
            .last_reload
            .lock()
            .map_err(|e| SearchError::IndexLocked(e.to_string()))?;
        if last.elapsed() >= self.refresh_interval {
            self.reader.reload()?;
            *last = Instant::now();
        }
        Ok(())
    }

    /// Run one page of a search.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        let ranked = request.is_ranked();
        let size = request.effective_size();
        let after = request
            .cursor
            .as_deref()
            .map(|cursor| SortKey::from_cursor(cursor, ranked))
            .transpose()?;

        self.refresh_if_stale()?;

        let query = build_query(&self.index, &self.schema, request)?;
        let searcher = self.reader.searcher();

        let (top, total): (Vec<(Option<SortKey>, DocAddress)>, usize) = if ranked {
            let collector =
                TopDocs::with_limit(size).tweak_score(move |segment_reader: &SegmentReader| {
                    let columns = open_columns(segment_reader);
                    move |doc: DocId, score: Score| candidate(&columns, doc, score, after)
                });
            searcher.search(query.as_ref(), &(collector, Count))?
        } else {
            let collector =
                TopDocs::with_limit(size).custom_score(move |segment_reader: &SegmentReader| {
                    let columns = open_columns(segment_reader);
                    move |doc: DocId| candidate(&columns, doc, 0.0, after)
                });
            searcher.search(query.as_ref(), &(collector, Count))?
        };

        // Non-candidates sort last and only fill a short page
        let hits: Vec<(SortKey, DocAddress)> = top
            .into_iter()
            .filter_map(|(key, address)| key.map(|k| (k, address)))
            .collect();

        let mut circles = Vec::with_capacity(hits.len());
        let mut cursors = Vec::with_capacity(hits.len());
        for (key, address) in &hits {
            let doc: TantivyDocument = searcher.doc(*address)?;
            circles.push(CircleDocument::from_tantivy(&self.schema, &doc)?);
            cursors.push(key.to_cursor(ranked));
        }

        let next_cursor = if circles.len() == size {
            cursors.last().cloned()
        } else {
            None
        };

        info!(
            keyword = request.keyword().unwrap_or(""),
            total,
            returned = circles.len(),
            has_next = next_cursor.is_some(),
            "Circle search complete"
        );

        Ok(SearchPage {
            circles,
            cursors,
            total,
            size,
            next_cursor,
        })
    }

    /// Get the number of indexed documents as of the last reload.
    pub fn num_docs(&self) -> u64 {
        let searcher = self.reader.searcher();
        searcher
            .segment_readers()
            .iter()
            .map(|r| r.num_docs() as u64)
            .sum()
    }
}
