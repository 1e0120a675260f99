//! Query planning: request normalization, the sort chain and cursors.
//!
//! Every page is ordered by a total order over `SortKey`. Without a
//! keyword the relevance slot is zero for every hit, so only the field
//! chain decides. Cursors are the JSON array of the last hit's sort key.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tantivy::query::{
    BooleanQuery, BoostQuery, ConstScoreQuery, DisjunctionMaxQuery, EmptyQuery, Occur, Query,
    TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, Score, Term};

use circle_types::{CircleStatus, JoinType, NOT_DELETED};

use crate::error::SearchError;
use crate::schema::CircleSchema;

/// Page size used when none (or an out-of-range one) is requested.
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Largest page a caller may ask for.
pub const MAX_PAGE_SIZE: usize = 100;

/// Relevance multiplier for matches in the circle name.
const NAME_BOOST: Score = 3.0;

/// A public circle search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Free-text keyword; blank means "browse"
    pub keyword: Option<String>,
    /// Requested page size
    pub size: Option<i64>,
    /// Cursor returned by the previous page
    pub cursor: Option<String>,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Trimmed keyword, or None when absent or blank.
    pub fn keyword(&self) -> Option<&str> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Requested size if it lies in `1..=100`, otherwise the default.
    pub fn effective_size(&self) -> usize {
        match self.size {
            Some(size) if size > 0 && size <= MAX_PAGE_SIZE as i64 => size as usize,
            _ => DEFAULT_PAGE_SIZE,
        }
    }

    /// Whether hits are ranked by relevance before the field chain.
    pub fn is_ranked(&self) -> bool {
        self.keyword().is_some()
    }
}

/// Position of a hit in the result order. Compared lexicographically in
/// field order; `circle_id` makes the order total.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SortKey {
    pub score: Score,
    pub hot: i64,
    pub member_count: i64,
    pub post_count: i64,
    pub create_time_ms: i64,
    pub circle_id: i64,
}

impl SortKey {
    /// Encode as a cursor string. The score is only part of the cursor
    /// when the page was ranked.
    pub fn to_cursor(&self, ranked: bool) -> String {
        let mut values: Vec<JsonValue> = Vec::with_capacity(6);
        if ranked {
            values.push(JsonValue::from(f64::from(self.score)));
        }
        values.extend(
            [
                self.hot,
                self.member_count,
                self.post_count,
                self.create_time_ms,
                self.circle_id,
            ]
            .into_iter()
            .map(JsonValue::from),
        );
        JsonValue::Array(values).to_string()
    }

    /// Decode a cursor produced by `to_cursor` for the same sort order.
    pub fn from_cursor(cursor: &str, ranked: bool) -> Result<Self, SearchError> {
        let values: Vec<JsonValue> = serde_json::from_str(cursor)
            .map_err(|e| SearchError::InvalidCursor(format!("not a JSON array: {}", e)))?;

        let expected = if ranked { 6 } else { 5 };
        if values.len() != expected {
            return Err(SearchError::InvalidCursor(format!(
                "expected {} values for this sort order, got {}",
                expected,
                values.len()
            )));
        }

        let (score, rest) = if ranked {
            let score = values[0]
                .as_f64()
                .ok_or_else(|| SearchError::InvalidCursor("score must be a number".to_string()))?;
            (score as Score, &values[1..])
        } else {
            (0.0, &values[..])
        };

        let mut ints = [0i64; 5];
        for (slot, value) in ints.iter_mut().zip(rest) {
            *slot = value.as_i64().ok_or_else(|| {
                SearchError::InvalidCursor(format!("expected an integer, got {}", value))
            })?;
        }
        let [hot, member_count, post_count, create_time_ms, circle_id] = ints;

        Ok(Self {
            score,
            hot,
            member_count,
            post_count,
            create_time_ms,
            circle_id,
        })
    }
}

fn i64_term_query(field: Field, value: i64) -> Box<dyn Query> {
    Box::new(TermQuery::new(
        Term::from_field_i64(field, value),
        IndexRecordOption::Basic,
    ))
}

fn filter(query: Box<dyn Query>) -> Box<dyn Query> {
    Box::new(ConstScoreQuery::new(query, 0.0))
}

/// OR of the keyword's tokens in one field, or None when the field's
/// analyzer produces no tokens.
fn field_match(
    index: &Index,
    field: Field,
    keyword: &str,
) -> Result<Option<Box<dyn Query>>, SearchError> {
    let mut analyzer = index.tokenizer_for_field(field)?;
    let mut stream = analyzer.token_stream(keyword);

    let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
    while stream.advance() {
        let term = Term::from_field_text(field, &stream.token().text);
        clauses.push((
            Occur::Should,
            Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)),
        ));
    }

    if clauses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Box::new(BooleanQuery::new(clauses))))
    }
}

/// Relevance part of a ranked search: best of the boosted name match and
/// the description match.
fn keyword_query(
    index: &Index,
    schema: &CircleSchema,
    keyword: &str,
) -> Result<Box<dyn Query>, SearchError> {
    let mut disjuncts: Vec<Box<dyn Query>> = Vec::with_capacity(2);
    if let Some(name) = field_match(index, schema.name, keyword)? {
        disjuncts.push(Box::new(BoostQuery::new(name, NAME_BOOST)));
    }
    if let Some(description) = field_match(index, schema.description, keyword)? {
        disjuncts.push(description);
    }

    if disjuncts.is_empty() {
        return Ok(Box::new(EmptyQuery));
    }
    Ok(Box::new(DisjunctionMaxQuery::new(disjuncts)))
}

/// Build the full query for a request: visibility filters plus, when a
/// keyword is present, the relevance clause.
pub fn build_query(
    index: &Index,
    schema: &CircleSchema,
    request: &SearchRequest,
) -> Result<Box<dyn Query>, SearchError> {
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
        (
            Occur::Must,
            filter(i64_term_query(
                schema.status,
                i64::from(CircleStatus::Normal.code()),
            )),
        ),
        (
            Occur::Must,
            filter(i64_term_query(schema.deleted, i64::from(NOT_DELETED))),
        ),
        (
            Occur::MustNot,
            i64_term_query(schema.join_type, i64::from(JoinType::Private.code())),
        ),
    ];

    if let Some(keyword) = request.keyword() {
        clauses.push((Occur::Must, keyword_query(index, schema, keyword)?));
    }

    Ok(Box::new(BooleanQuery::new(clauses)))
}
