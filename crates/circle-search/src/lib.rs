//! # circle-search
//!
//! Circle search index for the sync pipeline, backed by Tantivy.
//!
//! ## Features
//! - Embedded Tantivy index with MmapDirectory for persistence
//! - Idempotent bootstrap, upsert and delete keyed by circle id
//! - Public search: visibility filters, BM25 keyword relevance with a
//!   name boost, and a deterministic field sort chain
//! - Search-after cursor pagination

pub mod document;
pub mod error;
pub mod index;
pub mod indexer;
pub mod query;
pub mod schema;
pub mod searcher;

pub use document::CircleDocument;
pub use error::SearchError;
pub use index::{index_exists, open_or_create_index, CircleIndex, CircleIndexConfig, IndexBootstrap};
pub use indexer::CircleIndexer;
pub use query::{build_query, SearchRequest, SortKey, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use schema::{build_circle_schema, CircleSchema};
pub use searcher::{CircleSearcher, SearchPage};
