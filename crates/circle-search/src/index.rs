//! Circle index bootstrap.
//!
//! Runs on every start. A directory holding `meta.json` is opened and its
//! schema checked against the circle mapping; anything else gets a fresh
//! index. Running it twice against the same directory changes nothing.

use std::path::{Path, PathBuf};

use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy};
use tracing::{debug, info};

use circle_types::IndexSettings;

use crate::error::SearchError;
use crate::schema::{build_circle_schema, CircleSchema};

const DEFAULT_WRITER_MEMORY_MB: usize = 50;

/// Messages are applied one at a time, so one indexing thread is enough.
const WRITER_THREADS: usize = 1;

/// What bootstrap found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBootstrap {
    Opened,
    Created,
}

/// Where the circle index lives and how much memory its writer gets.
#[derive(Debug, Clone)]
pub struct CircleIndexConfig {
    /// Directory of this index, index name included
    pub index_path: PathBuf,
    pub writer_memory_mb: usize,
}

impl CircleIndexConfig {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            writer_memory_mb: DEFAULT_WRITER_MEMORY_MB,
        }
    }

    /// `<index.path>/<index.name>` with the configured writer budget.
    pub fn from_settings(settings: &IndexSettings) -> Self {
        Self::new(settings.index_dir()).with_writer_memory(settings.writer_memory_mb)
    }

    pub fn with_writer_memory(mut self, mb: usize) -> Self {
        self.writer_memory_mb = mb;
        self
    }
}

/// True when `dir` already holds a Tantivy index.
pub fn index_exists(dir: &Path) -> bool {
    dir.join("meta.json").is_file()
}

/// Open the index in `dir`, creating directory and index when absent.
pub fn open_or_create_index(dir: &Path) -> Result<(Index, IndexBootstrap), SearchError> {
    if index_exists(dir) {
        debug!(path = ?dir, "Found existing circle index");
        return Ok((Index::open_in_dir(dir)?, IndexBootstrap::Opened));
    }

    std::fs::create_dir_all(dir)?;
    let mapping = build_circle_schema();
    let index = Index::create_in_dir(dir, mapping.schema().clone())?;
    info!(path = ?dir, "Created circle index");
    Ok((index, IndexBootstrap::Created))
}

/// A bootstrapped circle index and its resolved fields.
pub struct CircleIndex {
    index: Index,
    schema: CircleSchema,
    config: CircleIndexConfig,
    bootstrap: IndexBootstrap,
}

impl CircleIndex {
    /// Bootstrap the index. Fails with `SchemaMismatch` when the directory
    /// holds an index with a different mapping.
    pub fn open_or_create(config: CircleIndexConfig) -> Result<Self, SearchError> {
        let (index, bootstrap) = open_or_create_index(&config.index_path)?;
        let schema = CircleSchema::from_schema(index.schema())?;

        info!(
            path = ?config.index_path,
            bootstrap = ?bootstrap,
            "Circle index ready"
        );

        Ok(Self {
            index,
            schema,
            config,
            bootstrap,
        })
    }

    pub fn schema(&self) -> &CircleSchema {
        &self.schema
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn path(&self) -> &Path {
        &self.config.index_path
    }

    pub fn bootstrap(&self) -> IndexBootstrap {
        self.bootstrap
    }

    /// Single-threaded writer with the configured memory budget. Only one
    /// writer may exist per index directory.
    pub fn writer(&self) -> Result<IndexWriter, SearchError> {
        let budget_bytes = self.config.writer_memory_mb * 1024 * 1024;
        let writer = self
            .index
            .writer_with_num_threads(WRITER_THREADS, budget_bytes)
            .map_err(|e| match e {
                e @ tantivy::TantivyError::LockFailure(..) => SearchError::IndexLocked(e.to_string()),
                other => SearchError::Tantivy(other),
            })?;
        debug!(memory_mb = self.config.writer_memory_mb, "Opened circle index writer");
        Ok(writer)
    }

    /// Reader that reloads only when the searcher asks it to.
    pub fn reader(&self) -> Result<IndexReader, SearchError> {
        Ok(self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tantivy::schema::{Schema, STORED, TEXT};
    use tempfile::TempDir;

    #[test]
    fn test_bootstrap_creates_then_opens() {
        let temp_dir = TempDir::new().unwrap();
        let config = CircleIndexConfig::new(temp_dir.path().join("circle"));
        assert!(!index_exists(&config.index_path));

        let first = CircleIndex::open_or_create(config.clone()).unwrap();
        assert_eq!(first.bootstrap(), IndexBootstrap::Created);
        assert!(index_exists(first.path()));
        let first_id = first.schema().circle_id;
        drop(first);

        let second = CircleIndex::open_or_create(config).unwrap();
        assert_eq!(second.bootstrap(), IndexBootstrap::Opened);
        assert_eq!(second.schema().circle_id, first_id);
    }

    #[test]
    fn test_open_foreign_index_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut builder = Schema::builder();
        builder.add_text_field("title", TEXT | STORED);
        Index::create_in_dir(temp_dir.path(), builder.build()).unwrap();

        let result = CircleIndex::open_or_create(CircleIndexConfig::new(temp_dir.path()));
        assert!(matches!(result, Err(SearchError::SchemaMismatch(_))));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = IndexSettings {
            path: "/data/search".to_string(),
            name: "circle_v2".to_string(),
            writer_memory_mb: 64,
            refresh_interval_ms: 0,
        };
        let config = CircleIndexConfig::from_settings(&settings);
        assert_eq!(config.index_path, PathBuf::from("/data/search/circle_v2"));
        assert_eq!(config.writer_memory_mb, 64);
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let temp_dir = TempDir::new().unwrap();
        let config = CircleIndexConfig::new(temp_dir.path()).with_writer_memory(20);
        let index = CircleIndex::open_or_create(config).unwrap();

        let _writer = index.writer().unwrap();
        assert!(matches!(index.writer(), Err(SearchError::IndexLocked(_))));
        assert!(index.reader().is_ok());
    }
}
