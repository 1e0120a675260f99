//! End-to-end test infrastructure for the circle sync pipeline.
//!
//! Provides a shared TestHarness wiring the write service, the in-memory
//! broker, the consumer and a Tantivy index in a temp directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use circle_search::{
    CircleDocument, CircleIndex, CircleIndexConfig, CircleIndexer, CircleSearcher, SearchPage,
    SearchRequest,
};
use circle_sync::{
    CircleDraft, CircleSyncService, ConsumerStats, MemoryBroker, MemoryCircleStore, Subscriber,
    SyncConsumer, SyncPublisher,
};
use circle_types::CircleSnapshot;

/// Redelivery cap used by the harness consumer.
pub const HARNESS_MAX_REDELIVERIES: u32 = 3;

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub index_path: PathBuf,
    pub index: CircleIndex,
    pub indexer: Arc<CircleIndexer>,
    pub broker: MemoryBroker,
    pub service: CircleSyncService<MemoryCircleStore>,
    pub consumer: SyncConsumer<CircleIndexer>,
    pub searcher: CircleSearcher,
}

impl TestHarness {
    /// Create a harness with an empty index, store and queue.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let index_path = temp_dir.path().join("circle");
        std::fs::create_dir_all(&index_path).expect("Failed to create index dir");

        let index = CircleIndex::open_or_create(CircleIndexConfig::new(&index_path))
            .expect("Failed to open index");
        let indexer = Arc::new(CircleIndexer::new(&index).expect("Failed to create indexer"));
        // Reload on every query so each assertion sees the last commit
        let searcher =
            CircleSearcher::new(&index, Duration::ZERO).expect("Failed to create searcher");

        // Closed up front: a consumer run drains whatever is queued and returns
        let broker = MemoryBroker::new();
        broker.close();

        let publisher = SyncPublisher::new(Arc::new(broker.clone()));
        let service = CircleSyncService::new(MemoryCircleStore::new(), publisher);
        let consumer = SyncConsumer::new(indexer.clone(), HARNESS_MAX_REDELIVERIES);

        Self {
            _temp_dir: temp_dir,
            index_path,
            index,
            indexer,
            broker,
            service,
            consumer,
            searcher,
        }
    }

    pub fn store(&self) -> &MemoryCircleStore {
        self.service.store()
    }

    /// Consume every queued message.
    pub async fn drain(&mut self) -> ConsumerStats {
        let mut stream = self
            .broker
            .subscribe()
            .await
            .expect("Failed to subscribe to memory broker");
        self.consumer.run(stream.as_mut()).await
    }

    /// Create a circle through the service.
    pub async fn create(&self, name: &str, description: &str) -> CircleSnapshot {
        self.service
            .create(&CircleDraft::new(name, description))
            .await
            .expect("Failed to create circle")
    }

    /// Set activity counters in the store and republish the row.
    pub async fn bump(&self, circle_id: i64, hot: i64, members: i64, posts: i64) -> CircleSnapshot {
        self.store().set_counts(circle_id, hot, members, posts);
        let row = self.store().get(circle_id).expect("Circle not in store");
        let draft = CircleDraft::new(&row.name, &row.description)
            .with_avatar(&row.avatar_url)
            .with_category(row.category_id)
            .with_join_type(row.join_type);
        self.service
            .update(circle_id, &draft)
            .await
            .expect("Failed to update circle")
    }

    pub fn search(&self, request: &SearchRequest) -> SearchPage {
        self.searcher.search(request).expect("Search failed")
    }

    pub fn search_keyword(&self, keyword: &str) -> SearchPage {
        self.search(&SearchRequest::new().with_keyword(keyword))
    }

    pub fn browse(&self) -> SearchPage {
        self.search(&SearchRequest::new())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Circle ids of a page in result order.
pub fn ids(page: &SearchPage) -> Vec<i64> {
    page.circles.iter().map(|c: &CircleDocument| c.circle_id).collect()
}

/// Follow cursors until the last page; returns every page.
pub fn collect_pages(searcher: &CircleSearcher, first: SearchRequest) -> Vec<SearchPage> {
    let mut pages = Vec::new();
    let mut request = first;
    loop {
        let page = searcher.search(&request).expect("Search failed");
        let next = page.next_cursor.clone();
        pages.push(page);
        match next {
            Some(cursor) => request = request.with_cursor(cursor),
            None => return pages,
        }
    }
}
