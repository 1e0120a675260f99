//! Command implementations for the circle sync daemon.
//!
//! Handles:
//! - start: open the index, run the supervised consumer until a shutdown signal
//! - search: one page from the local index as JSON
//! - publish: send a snapshot file through the publisher
//! - status: index location, document count and broker target

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};

use circle_search::{
    index_exists, CircleIndex, CircleIndexConfig, CircleIndexer, CircleSearcher, SearchPage,
    SearchRequest,
};
use circle_sync::{
    AmqpSink, AmqpSubscriber, BrokerConnection, ConsumerSupervisor, LinearBackoff, SupervisorState,
    SyncConsumer, SyncPublisher,
};
use circle_types::{CircleSnapshot, Settings, SyncAction, SyncMessage};

/// Load configuration and apply the global CLI overrides.
pub fn load_settings(config_path: Option<&str>, log_level_override: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Logs go to stderr so command output stays parseable.
pub fn init_tracing(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Open (or bootstrap) the index named by the settings.
pub fn open_index(settings: &Settings) -> Result<CircleIndex> {
    CircleIndex::open_or_create(CircleIndexConfig::from_settings(&settings.index))
        .with_context(|| format!("Failed to open index at {:?}", settings.index.index_dir()))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Run the sync worker.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Bootstrap the index
/// 3. Spawn the supervised consumer
/// 4. On SIGINT/SIGTERM stop consuming, close the broker, final commit
pub async fn start_sync(
    config_path: Option<&str>,
    index_path_override: Option<&str>,
    amqp_host_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<()> {
    let mut settings = load_settings(config_path, log_level_override)?;
    if let Some(index_path) = index_path_override {
        settings.index.path = index_path.to_string();
    }
    if let Some(host) = amqp_host_override {
        settings.broker.host = host.to_string();
    }
    settings.validate().context("Invalid configuration")?;

    init_tracing(&settings.log_level)?;

    info!("Circle sync daemon starting...");
    info!("Configuration:");
    info!("  Index: {:?}", settings.index.index_dir());
    info!("  Broker: {}", settings.broker.display_target());
    info!("  Queue: {}", settings.broker.queue);
    info!("  Log level: {}", settings.log_level);

    let index = open_index(&settings)?;
    let indexer = Arc::new(CircleIndexer::new(&index).context("Failed to open index writer")?);

    let subscriber = Arc::new(AmqpSubscriber::new(settings.broker.clone()));
    let consumer = SyncConsumer::new(indexer.clone(), settings.broker.max_redeliveries);
    let supervisor = ConsumerSupervisor::new(
        subscriber.clone(),
        consumer,
        LinearBackoff::from_settings(&settings.broker.retry),
    );
    let mut consumer_task = tokio::spawn(supervisor.run());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = &mut shutdown => {}
        outcome = &mut consumer_task => {
            match outcome {
                Ok(SupervisorState::Failed) => {
                    warn!("Search indexing degraded, waiting for shutdown signal");
                }
                Ok(state) => {
                    warn!(?state, "Circle sync consumer ended, waiting for shutdown signal");
                }
                Err(e) => {
                    error!(error = %e, "Circle sync consumer task failed");
                }
            }
            shutdown.await;
        }
    }

    consumer_task.abort();
    if let Err(e) = subscriber.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }
    indexer.commit().context("Final index commit failed")?;

    info!("Circle sync daemon stopped");
    Ok(())
}

/// Run one search against the local index. Never creates the index.
pub fn run_search(settings: &Settings, request: &SearchRequest) -> Result<SearchPage> {
    let index_dir = settings.index.index_dir();
    if !index_exists(&index_dir) {
        anyhow::bail!("No circle index at {:?}; start the sync daemon first", index_dir);
    }
    let index = open_index(settings)?;
    let searcher = CircleSearcher::new(&index, settings.index.refresh_interval())
        .context("Failed to open index reader")?;
    searcher.search(request).context("Search failed")
}

pub fn handle_search(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    request: SearchRequest,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override)?;
    init_tracing(&settings.log_level)?;

    let page = run_search(&settings, &request)?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

/// Read a snapshot file and turn it into a validated sync message.
pub fn load_message(path: &Path, action: SyncAction) -> Result<SyncMessage> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let snapshot: CircleSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid circle snapshot in {:?}", path))?;

    let message = SyncMessage::from_snapshot(action, &snapshot);
    message.validate().context("Snapshot cannot be synced")?;
    Ok(message)
}

pub async fn publish_snapshot(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    file: &Path,
    action: SyncAction,
) -> Result<()> {
    let settings = load_settings(config_path, log_level_override)?;
    init_tracing(&settings.log_level)?;

    let message = load_message(file, action)?;

    let connection = BrokerConnection::open(&settings.broker)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.broker.display_target()))?;
    let sink = AmqpSink::for_sync_queue(connection.channel(), connection.topology());
    let publisher =
        SyncPublisher::new(Arc::new(sink)).with_timeout(settings.broker.publish_timeout());

    let outcome = publisher.publish(&message).await;
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }

    if !outcome.is_published() {
        anyhow::bail!("Publish of circle {} failed: {:?}", message.circle_id, outcome);
    }
    println!("Published {} for circle {}", message.action, message.circle_id);
    Ok(())
}

/// What `status` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub index_dir: PathBuf,
    /// None when the index has not been created yet
    pub documents: Option<u64>,
    pub broker: String,
    pub queue: String,
}

/// Inspect the index without creating it. The broker is not contacted.
pub fn status_report(settings: &Settings) -> Result<StatusReport> {
    let index_dir = settings.index.index_dir();
    let documents = if index_exists(&index_dir) {
        let index = open_index(settings)?;
        let searcher = CircleSearcher::new(&index, settings.index.refresh_interval())
            .context("Failed to open index reader")?;
        Some(searcher.num_docs())
    } else {
        None
    };

    Ok(StatusReport {
        index_dir,
        documents,
        broker: settings.broker.display_target(),
        queue: settings.broker.queue.clone(),
    })
}

pub fn show_status(config_path: Option<&str>, log_level_override: Option<&str>) -> Result<()> {
    let settings = load_settings(config_path, log_level_override)?;
    init_tracing(&settings.log_level)?;

    let report = status_report(&settings)?;
    let output = json!({
        "index_dir": report.index_dir,
        "documents": report.documents,
        "broker": report.broker,
        "queue": report.queue,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use circle_search::CircleDocument;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.index.path = dir.path().to_string_lossy().to_string();
        settings
    }

    fn snapshot(circle_id: i64, name: &str) -> CircleSnapshot {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        CircleSnapshot::new(circle_id, name, "Weekend meetups", created)
    }

    #[test]
    fn test_status_before_bootstrap() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);

        let report = status_report(&settings).unwrap();
        assert_eq!(report.index_dir, dir.path().join("circle"));
        assert_eq!(report.documents, None);
        assert_eq!(report.queue, "circle_sync_queue");
        assert!(!report.index_dir.exists());
    }

    #[test]
    fn test_status_counts_documents() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);

        let index = open_index(&settings).unwrap();
        let indexer = CircleIndexer::new(&index).unwrap();
        for (id, name) in [(1, "Chess"), (2, "Go")] {
            let message = SyncMessage::from_snapshot(SyncAction::Create, &snapshot(id, name));
            indexer
                .upsert(&CircleDocument::from_message(&message).unwrap())
                .unwrap();
        }
        indexer.commit().unwrap();
        drop(indexer);

        let report = status_report(&settings).unwrap();
        assert_eq!(report.documents, Some(2));
    }

    #[test]
    fn test_search_without_index_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);

        assert!(run_search(&settings, &SearchRequest::new()).is_err());
        assert!(!settings.index.index_dir().exists());
    }

    #[test]
    fn test_search_on_fresh_index_is_empty() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        open_index(&settings).unwrap();

        let page = run_search(&settings, &SearchRequest::new().with_keyword("chess")).unwrap();
        assert!(page.circles.is_empty());
        assert_eq!(page.total, 0);
        assert_eq!(page.size, 20);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_search_rejects_bad_cursor() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        open_index(&settings).unwrap();

        let result = run_search(&settings, &SearchRequest::new().with_cursor("not-a-cursor"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_message() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("circle.json");
        fs::write(&path, serde_json::to_string(&snapshot(7, "Chess")).unwrap()).unwrap();

        let message = load_message(&path, SyncAction::Update).unwrap();
        assert_eq!(message.circle_id, 7);
        assert_eq!(message.action, SyncAction::Update);
        assert_eq!(message.create_time, "2024-03-01T08:00:00Z");
    }

    #[test]
    fn test_load_message_rejects_invalid_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("circle.json");

        fs::write(&path, "{\"name\": \"no id\"}").unwrap();
        assert!(load_message(&path, SyncAction::Create).is_err());

        fs::write(&path, serde_json::to_string(&snapshot(0, "Zero")).unwrap()).unwrap();
        assert!(load_message(&path, SyncAction::Create).is_err());

        assert!(load_message(&dir.path().join("missing.json"), SyncAction::Create).is_err());
    }
}
