//! Circle Sync Daemon
//!
//! Consumes circle sync messages and keeps the search index current.
//!
//! # Usage
//!
//! ```bash
//! circle-daemon start [--index-path PATH] [--amqp-host HOST]
//! circle-daemon search [--keyword K] [--size N] [--cursor C]
//! circle-daemon publish --file circle.json [--action update]
//! circle-daemon status
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (<config dir>/circle-sync/config.toml)
//! 3. Environment variables (CIRCLE_SYNC__*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use circle_daemon::{handle_search, publish_snapshot, show_status, start_sync, Cli, Commands};
use circle_search::SearchRequest;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Start {
            index_path,
            amqp_host,
        } => {
            start_sync(config, index_path.as_deref(), amqp_host.as_deref(), log_level).await?;
        }
        Commands::Search {
            keyword,
            size,
            cursor,
        } => {
            let request = SearchRequest {
                keyword,
                size,
                cursor,
            };
            handle_search(config, log_level, request)?;
        }
        Commands::Publish { file, action } => {
            publish_snapshot(config, log_level, &file, action).await?;
        }
        Commands::Status => {
            show_status(config, log_level)?;
        }
    }

    Ok(())
}
