//! CLI argument parsing for the circle sync daemon.
//!
//! CLI flags override every other configuration source.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use circle_types::SyncAction;

/// Circle Sync Daemon
///
/// Keeps the circle search index in step with the circle store.
#[derive(Parser, Debug)]
#[command(name = "circle-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides the default under the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync worker until interrupted
    Start {
        /// Override the index root directory
        #[arg(long)]
        index_path: Option<String>,

        /// Override the broker host
        #[arg(long)]
        amqp_host: Option<String>,
    },

    /// Search the local index and print one page as JSON
    Search {
        /// Keyword; omit to browse by activity
        #[arg(short, long)]
        keyword: Option<String>,

        /// Page size (1-100, otherwise 20)
        #[arg(short, long, allow_negative_numbers = true)]
        size: Option<i64>,

        /// Cursor returned by the previous page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Publish a circle snapshot read from a JSON file
    Publish {
        /// Snapshot file
        #[arg(short, long)]
        file: PathBuf,

        /// Sync action (create, update, delete)
        #[arg(short, long, default_value = "update")]
        action: SyncAction,
    },

    /// Show index and broker status
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_start_overrides() {
        let cli = Cli::parse_from([
            "circle-daemon",
            "start",
            "--index-path",
            "/var/lib/circles",
            "--amqp-host",
            "rabbit.internal",
        ]);
        match cli.command {
            Commands::Start {
                index_path,
                amqp_host,
            } => {
                assert_eq!(index_path.as_deref(), Some("/var/lib/circles"));
                assert_eq!(amqp_host.as_deref(), Some("rabbit.internal"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["circle-daemon", "--config", "/etc/circle.toml", "status"]);
        assert_eq!(cli.config, Some("/etc/circle.toml".to_string()));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_cli_with_log_level_after_subcommand() {
        let cli = Cli::parse_from(["circle-daemon", "start", "--log-level", "debug"]);
        assert_eq!(cli.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_cli_search() {
        let cli = Cli::parse_from([
            "circle-daemon",
            "search",
            "-k",
            "hiking",
            "--size",
            "5",
            "--cursor",
            "[1,2,3,4,5]",
        ]);
        match cli.command {
            Commands::Search {
                keyword,
                size,
                cursor,
            } => {
                assert_eq!(keyword.as_deref(), Some("hiking"));
                assert_eq!(size, Some(5));
                assert_eq!(cursor.as_deref(), Some("[1,2,3,4,5]"));
            }
            _ => panic!("Expected Search command"),
        }
    }

    #[test]
    fn test_cli_search_accepts_negative_size() {
        let cli = Cli::parse_from(["circle-daemon", "search", "--size", "-3"]);
        match cli.command {
            Commands::Search { size, .. } => assert_eq!(size, Some(-3)),
            _ => panic!("Expected Search command"),
        }
    }

    #[test]
    fn test_cli_publish_default_action() {
        let cli = Cli::parse_from(["circle-daemon", "publish", "--file", "circle.json"]);
        match cli.command {
            Commands::Publish { file, action } => {
                assert_eq!(file, PathBuf::from("circle.json"));
                assert_eq!(action, SyncAction::Update);
            }
            _ => panic!("Expected Publish command"),
        }
    }

    #[test]
    fn test_cli_publish_rejects_unknown_action() {
        let result = Cli::try_parse_from([
            "circle-daemon",
            "publish",
            "--file",
            "circle.json",
            "--action",
            "archive",
        ]);
        assert!(result.is_err());
    }
}
