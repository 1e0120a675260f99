//! Circle sync daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, search, publish, status)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
pub use commands::{
    handle_search, init_tracing, load_message, load_settings, open_index, publish_snapshot,
    run_search, show_status, start_sync, status_report, StatusReport,
};
