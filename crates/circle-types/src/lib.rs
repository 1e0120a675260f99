//! # circle-types
//!
//! Shared domain types for circle search sync.
//!
//! This crate defines the data that crosses crate boundaries:
//! - Circles: committed snapshots and their status/join-type codes
//! - Messages: the JSON sync message carried over the broker
//! - Settings: layered configuration for the index and the broker
//!
//! ## Usage
//!
//! ```rust
//! use circle_types::{SyncAction, SyncMessage};
//! ```

pub mod circle;
pub mod config;
pub mod error;
pub mod message;

pub use circle::{CircleSnapshot, CircleStatus, JoinType, NOT_DELETED, SOFT_DELETED};
pub use config::{BrokerSettings, IndexSettings, RetrySettings, Settings};
pub use error::CircleError;
pub use message::{SyncAction, SyncMessage};
