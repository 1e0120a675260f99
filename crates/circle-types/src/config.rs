//! Configuration loading for circle search sync.
//!
//! Layered config: defaults -> default config file -> explicit config
//! file -> environment variables -> CLI flags (applied by the daemon).
//! The default config file lives at `<config dir>/circle-sync/config.*`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::CircleError;

/// Search index location and tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    /// Directory that holds all indexes
    #[serde(default = "default_index_path")]
    pub path: String,

    /// Index name; the index lives in `<path>/<name>`
    #[serde(default = "default_index_name")]
    pub name: String,

    /// Memory budget for the index writer in MB
    #[serde(default = "default_writer_memory_mb")]
    pub writer_memory_mb: usize,

    /// How stale a searcher may be before it reloads (0 = every query)
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_index_path() -> String {
    ProjectDirs::from("", "", "circle-sync")
        .map(|p| p.data_local_dir().join("index"))
        .unwrap_or_else(|| PathBuf::from("./index"))
        .to_string_lossy()
        .to_string()
}

fn default_index_name() -> String {
    "circle".to_string()
}

fn default_writer_memory_mb() -> usize {
    50
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            name: default_index_name(),
            writer_memory_mb: default_writer_memory_mb(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl IndexSettings {
    /// Full path of the index directory.
    pub fn index_dir(&self) -> PathBuf {
        expand_home(&self.path).join(&self.name)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("index.name must not be empty".to_string());
        }
        if self.name.contains('/') || self.name.contains('\\') {
            return Err(format!("index.name must be a plain name, got {}", self.name));
        }
        if self.writer_memory_mb < 15 {
            return Err(format!(
                "index.writer_memory_mb must be >= 15, got {}",
                self.writer_memory_mb
            ));
        }
        Ok(())
    }
}

/// Consumer startup retry policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total connect/subscribe attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait after attempt N is N times this value
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// AMQP broker connection and topology.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_broker_username")]
    pub username: String,

    /// Loaded from config/env, never logged
    #[serde(default = "default_broker_password")]
    pub password: SecretString,

    #[serde(default = "default_vhost")]
    pub vhost: String,

    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default = "default_routing_key")]
    pub routing_key: String,

    /// Upper bound on a single publish, in milliseconds
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Failed deliveries of one payload before it is dead-lettered (0 = never)
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_username() -> String {
    "guest".to_string()
}

fn default_broker_password() -> SecretString {
    SecretString::from("guest".to_string())
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_exchange() -> String {
    "circle_sync_exchange".to_string()
}

fn default_queue() -> String {
    "circle_sync_queue".to_string()
}

fn default_routing_key() -> String {
    "circle.sync".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_max_redeliveries() -> u32 {
    5
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: default_broker_username(),
            password: default_broker_password(),
            vhost: default_vhost(),
            exchange: default_exchange(),
            queue: default_queue(),
            routing_key: default_routing_key(),
            publish_timeout_ms: default_publish_timeout_ms(),
            max_redeliveries: default_max_redeliveries(),
            retry: RetrySettings::default(),
        }
    }
}

impl BrokerSettings {
    /// Vhost name as AMQP expects it: `/` for the default vhost, the bare
    /// name otherwise.
    pub fn vhost_name(&self) -> &str {
        match self.vhost.trim_start_matches('/') {
            "" => "/",
            name => name,
        }
    }

    /// Host and port only, safe to log.
    pub fn display_target(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Queue holding payloads that exhausted their redeliveries.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dead", self.queue)
    }

    /// Routing key binding the dead-letter queue to the exchange.
    pub fn dead_letter_routing_key(&self) -> String {
        format!("{}.dead", self.routing_key)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (key, value) in [
            ("broker.host", &self.host),
            ("broker.exchange", &self.exchange),
            ("broker.queue", &self.queue),
            ("broker.routing_key", &self.routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", key));
            }
        }
        if self.publish_timeout_ms == 0 {
            return Err("broker.publish_timeout_ms must be > 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("broker.retry.max_attempts must be > 0".to_string());
        }
        Ok(())
    }
}

/// Main application settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            index: IndexSettings::default(),
            broker: BrokerSettings::default(),
            log_level: default_log_level(),
        }
    }
}

fn config_err(e: config::ConfigError) -> CircleError {
    CircleError::Config(e.to_string())
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Default config file (<config dir>/circle-sync/config.*)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (CIRCLE_SYNC__BROKER__HOST, ...)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, CircleError> {
        let config_dir = ProjectDirs::from("", "", "circle-sync")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("index.path", default_index_path())
            .map_err(config_err)?
            .set_default("index.name", default_index_name())
            .map_err(config_err)?
            .set_default("log_level", default_log_level())
            .map_err(config_err)?
            .set_default("broker.host", default_broker_host())
            .map_err(config_err)?
            .set_default("broker.port", default_broker_port() as i64)
            .map_err(config_err)?
            .set_default("broker.exchange", default_exchange())
            .map_err(config_err)?
            .set_default("broker.queue", default_queue())
            .map_err(config_err)?
            .set_default("broker.routing_key", default_routing_key())
            .map_err(config_err)?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Nested keys contain underscores, so sections are split on "__"
        builder = builder.add_source(
            Environment::with_prefix("CIRCLE_SYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(config_err)?
            .try_deserialize()
            .map_err(config_err)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), CircleError> {
        self.index.validate().map_err(CircleError::Config)?;
        self.broker.validate().map_err(CircleError::Config)?;
        Ok(())
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
