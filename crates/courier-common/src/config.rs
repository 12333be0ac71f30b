//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for courier services."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Queue carrying submission requests.
pub const SUBMISSION_REQUESTS: &str = "submission_requests";
/// Queue carrying user account requests.
pub const USER_REQUESTS: &str = "user_requests";
/// Queue carrying notification requests and one-way notification events.
pub const NOTIFICATION_REQUESTS: &str = "notification_requests";

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_consumer_group() -> String {
    "courier".to_owned()
}

fn default_reply_queue_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_block_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_prefetch() -> usize {
    32
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_consumers() -> usize {
    1
}

fn default_empty_reply() -> JsonValue {
    serde_json::json!({ "error": "No response generated" })
}

fn default_queues() -> Vec<String> {
    vec![
        SUBMISSION_REQUESTS.to_owned(),
        USER_REQUESTS.to_owned(),
        NOTIFICATION_REQUESTS.to_owned(),
    ]
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for courier services and tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "COURIER_CONFIG";

    /// Load configuration from disk, respecting the `COURIER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Unlike the daemon-style loaders this falls back to [`AppConfig::default`] when no
    /// candidate exists, so the CLI works against an in-process broker out of the box.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: Self::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.client.validate()?;
        self.dispatcher.validate()?;
        self.topology.validate()?;
        if self.broker.reply_queue_ttl < self.client.request_timeout {
            return Err(anyhow!(
                "broker.reply_queue_ttl ({}s) must not be shorter than client.request_timeout ({}s)",
                self.broker.reply_queue_ttl.as_secs(),
                self.client.request_timeout.as_secs()
            ));
        }
        if let Some(dlq) = &self.dispatcher.dead_letter_queue {
            if self.topology.queues.iter().any(|queue| queue == dlq) {
                return Err(anyhow!(
                    "dead letter queue '{}' must not be one of the request queues",
                    dlq
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Broker backend selection.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; useful for tests and single-process deployments.
    #[default]
    Memory,
    /// Redis Streams backed broker.
    Redis,
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BrokerKind::Memory),
            "redis" => Ok(BrokerKind::Redis),
            other => Err(format!("unknown broker kind: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Consumer group shared by every competing consumer of a durable queue.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Stable consumer name; defaults to the host name so pending entries survive restarts.
    #[serde(default)]
    pub consumer_name: Option<String>,
    #[serde(default = "default_reply_queue_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reply_queue_ttl: Duration,
    #[serde(default = "default_block_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub block_interval: Duration,
    /// Maximum unacknowledged deliveries per consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: default_broker_url(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            reply_queue_ttl: default_reply_queue_ttl(),
            block_interval: default_block_interval(),
            prefetch: default_prefetch(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == BrokerKind::Redis && self.url.trim().is_empty() {
            return Err(anyhow!("broker.url is required for the redis broker"));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(anyhow!("broker.consumer_group cannot be empty"));
        }
        if self.reply_queue_ttl.is_zero() {
            return Err(anyhow!("broker.reply_queue_ttl must be greater than zero"));
        }
        if self.block_interval.is_zero() {
            return Err(anyhow!("broker.block_interval must be greater than zero"));
        }
        if self.prefetch == 0 {
            return Err(anyhow!("broker.prefetch must be at least 1"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(anyhow!("client.request_timeout must be greater than zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Consumer slots per served queue.
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub handler_timeout: Option<Duration>,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
    /// Reply body sent when a handler returns `null`.
    #[serde(default = "default_empty_reply")]
    pub empty_reply: JsonValue,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            consumers: default_consumers(),
            handler_timeout: None,
            dead_letter_queue: None,
            empty_reply: default_empty_reply(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.consumers == 0 {
            return Err(anyhow!("dispatcher.consumers must be at least 1"));
        }
        if matches!(self.handler_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(anyhow!("dispatcher.handler_timeout must be greater than zero"));
        }
        if matches!(&self.dead_letter_queue, Some(queue) if queue.trim().is_empty()) {
            return Err(anyhow!("dispatcher.dead_letter_queue cannot be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(anyhow!("topology.queues cannot contain empty names"));
            }
            if !seen.insert(queue.as_str()) {
                return Err(anyhow!("topology.queues lists '{}' more than once", queue));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Disable the rolling file layer (stdout only).
    #[serde(default)]
    pub stdout_only: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            stdout_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
