//! Configuration schema for xlogd.
//!
//! YAML config: listener, admission lists, queue, batching, sink, stats.
//! `$VAR` / `${VAR}` / `${VAR:-default}` are expanded before parsing.

use crate::record::IndexSettings;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted `time_offset`, in hours either way.
pub const MAX_TIME_OFFSET_HOURS: i64 = 24;

/// Root config (xlogd.yaml).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// RESP listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Advertise multi-value RPUSH/LPUSH support in INFO (redis >= 2.4).
    #[serde(default = "default_true")]
    pub multi: bool,

    /// Hours added to line timestamps, which usually carry local time without a zone.
    /// For logs written in Asia/Shanghai use -8.
    #[serde(default)]
    pub time_offset: i64,

    /// Hostname reported in stats documents. Defaults to the system host name.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Log level (e.g. "info", "debug"). Env XLOGD_LOG_LEVEL overrides when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty". Env XLOGD_LOG_FORMAT overrides.
    #[serde(default)]
    pub log_format: Option<String>,

    /// Topics dropped on arrival.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Topics whose records are dropped unless they carry at least one keyword mark.
    #[serde(default)]
    pub enforce_keyword: Vec<String>,

    /// Upper bound on the final drain after a shutdown signal. Unset waits until the queue is empty.
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub index: IndexConfig,

    pub sink: SinkConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

fn default_bind() -> String {
    "0.0.0.0:6379".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// Bounded in-memory channel; pushes are rejected when full.
    #[default]
    Memory,
    /// SQLite file under `dir`; survives restarts, batches are acknowledged after delivery.
    Durable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_queue_dir")]
    pub dir: PathBuf,
    /// Optional bound for the durable queue.
    #[serde(default)]
    pub max_depth: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            capacity: default_queue_capacity(),
            dir: default_queue_dir(),
            max_depth: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    100_000
}
fn default_queue_dir() -> PathBuf {
    PathBuf::from("/var/lib/xlogd")
}

/// A bulk write happens once `size` records are collected or `timeout_secs` passed.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub size: usize,
    #[serde(default = "default_batch_timeout_secs")]
    pub timeout_secs: u64,
    /// Records per second through the bulk writer.
    #[serde(default = "default_batch_rate")]
    pub rate: u32,
    #[serde(default = "default_batch_burst")]
    pub burst: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            timeout_secs: default_batch_timeout_secs(),
            rate: default_batch_rate(),
            burst: default_batch_burst(),
        }
    }
}

impl BatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_batch_timeout_secs() -> u64 {
    3
}
fn default_batch_rate() -> u32 {
    10_000
}
fn default_batch_burst() -> u32 {
    10_000
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Index names become `topic-env-YYYY-MM-DD`.
    #[serde(default)]
    pub include_env: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// Elasticsearch base URLs, tried in order.
    pub urls: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Mapping type for clusters older than 7.x (e.g. "_doc").
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub retries: RetryConfig,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AuthConfig {
    Bearer {
        token_env: String,
        #[serde(default)]
        token_file: Option<String>,
    },
    Basic {
        user_env: String,
        #[serde(default)]
        user_file: Option<String>,
        password_env: String,
        #[serde(default)]
        password_file: Option<String>,
    },
}

/// Resolve a secret from file path (if set) or environment variable. File takes precedence.
pub fn read_secret(file_path: Option<&str>, env_var: &str) -> anyhow::Result<String> {
    if let Some(p) = file_path
        && !p.is_empty()
    {
        let s = std::fs::read_to_string(Path::new(p))
            .with_context(|| format!("read secret file {:?}", p))?;
        return Ok(s.trim().to_string());
    }
    std::env::var(env_var).with_context(|| format!("env {} not set", env_var))
}

/// Retries inside one sink call (transport errors, 408, 429, 5xx). Attempts rotate through `urls`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: Option<u64>,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_secs() -> u64 {
    1
}
fn default_max_backoff_secs() -> Option<u64> {
    Some(30)
}
fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stats_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stats_index_prefix")]
    pub index_prefix: String,
    /// Each interval is shifted by a random ±jitter so a fleet does not report in lockstep.
    #[serde(default)]
    pub jitter_secs: Option<u64>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_stats_interval_secs(),
            index_prefix: default_stats_index_prefix(),
            jitter_secs: None,
        }
    }
}

fn default_stats_interval_secs() -> u64 {
    60
}
fn default_stats_index_prefix() -> String {
    "xlogd-stats".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_address() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load and parse config from path. Expands env vars (`$VAR`, `${VAR}`, `${VAR:-default}`) via shellexpand.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {:?}: {}", path, e))?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(s)?;
        let config: Config = serde_yaml_ng::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sink.urls.is_empty() {
            anyhow::bail!("sink.urls must have at least one url");
        }
        if !(-MAX_TIME_OFFSET_HOURS..=MAX_TIME_OFFSET_HOURS).contains(&self.time_offset) {
            anyhow::bail!(
                "time_offset must be between -{0} and {0} hours, got {1}",
                MAX_TIME_OFFSET_HOURS,
                self.time_offset
            );
        }
        if self.batch.size == 0 {
            anyhow::bail!("batch.size must be > 0");
        }
        if self.batch.rate == 0 || self.batch.burst == 0 {
            anyhow::bail!("batch.rate and batch.burst must be > 0");
        }
        if self.queue.backend == QueueBackend::Memory && self.queue.capacity == 0 {
            anyhow::bail!("queue.capacity must be > 0");
        }
        if self.stats.enabled && self.stats.interval_secs == 0 {
            anyhow::bail!("stats.interval_secs must be > 0");
        }
        Ok(())
    }

    pub fn index_settings(&self) -> IndexSettings {
        IndexSettings {
            time_offset_hours: self.time_offset,
            include_env: self.index.include_env,
        }
    }

    /// Topic admission. Err carries the drop reason: "ignored" or "missing_keyword".
    pub fn admission(&self, topic: &str, keyword: &str) -> Result<(), &'static str> {
        if contains_ignore_case(&self.ignore, topic) {
            return Err("ignored");
        }
        if keyword.is_empty() && contains_ignore_case(&self.enforce_keyword, topic) {
            return Err("missing_keyword");
        }
        Ok(())
    }
}

fn contains_ignore_case(list: &[String], s: &str) -> bool {
    list.iter().any(|t| t.eq_ignore_ascii_case(s))
}

/// Expand env vars in config: `$VAR`, `${VAR}`, `${VAR:-default}`. Unset vars expand to empty.
fn expand_env_vars(s: &str) -> anyhow::Result<String> {
    fn context(var: &str) -> Result<Option<std::borrow::Cow<'static, str>>, std::env::VarError> {
        match std::env::var(var) {
            Ok(v) => Ok(Some(v.into())),
            Err(std::env::VarError::NotPresent) => Ok(Some("".into())),
            Err(e) => Err(e),
        }
    }
    shellexpand::env_with_context(s, context)
        .map(|cow| cow.into_owned())
        .map_err(|e| anyhow::anyhow!("config env expansion: {} ({})", e.var_name, e.cause))
}
