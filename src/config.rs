//! Configuration types for tick-ingest
//!
//! Every field has a default, so a partial (or missing) TOML file works.
//! A handful of settings can be overridden from the environment.

use crate::auth::LOGIN_URL;
use crate::decoder::{ExchangeType, SubscriptionMode};
use crate::feed::{SubscriptionRequest, TokenList};
use crate::pipeline::BatchConfig;
use crate::resilience::{BackoffConfig, BreakerConfig};
use crate::storage::ParquetConfig;
use crate::telemetry::LogFormat;
use crate::ws::WsConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default feed endpoint
pub const FEED_URL: &str = "wss://smartapisocket.angelone.in/smart-stream";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub auth: AuthConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub breaker: BreakerSettings,
    pub supervisor: SupervisorConfig,
    pub telemetry: TelemetryConfig,
}

/// Feed connection and subscription
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default = "default_correlation_id")]
    pub correlation_id: String,
    #[serde(default = "default_mode")]
    pub mode: SubscriptionMode,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// 0 = retry forever
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_instruments")]
    pub instruments: Vec<InstrumentConfig>,
}

/// Tokens to subscribe on one exchange segment
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstrumentConfig {
    pub exchange: ExchangeType,
    pub tokens: Vec<String>,
}

fn default_feed_url() -> String {
    FEED_URL.to_string()
}
fn default_correlation_id() -> String {
    "tick_ingest".to_string()
}
fn default_mode() -> SubscriptionMode {
    SubscriptionMode::Quote
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_instruments() -> Vec<InstrumentConfig> {
    vec![InstrumentConfig {
        exchange: ExchangeType::NseCm,
        // RELIANCE, INFY, TCS, SBIN, HDFCBANK
        tokens: ["2885", "1594", "11536", "3045", "3787"]
            .into_iter()
            .map(String::from)
            .collect(),
    }]
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            correlation_id: default_correlation_id(),
            mode: default_mode(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: 0,
            instruments: default_instruments(),
        }
    }
}

impl FeedConfig {
    /// Stream client settings, without auth headers
    pub fn ws_config(&self) -> WsConfig {
        WsConfig::new(&self.url)
            .heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs))
            .reconnect_delay(Duration::from_secs(self.reconnect_delay_secs))
            .max_reconnects(self.max_reconnect_attempts)
    }

    /// Subscribe message for every configured instrument
    pub fn subscription_request(&self) -> SubscriptionRequest {
        let token_list = self
            .instruments
            .iter()
            .map(|i| TokenList::new(i.exchange, i.tokens.iter().cloned()))
            .collect();
        SubscriptionRequest::subscribe(&self.correlation_id, self.mode, token_list)
    }

    /// Every configured token, in file order
    pub fn tokens(&self) -> Vec<String> {
        self.instruments
            .iter()
            .flat_map(|i| i.tokens.iter().cloned())
            .collect()
    }
}

/// Broker login; secrets come from the environment only
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

fn default_login_url() -> String {
    LOGIN_URL.to_string()
}
fn default_auth_timeout() -> u64 {
    10
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            timeout_secs: default_auth_timeout(),
        }
    }
}

/// How workers write records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// One insert per tick
    #[default]
    Single,
    /// Buffered through the batch writer
    Batch,
}

/// Worker pool and batching
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Job queue capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_max_backlog_batches")]
    pub max_backlog_batches: usize,
    /// 0 disables periodic verification
    #[serde(default = "default_verify_interval")]
    pub verify_interval_secs: u64,
}

fn default_num_workers() -> usize {
    5
}
fn default_buffer_size() -> usize {
    1000
}
fn default_batch_size() -> usize {
    1000
}
fn default_flush_interval() -> u64 {
    5
}
fn default_max_backlog_batches() -> usize {
    10
}
fn default_verify_interval() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            buffer_size: default_buffer_size(),
            write_mode: WriteMode::default(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            max_backlog_batches: default_max_backlog_batches(),
            verify_interval_secs: default_verify_interval(),
        }
    }
}

impl PipelineConfig {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            max_backlog_batches: self.max_backlog_batches,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Parquet,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Upper bound on any single storage call
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Parquet rows per file
    #[serde(default = "default_rows_per_file")]
    pub rows_per_file: usize,
    /// Longest a staged Parquet row waits for its file
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data/ticks")
}
fn default_query_timeout() -> u64 {
    30
}
fn default_rows_per_file() -> usize {
    10_000
}
fn default_rotation_interval() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            output_dir: default_output_dir(),
            query_timeout_secs: default_query_timeout(),
            rows_per_file: default_rows_per_file(),
            rotation_interval_secs: default_rotation_interval(),
        }
    }
}

impl StorageConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn parquet_config(&self) -> ParquetConfig {
        ParquetConfig {
            max_rows_per_file: self.rows_per_file,
            rotation_interval: Duration::from_secs(self.rotation_interval_secs),
        }
    }
}

/// Circuit breaker around storage
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_half_open_max")]
    pub half_open_max_requests: u32,
}

fn default_window() -> u64 {
    10
}
fn default_open_timeout() -> u64 {
    60
}
fn default_min_requests() -> u32 {
    3
}
fn default_failure_ratio() -> f64 {
    0.6
}
fn default_half_open_max() -> u32 {
    3
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            open_timeout_secs: default_open_timeout(),
            min_requests: default_min_requests(),
            failure_ratio: default_failure_ratio(),
            half_open_max_requests: default_half_open_max(),
        }
    }
}

impl BreakerSettings {
    pub fn breaker_config(&self, name: &str) -> BreakerConfig {
        BreakerConfig {
            name: name.to_string(),
            window: Duration::from_secs(self.window_secs),
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            min_requests: self.min_requests,
            failure_ratio: self.failure_ratio,
            half_open_max_requests: self.half_open_max_requests,
        }
    }
}

/// Session retry schedule
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_randomization")]
    pub randomization_factor: f64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    /// 0 = retry forever
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_secs: u64,
}

fn default_initial_interval_ms() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_randomization() -> f64 {
    0.1
}
fn default_max_interval() -> u64 {
    30
}
fn default_max_elapsed() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization(),
            max_interval_secs: default_max_interval(),
            max_elapsed_secs: default_max_elapsed(),
        }
    }
}

impl SupervisorConfig {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_interval: Duration::from_secs(self.max_interval_secs),
            max_elapsed_time: (self.max_elapsed_secs > 0)
                .then(|| Duration::from_secs(self.max_elapsed_secs)),
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Prometheus endpoint port (0 = disabled)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_metrics_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Like [`Config::load`], but a missing file means all defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.apply_env()?;
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NUM_WORKERS`, `BUFFER_SIZE`, `BATCH_SIZE`, `LOG_LEVEL` and
    /// `QUERY_TIMEOUT_SECS`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty()).map(|v| (key, v));

        if let Some((key, v)) = get("NUM_WORKERS") {
            self.pipeline.num_workers = parse_env(key, &v)?;
        }
        if let Some((key, v)) = get("BUFFER_SIZE") {
            self.pipeline.buffer_size = parse_env(key, &v)?;
        }
        if let Some((key, v)) = get("BATCH_SIZE") {
            self.pipeline.batch_size = parse_env(key, &v)?;
        }
        if let Some((key, v)) = get("QUERY_TIMEOUT_SECS") {
            self.storage.query_timeout_secs = parse_env(key, &v)?;
        }
        if let Some((_, v)) = get("LOG_LEVEL") {
            self.telemetry.log_level = v;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pipeline.num_workers == 0 {
            return invalid("pipeline.num_workers must be at least 1");
        }
        if self.pipeline.buffer_size == 0 {
            return invalid("pipeline.buffer_size must be at least 1");
        }
        if self.pipeline.batch_size == 0 {
            return invalid("pipeline.batch_size must be at least 1");
        }
        if self.pipeline.max_backlog_batches == 0 {
            return invalid("pipeline.max_backlog_batches must be at least 1");
        }
        if self.pipeline.write_mode == WriteMode::Batch && self.pipeline.flush_interval_secs == 0 {
            return invalid("pipeline.flush_interval_secs must be positive in batch mode");
        }
        if self.storage.rows_per_file == 0 {
            return invalid("storage.rows_per_file must be at least 1");
        }
        if self.breaker.half_open_max_requests == 0 {
            return invalid("breaker.half_open_max_requests must be at least 1");
        }
        if self.feed.tokens().is_empty() {
            return invalid("feed.instruments must list at least one token");
        }
        if self.feed.heartbeat_interval_secs == 0 {
            return invalid("feed.heartbeat_interval_secs must be positive");
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_ratio) {
            return invalid("breaker.failure_ratio must be within 0..=1");
        }
        if self.supervisor.multiplier < 1.0 {
            return invalid("supervisor.multiplier must be at least 1");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
