// =============================================================================
// Application Configuration: JSON file + environment overrides
// =============================================================================
//
// Settings are read once at startup from a JSON file (path from CONFIG_PATH),
// then individual values are overridden from the environment. All fields carry
// `#[serde(default)]` so a partial file, or no file at all, still yields a
// complete configuration.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregator::PriceTiers;
use crate::market_data::feed_client::DEFAULT_FEED_URL;
use crate::types::{parse_duration, DeployEnv, Interval};

/// Default location of the config file when CONFIG_PATH is unset.
pub const DEFAULT_CONFIG_PATH: &str = "market_pulse.json";

const COMPRESSION_CODECS: [&str; 5] = ["none", "gzip", "snappy", "lz4", "zstd"];

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_ping_interval_ms() -> u64 {
    3_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    120_000
}

fn default_normalizer_workers() -> usize {
    10
}

fn default_aggregator_workers() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    100
}

fn default_intervals() -> Vec<String> {
    vec!["10s".to_string(), "1h".to_string(), "1d".to_string()]
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:8082".to_string()]
}

fn default_topic_daily_stats() -> String {
    "binance.miniticker".to_string()
}

fn default_topic_windows() -> String {
    "binance.windows".to_string()
}

fn default_batch_size() -> usize {
    120
}

fn default_batch_timeout_ms() -> u64 {
    2_000
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_required_acks() -> i32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Silence longer than this is treated as a dead connection.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            ping_interval_ms: default_ping_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl FeedConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Normalizer tasks sharing the raw-message queue.
    #[serde(default = "default_normalizer_workers")]
    pub normalizer_workers: usize,

    /// Window-aggregator ingest tasks sharing the event queue.
    #[serde(default = "default_aggregator_workers")]
    pub aggregator_workers: usize,

    /// Capacity of every bounded channel between stages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Window interval labels, e.g. `["10s", "1h", "1d"]`.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalizer_workers: default_normalizer_workers(),
            aggregator_workers: default_aggregator_workers(),
            channel_capacity: default_channel_capacity(),
            intervals: default_intervals(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// =============================================================================
// PublishConfig
// =============================================================================

/// Where published batches go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Structured log lines only.
    #[default]
    Log,
    /// Kafka REST proxy over HTTP.
    RestProxy,
}

impl std::str::FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "rest_proxy" | "rest-proxy" | "kafka" => Ok(Self::RestProxy),
            other => bail!("unknown publish sink {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub sink: SinkKind,

    /// REST proxy endpoints, `host:port` or full URLs.
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    #[serde(default = "default_topic_daily_stats")]
    pub topic_daily_stats: String,

    #[serde(default = "default_topic_windows")]
    pub topic_windows: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_compression")]
    pub compression: String,

    /// -1 all replicas, 0 fire-and-forget, 1 leader only.
    #[serde(default = "default_required_acks")]
    pub required_acks: i32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            brokers: default_brokers(),
            topic_daily_stats: default_topic_daily_stats(),
            topic_windows: default_topic_windows(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            compression: default_compression(),
            required_acks: default_required_acks(),
            max_attempts: default_max_attempts(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl PublishConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub env: DeployEnv,

    /// Fallback filter directive when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Significance tiers; the built-in table when absent.
    #[serde(default)]
    pub significance: PriceTiers,

    #[serde(default)]
    pub publish: PublishConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: DeployEnv::default(),
            log_level: default_log_level(),
            feed: FeedConfig::default(),
            pipeline: PipelineConfig::default(),
            significance: PriceTiers::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error; the caller decides whether to fall back
    /// to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), env = %config.env, "config loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; unset keys leave values alone.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("APP_ENV") {
            self.env = v.parse()?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("FEED_URL") {
            self.feed.url = v;
        }
        if let Some(v) = get("WINDOW_INTERVALS") {
            self.pipeline.intervals = split_list(&v);
        }
        if let Some(v) = get("PUBLISH_SINK") {
            self.publish.sink = v.parse()?;
        }
        if let Some(v) = get("BROKERS") {
            self.publish.brokers = split_list(&v);
        }
        if let Some(v) = get("TOPIC_DAILY_STATS") {
            self.publish.topic_daily_stats = v;
        }
        if let Some(v) = get("TOPIC_WINDOWS") {
            self.publish.topic_windows = v;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.publish.batch_size = v
                .trim()
                .parse()
                .with_context(|| format!("BATCH_SIZE {v:?} is not an integer"))?;
        }
        if let Some(v) = get("BATCH_TIMEOUT") {
            self.publish.batch_timeout_ms = duration_ms("BATCH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("COMPRESSION") {
            self.publish.compression = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = get("ACK") {
            self.publish.required_acks = v
                .trim()
                .parse()
                .with_context(|| format!("ACK {v:?} is not an integer"))?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.publish.max_attempts = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_ATTEMPTS {v:?} is not an integer"))?;
        }
        if let Some(v) = get("WRITE_TIMEOUT") {
            self.publish.write_timeout_ms = duration_ms("WRITE_TIMEOUT", &v)?;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let feed = &self.feed;
        if feed.ping_interval_ms == 0 {
            bail!("feed.ping_interval_ms must be positive");
        }
        if feed.read_timeout_ms == 0 {
            bail!("feed.read_timeout_ms must be positive");
        }
        if feed.backoff_base_ms == 0 {
            bail!("feed.backoff_base_ms must be positive");
        }
        if feed.backoff_max_ms < feed.backoff_base_ms {
            bail!(
                "feed.backoff_max_ms ({}) is below feed.backoff_base_ms ({})",
                feed.backoff_max_ms,
                feed.backoff_base_ms
            );
        }

        if self.pipeline.normalizer_workers == 0 {
            bail!("pipeline.normalizer_workers must be at least 1");
        }
        if self.pipeline.aggregator_workers == 0 {
            bail!("pipeline.aggregator_workers must be at least 1");
        }
        if self.pipeline.channel_capacity == 0 {
            bail!("pipeline.channel_capacity must be at least 1");
        }
        if self.pipeline.sweep_interval_ms == 0 {
            bail!("pipeline.sweep_interval_ms must be positive");
        }
        self.intervals()?;
        self.significance
            .validate()
            .context("invalid significance tiers")?;

        let publish = &self.publish;
        if publish.batch_size == 0 {
            bail!("publish.batch_size must be at least 1");
        }
        if publish.batch_timeout_ms == 0 {
            bail!("publish.batch_timeout_ms must be positive");
        }
        if !COMPRESSION_CODECS.contains(&publish.compression.as_str()) {
            bail!(
                "unknown compression codec {:?} (expected one of {:?})",
                publish.compression,
                COMPRESSION_CODECS
            );
        }
        if !(-1..=1).contains(&publish.required_acks) {
            bail!("publish.required_acks must be -1, 0 or 1, got {}", publish.required_acks);
        }
        if publish.max_attempts == 0 {
            bail!("publish.max_attempts must be at least 1");
        }
        if publish.write_timeout_ms == 0 {
            bail!("publish.write_timeout_ms must be positive");
        }
        if publish.sink == SinkKind::RestProxy && publish.brokers.is_empty() {
            bail!("rest_proxy sink selected but no brokers configured");
        }
        Ok(())
    }

    /// Parsed window intervals; errors on an empty list, a bad label or a
    /// duplicate.
    pub fn intervals(&self) -> Result<Vec<Interval>> {
        if self.pipeline.intervals.is_empty() {
            bail!("pipeline.intervals must not be empty");
        }
        let mut parsed: Vec<Interval> = Vec::with_capacity(self.pipeline.intervals.len());
        for label in &self.pipeline.intervals {
            let interval = Interval::parse(label)?;
            if parsed.iter().any(|i| i.label() == interval.label()) {
                bail!("interval {label:?} listed twice");
            }
            parsed.push(interval);
        }
        Ok(parsed)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn duration_ms(key: &str, raw: &str) -> Result<u64> {
    let d = parse_duration(raw).with_context(|| format!("{key} {raw:?} is not a duration"))?;
    Ok(d.as_millis() as u64)
}
