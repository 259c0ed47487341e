// =============================================================================
// Shared types used across the market-pulse pipeline
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Deployment flavour. Controls the log formatter only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployEnv {
    Local,
    Dev,
    Prod,
}

impl Default for DeployEnv {
    fn default() -> Self {
        Self::Local
    }
}

impl std::fmt::Display for DeployEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

impl std::str::FromStr for DeployEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => bail!("unknown deployment env {other:?}"),
        }
    }
}

/// The two kinds of observation the feed delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TradePrint,
    TickerSnapshot,
}

impl EventKind {
    /// Event-type tag the exchange puts in the `e` field.
    pub fn wire_tag(&self) -> &'static str {
        match self {
            Self::TradePrint => "aggTrade",
            Self::TickerSnapshot => "24hrMiniTicker",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_tag())
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// A candle granularity: the label it is published under plus its length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interval {
    label: String,
    duration: Duration,
}

impl Interval {
    /// Parse a label such as `10s`, `1h` or `1d`.
    pub fn parse(label: &str) -> Result<Self> {
        let label = label.trim();
        let duration =
            parse_duration(label).with_context(|| format!("invalid interval label {label:?}"))?;
        if duration.as_millis() == 0 {
            bail!("interval {label:?} must be longer than zero");
        }
        Ok(Self {
            label: label.to_string(),
            duration,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn millis(&self) -> i64 {
        self.duration.as_millis() as i64
    }

    /// Truncate `now_ms` (epoch milliseconds, UTC) down to the start of the
    /// bucket that contains it. Boundaries are aligned to the Unix epoch, so an
    /// hourly bucket always starts at the top of the hour.
    pub fn bucket_start(&self, now_ms: i64) -> i64 {
        now_ms - now_ms.rem_euclid(self.millis())
    }

    /// End (exclusive) of the bucket that starts at `start_ms`.
    pub fn bucket_end(&self, start_ms: i64) -> i64 {
        start_ms + self.millis()
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Parse a compact duration string: `250ms`, `2s`, `5m`, `1h`, `1d`.
/// A bare integer is read as seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        bail!("empty duration");
    }

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("duration {text:?} has no numeric part"))?;

    let unit_ms: u64 = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => bail!("unknown duration unit {other:?} in {text:?}"),
    };
    // Bucket arithmetic runs on signed epoch milliseconds.
    let millis = value
        .checked_mul(unit_ms)
        .filter(|ms| *ms <= i64::MAX as u64)
        .with_context(|| format!("duration {text:?} is too large"))?;

    Ok(Duration::from_millis(millis))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
