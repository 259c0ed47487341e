use chrono::{DateTime, Utc};

/// Identity of one bucket: symbol, interval label and bucket start.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct WindowKey {
    pub symbol: String,
    pub interval: String,
    /// Bucket start, epoch milliseconds.
    pub start_ms: i64,
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.interval, self.start_ms / 1_000)
    }
}

/// A closed OHLCV candle as handed to the output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub symbol: String,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Cumulative base-asset quantity.
    pub quantity: f64,
    pub trades: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Mutable accumulator behind each bucket's lock.
///
/// Prices are `Option` so that "not observed yet" is never confused with a
/// genuine zero price.
#[derive(Debug, Default)]
pub(crate) struct WindowState {
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    quantity: f64,
    trades: u64,
    /// Set once the sweep has taken this bucket; later writers must not touch it.
    closed: bool,
}

impl WindowState {
    /// Fold one observation into the bucket.
    pub(crate) fn apply(&mut self, price: f64, quantity: f64) {
        if self.open.is_none() {
            self.open = Some(price);
        }
        self.close = Some(price);
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.quantity += quantity;
        self.trades += 1;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the bucket closed and, if it saw at least one trade, produce the
    /// candle to emit.
    pub(crate) fn close(
        &mut self,
        key: &WindowKey,
        end_ms: i64,
    ) -> Option<Window> {
        self.closed = true;

        let (open, high, low, close) = match (self.open, self.high, self.low, self.close) {
            (Some(o), Some(h), Some(l), Some(c)) if self.trades > 0 => (o, h, l, c),
            _ => return None,
        };

        Some(Window {
            symbol: key.symbol.clone(),
            interval: key.interval.clone(),
            open,
            high,
            low,
            close,
            quantity: self.quantity,
            trades: self.trades,
            start_time: DateTime::from_timestamp_millis(key.start_ms).unwrap_or_default(),
            end_time: DateTime::from_timestamp_millis(end_ms).unwrap_or_default(),
        })
    }
}
