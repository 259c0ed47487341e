//! Outbound record shapes: what the broker actually receives.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregator::{DailyStat, Window};
use crate::error::PublishError;

/// A record the batch publisher knows how to route and serialise.
pub trait OutboundRecord: Send + 'static {
    /// Partition key. Always the symbol, so one symbol stays on one partition.
    fn key(&self) -> &str;

    fn timestamp(&self) -> DateTime<Utc>;

    /// JSON body carrying `message_id`.
    fn to_payload(&self, message_id: Uuid) -> Result<serde_json::Value, serde_json::Error>;

    /// Stamp a fresh message id and build the wire message.
    fn to_message(&self) -> Result<OutboundMessage, PublishError> {
        let message_id = Uuid::new_v4();
        Ok(OutboundMessage {
            message_id,
            key: self.key().to_string(),
            timestamp: self.timestamp(),
            payload: self.to_payload(message_id)?,
        })
    }
}

/// One keyed, self-describing message ready for a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Daily stats
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DailyStatMessage<'a> {
    pub message_id: Uuid,
    pub symbol: &'a str,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub change_price_money: f64,
    /// `null` when the 24h open is zero.
    pub change_price_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl<'a> DailyStatMessage<'a> {
    pub fn new(stat: &'a DailyStat, message_id: Uuid) -> Self {
        Self {
            message_id,
            symbol: &stat.symbol,
            open_price: stat.open,
            high_price: stat.high,
            low_price: stat.low,
            close_price: stat.close,
            volume: stat.volume,
            quote_volume: stat.quote_volume,
            change_price_money: stat.change_price(),
            change_price_percent: stat.change_percent(),
            timestamp: stat.timestamp,
        }
    }
}

impl OutboundRecord for DailyStat {
    fn key(&self) -> &str {
        &self.symbol
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn to_payload(&self, message_id: Uuid) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(DailyStatMessage::new(self, message_id))
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct WindowMessage<'a> {
    pub message_id: Uuid,
    pub symbol: &'a str,
    pub interval: &'a str,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub quantity: f64,
    pub trades: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl OutboundRecord for Window {
    fn key(&self) -> &str {
        &self.symbol
    }

    /// Windows are stamped with their close time.
    fn timestamp(&self) -> DateTime<Utc> {
        self.end_time
    }

    fn to_payload(&self, message_id: Uuid) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(WindowMessage {
            message_id,
            symbol: &self.symbol,
            interval: &self.interval,
            open_price: self.open,
            high_price: self.high,
            low_price: self.low,
            close_price: self.close,
            quantity: self.quantity,
            trades: self.trades,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> DailyStat {
        DailyStat {
            symbol: "ETHUSDT".into(),
            open: 2_000.0,
            high: 2_100.0,
            low: 1_950.0,
            close: 2_050.0,
            volume: 10.0,
            quote_volume: 20_500.0,
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        }
    }

    #[test]
    fn daily_stat_message_carries_change_and_id() {
        let msg = stat().to_message().unwrap();
        assert_eq!(msg.key, "ETHUSDT");
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_000);

        let p = &msg.payload;
        assert_eq!(p["message_id"], msg.message_id.to_string());
        assert_eq!(p["symbol"], "ETHUSDT");
        assert_eq!(p["close_price"], 2_050.0);
        assert_eq!(p["change_price_money"], 50.0);
        assert_eq!(p["change_price_percent"], 2.5);
    }

    #[test]
    fn zero_open_serialises_null_percent() {
        let mut s = stat();
        s.open = 0.0;
        let msg = s.to_message().unwrap();
        assert!(msg.payload["change_price_percent"].is_null());
    }

    #[test]
    fn every_message_gets_its_own_id() {
        let s = stat();
        let a = s.to_message().unwrap();
        let b = s.to_message().unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn window_message_includes_range() {
        let w = Window {
            symbol: "BTCUSDT".into(),
            interval: "1h".into(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            quantity: 3.0,
            trades: 4,
            start_time: DateTime::from_timestamp_millis(1_699_999_200_000).unwrap(),
            end_time: DateTime::from_timestamp_millis(1_700_002_800_000).unwrap(),
        };
        let msg = w.to_message().unwrap();
        assert_eq!(msg.key, "BTCUSDT");
        assert_eq!(msg.timestamp, w.end_time);
        assert_eq!(msg.payload["interval"], "1h");
        assert_eq!(msg.payload["trades"], 4);
        assert!(msg.payload["start_time"].is_string());
    }
}
