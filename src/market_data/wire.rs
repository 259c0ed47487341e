// =============================================================================
// Exchange wire shapes
// =============================================================================
//
// Binance sends every price and quantity as a JSON string so that the
// exchange-side formatting survives; conversion to f64 happens in the
// normalizer so a bad field can be reported by name.

use serde::Deserialize;

/// Combined-stream envelope: `{ "stream": "btcusdt@aggTrade", "data": {...} }`.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub stream: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// `aggTrade` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// `24hrMiniTicker` payload, also the element type of `!miniTicker@arr`.
#[derive(Debug, Clone, Deserialize)]
pub struct MiniTicker {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub base_volume: String,
    #[serde(rename = "q")]
    pub quote_volume: String,
}

/// Event-type tag found in the payload's `e` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireTag {
    AggTrade,
    MiniTicker,
    Unknown(String),
}

impl WireTag {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "aggTrade" => Self::AggTrade,
            "24hrMiniTicker" => Self::MiniTicker,
            other => Self::Unknown(other.to_string()),
        }
    }
}
