use chrono::{DateTime, Utc};

use crate::types::EventKind;

/// Wire-format independent observation of one trade print or ticker snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub symbol: String,
    /// Exchange-side event time.
    pub timestamp: DateTime<Utc>,
    /// Last traded price. For ticker snapshots this is the close.
    pub price: f64,
    pub detail: EventDetail,
}

/// Fields that only exist for one kind of event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDetail {
    Trade {
        quantity: f64,
        /// Buyer was the maker, i.e. the aggressor sold.
        is_buyer_maker: bool,
    },
    Ticker {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        base_volume: f64,
        quote_volume: f64,
    },
}

impl CanonicalEvent {
    pub fn kind(&self) -> EventKind {
        match self.detail {
            EventDetail::Trade { .. } => EventKind::TradePrint,
            EventDetail::Ticker { .. } => EventKind::TickerSnapshot,
        }
    }

    /// Traded quantity; ticker snapshots carry none.
    pub fn quantity(&self) -> f64 {
        match self.detail {
            EventDetail::Trade { quantity, .. } => quantity,
            EventDetail::Ticker { .. } => 0.0,
        }
    }
}
