// =============================================================================
// Daily-Stat Extractor: 24h ticker snapshots to flat daily records
// =============================================================================

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::market_data::{CanonicalEvent, EventDetail};
use crate::shutdown::ShutdownSignal;

/// Rolling 24h statistics for one symbol, as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyStat {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base-asset volume.
    pub volume: f64,
    pub quote_volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl DailyStat {
    /// Absolute change over the 24h window.
    pub fn change_price(&self) -> f64 {
        self.close - self.open
    }

    /// Relative change in percent; `None` when the open is zero.
    pub fn change_percent(&self) -> Option<f64> {
        (self.open != 0.0).then(|| (self.close - self.open) / self.open * 100.0)
    }

    /// `+1.23%`, `-0.50%`, or `N/A` when there is no open price.
    pub fn change_formatted(&self) -> String {
        match self.change_percent() {
            Some(p) if p >= 0.0 => format!("+{p:.2}%"),
            Some(p) => format!("{p:.2}%"),
            None => "N/A".to_string(),
        }
    }
}

/// Map a ticker snapshot to its daily stat. Trade prints yield `None`.
pub fn extract(event: &CanonicalEvent) -> Option<DailyStat> {
    match event.detail {
        EventDetail::Ticker {
            open,
            high,
            low,
            close,
            base_volume,
            quote_volume,
        } => Some(DailyStat {
            symbol: event.symbol.clone(),
            open,
            high,
            low,
            close,
            volume: base_volume,
            quote_volume,
            timestamp: event.timestamp,
        }),
        EventDetail::Trade { .. } => None,
    }
}

pub struct DailyStatExtractor {
    input: mpsc::Receiver<CanonicalEvent>,
    output: mpsc::Sender<DailyStat>,
}

impl DailyStatExtractor {
    pub fn new(input: mpsc::Receiver<CanonicalEvent>, output: mpsc::Sender<DailyStat>) -> Self {
        Self { input, output }
    }

    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("starting daily stat extractor");
        let mut processed: u64 = 0;

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                ev = self.input.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            let Some(stat) = extract(&event) else {
                debug!(symbol = %event.symbol, kind = %event.kind(), "skipping non-ticker event");
                continue;
            };

            info!(
                symbol = %stat.symbol,
                close = stat.close,
                change_24h = %stat.change_formatted(),
                "daily stat processed"
            );

            if self.output.send(stat).await.is_err() {
                info!("daily stat consumer closed");
                break;
            }
            processed += 1;
        }

        info!(processed, "daily stat extractor stopped");
    }
}
