// =============================================================================
// Event Normalizer: raw feed bytes to canonical events
// =============================================================================
//
// Accepted shapes:
//   - `[ {miniTicker}, ... ]`                  broadcast-all ticker array
//   - `{ "stream": "...", "data": { "e": .. } }` combined-stream envelope
//   - `{ "e": "...", ... }`                     single-stream payload
//
// Per-message failures are returned as `NormalizeError`; soft drops (unknown
// tag, empty ticker, bad array element) come back as warnings next to the
// events so a batch is never lost because of one bad element.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event::{CanonicalEvent, EventDetail};
use super::fanout::EventFanout;
use super::wire::{AggTrade, Envelope, MiniTicker, WireTag};
use crate::error::NormalizeError;
use crate::shutdown::ShutdownSignal;

/// Longest slice of a raw payload echoed into a log line.
const LOG_PREVIEW_BYTES: usize = 256;

/// Output of one `normalize` call.
#[derive(Debug, Default)]
pub struct Normalized {
    pub events: Vec<CanonicalEvent>,
    pub warnings: Vec<NormalizeWarning>,
}

/// Something was dropped, but the message as a whole was usable.
#[derive(Debug)]
pub enum NormalizeWarning {
    UnknownEventType {
        tag: String,
        stream: Option<String>,
    },
    EmptyTicker {
        symbol: String,
    },
    InvalidElement {
        index: usize,
        reason: NormalizeError,
    },
    NoValidTickers {
        total: usize,
    },
}

impl std::fmt::Display for NormalizeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEventType { tag, stream } => match stream {
                Some(stream) => write!(f, "unknown event type {tag:?} on stream {stream}"),
                None => write!(f, "unknown event type {tag:?}"),
            },
            Self::EmptyTicker { symbol } => write!(f, "ticker for {symbol} has empty OHLC data"),
            Self::InvalidElement { index, reason } => {
                write!(f, "ticker array element {index} skipped: {reason}")
            }
            Self::NoValidTickers { total } => {
                write!(f, "no valid tickers in array of {total} elements")
            }
        }
    }
}

/// Turn one raw feed message into canonical events.
///
/// Pure: the same bytes always produce the same events.
pub fn normalize(raw: &[u8]) -> Result<Normalized, NormalizeError> {
    let root: Value = serde_json::from_slice(raw)?;

    match root {
        Value::Array(items) => Ok(normalize_ticker_array(items)),
        Value::Object(_) => normalize_object(root),
        _ => Err(NormalizeError::UnexpectedShape),
    }
}

fn normalize_ticker_array(items: Vec<Value>) -> Normalized {
    let total = items.len();
    let mut out = Normalized::default();
    out.events.reserve(total);

    for (index, item) in items.into_iter().enumerate() {
        let decoded = serde_json::from_value::<MiniTicker>(item)
            .map_err(|source| NormalizeError::Decode {
                kind: "24hrMiniTicker",
                source,
            })
            .and_then(convert_mini_ticker);

        match decoded {
            Ok(event) => out.events.push(event),
            Err(reason) => out
                .warnings
                .push(NormalizeWarning::InvalidElement { index, reason }),
        }
    }

    if out.events.is_empty() {
        out.warnings.push(NormalizeWarning::NoValidTickers { total });
    }

    out
}

fn normalize_object(root: Value) -> Result<Normalized, NormalizeError> {
    let (payload, stream) = if root.get("data").is_some() {
        let envelope: Envelope = serde_json::from_value(root)?;
        match envelope.data {
            Some(data @ Value::Object(_)) => (data, envelope.stream),
            _ => return Err(NormalizeError::MissingPayload),
        }
    } else if root.get("e").is_some() {
        (root, None)
    } else {
        return Err(NormalizeError::MissingPayload);
    };

    let tag = match payload.get("e") {
        None => return Err(NormalizeError::MissingEventType),
        Some(Value::String(tag)) => WireTag::from_tag(tag),
        Some(other) => return Err(NormalizeError::EventTypeNotString(other.clone())),
    };

    let mut out = Normalized::default();
    match tag {
        WireTag::AggTrade => {
            let trade: AggTrade =
                serde_json::from_value(payload).map_err(|source| NormalizeError::Decode {
                    kind: "aggTrade",
                    source,
                })?;
            out.events.push(convert_agg_trade(trade)?);
        }
        WireTag::MiniTicker => {
            let ticker: MiniTicker =
                serde_json::from_value(payload).map_err(|source| NormalizeError::Decode {
                    kind: "24hrMiniTicker",
                    source,
                })?;
            match convert_mini_ticker(ticker) {
                Ok(event) => out.events.push(event),
                Err(NormalizeError::EmptyTicker(symbol)) => {
                    out.warnings.push(NormalizeWarning::EmptyTicker { symbol })
                }
                Err(e) => return Err(e),
            }
        }
        WireTag::Unknown(tag) => {
            out.warnings
                .push(NormalizeWarning::UnknownEventType { tag, stream });
        }
    }

    Ok(out)
}

fn convert_agg_trade(trade: AggTrade) -> Result<CanonicalEvent, NormalizeError> {
    let price = parse_number("p", &trade.price)?;
    let quantity = parse_number("q", &trade.quantity)?;

    Ok(CanonicalEvent {
        timestamp: event_time(trade.event_time)?,
        symbol: trade.symbol,
        price,
        detail: EventDetail::Trade {
            quantity,
            is_buyer_maker: trade.is_buyer_maker,
        },
    })
}

fn convert_mini_ticker(ticker: MiniTicker) -> Result<CanonicalEvent, NormalizeError> {
    let close = parse_number("c", &ticker.close)?;
    let open = parse_number("o", &ticker.open)?;
    let high = parse_number("h", &ticker.high)?;
    let low = parse_number("l", &ticker.low)?;
    let base_volume = parse_number("v", &ticker.base_volume)?;
    let quote_volume = parse_number("q", &ticker.quote_volume)?;

    if open == 0.0 && high == 0.0 && low == 0.0 {
        return Err(NormalizeError::EmptyTicker(ticker.symbol));
    }

    Ok(CanonicalEvent {
        timestamp: event_time(ticker.event_time)?,
        symbol: ticker.symbol,
        price: close,
        detail: EventDetail::Ticker {
            open,
            high,
            low,
            close,
            base_volume,
            quote_volume,
        },
    })
}

fn parse_number(field: &'static str, text: &str) -> Result<f64, NormalizeError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| NormalizeError::Number {
            field,
            value: text.to_string(),
        })
}

fn event_time(ms: i64) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::from_timestamp_millis(ms).ok_or(NormalizeError::Timestamp(ms))
}

fn preview(raw: &[u8]) -> String {
    let end = raw.len().min(LOG_PREVIEW_BYTES);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Runs `workers` tasks that share one raw-message queue, normalize each
/// message and push the resulting events through the fan-out.
pub struct NormalizerPool;

impl NormalizerPool {
    pub fn spawn(
        workers: usize,
        raw_rx: mpsc::Receiver<Vec<u8>>,
        fanout: EventFanout,
        shutdown: ShutdownSignal,
    ) -> Vec<JoinHandle<()>> {
        let raw_rx = Arc::new(Mutex::new(raw_rx));
        info!(workers, "starting normalizer workers");

        (0..workers)
            .map(|id| {
                let rx = Arc::clone(&raw_rx);
                let fanout = fanout.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(id, rx, fanout, shutdown))
            })
            .collect()
    }
}

async fn run_worker(
    id: usize,
    raw_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    fanout: EventFanout,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => break,
            msg = async { raw_rx.lock().await.recv().await } => msg,
        };
        let Some(raw) = next else {
            debug!(worker = id, "raw message channel closed");
            break;
        };

        let normalized = match normalize(&raw) {
            Ok(n) => n,
            Err(e) => {
                warn!(worker = id, error = %e, raw = %preview(&raw), "failed to normalize message");
                continue;
            }
        };

        for warning in &normalized.warnings {
            warn!(worker = id, warning = %warning, "dropped part of feed message");
        }

        for event in normalized.events {
            let delivered = tokio::select! {
                _ = shutdown.recv() => return,
                n = fanout.send(event) => n,
            };
            if delivered == 0 {
                debug!(worker = id, "no event consumers left; stopping");
                return;
            }
        }
    }
    debug!(worker = id, "normalizer worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    const AGG_TRADE: &str = r#"{
        "stream": "btcusdt@aggTrade",
        "data": {
            "e": "aggTrade", "E": 1700000000123, "s": "BTCUSDT", "a": 12345,
            "p": "37000.50", "q": "0.250", "f": 100, "l": 105,
            "T": 1700000000120, "m": true, "M": true
        }
    }"#;

    fn ticker_json(symbol: &str, close: &str) -> String {
        format!(
            r#"{{"e":"24hrMiniTicker","E":1700000000000,"s":"{symbol}","c":"{close}",
               "o":"100.0","h":"110.0","l":"95.0","v":"1234.5","q":"123450.0"}}"#
        )
    }

    #[test]
    fn enveloped_agg_trade() {
        let out = normalize(AGG_TRADE.as_bytes()).expect("should parse");
        assert!(out.warnings.is_empty());
        assert_eq!(out.events.len(), 1);

        let ev = &out.events[0];
        assert_eq!(ev.symbol, "BTCUSDT");
        assert_eq!(ev.kind(), EventKind::TradePrint);
        assert!((ev.price - 37_000.5).abs() < f64::EPSILON);
        assert!((ev.quantity() - 0.25).abs() < f64::EPSILON);
        assert_eq!(ev.timestamp.timestamp_millis(), 1_700_000_000_123);
        match ev.detail {
            EventDetail::Trade { is_buyer_maker, .. } => assert!(is_buyer_maker),
            _ => panic!("expected trade detail"),
        }
    }

    #[test]
    fn enveloped_mini_ticker() {
        let raw = format!(r#"{{"stream":"ethusdt@miniTicker","data":{}}}"#, ticker_json("ETHUSDT", "105.5"));
        let out = normalize(raw.as_bytes()).unwrap();
        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.kind(), EventKind::TickerSnapshot);
        assert!((ev.price - 105.5).abs() < f64::EPSILON);
        match ev.detail {
            EventDetail::Ticker {
                open,
                high,
                low,
                close,
                base_volume,
                quote_volume,
            } => {
                assert_eq!((open, high, low, close), (100.0, 110.0, 95.0, 105.5));
                assert_eq!(base_volume, 1234.5);
                assert_eq!(quote_volume, 123_450.0);
            }
            _ => panic!("expected ticker detail"),
        }
    }

    #[test]
    fn bare_single_stream_payload() {
        let out = normalize(ticker_json("BNBUSDT", "300").as_bytes()).unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].symbol, "BNBUSDT");
    }

    #[test]
    fn broadcast_array_skips_bad_element() {
        let raw = format!(
            "[{},{},{},{}]",
            ticker_json("BTCUSDT", "37000"),
            ticker_json("ETHUSDT", "2000"),
            r#"{"e":"24hrMiniTicker","E":1700000000000,"s":"BADUSDT","c":"oops","o":"1","h":"1","l":"1","v":"1","q":"1"}"#,
            ticker_json("SOLUSDT", "55.5"),
        );
        let out = normalize(raw.as_bytes()).unwrap();

        assert_eq!(out.events.len(), 3);
        let symbols: Vec<&str> = out.events.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);

        assert_eq!(out.warnings.len(), 1);
        match &out.warnings[0] {
            NormalizeWarning::InvalidElement { index, reason } => {
                assert_eq!(*index, 2);
                assert!(matches!(reason, NormalizeError::Number { field: "c", .. }));
            }
            other => panic!("unexpected warning {other:?}"),
        }
    }

    #[test]
    fn broadcast_array_with_shape_mismatch_element() {
        let raw = format!(r#"[{}, 42, {{"s":"X"}}]"#, ticker_json("BTCUSDT", "1"));
        let out = normalize(raw.as_bytes()).unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.warnings.len(), 2);
    }

    #[test]
    fn broadcast_array_without_valid_elements() {
        let out = normalize(b"[1, 2]").unwrap();
        assert!(out.events.is_empty());
        assert!(matches!(
            out.warnings.last(),
            Some(NormalizeWarning::NoValidTickers { total: 2 })
        ));
    }

    #[test]
    fn unknown_tag_is_a_warning_not_an_error() {
        let raw = r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","s":"BTCUSDT"}}"#;
        let out = normalize(raw.as_bytes()).expect("unknown tags must not fail");
        assert!(out.events.is_empty());
        match &out.warnings[0] {
            NormalizeWarning::UnknownEventType { tag, stream } => {
                assert_eq!(tag, "bookTicker");
                assert_eq!(stream.as_deref(), Some("btcusdt@bookTicker"));
            }
            other => panic!("unexpected warning {other:?}"),
        }

        // The next message still parses.
        assert_eq!(normalize(AGG_TRADE.as_bytes()).unwrap().events.len(), 1);
    }

    #[test]
    fn unparsable_number_rejects_message() {
        let raw = AGG_TRADE.replace("\"0.250\"", "\"n/a\"");
        let err = normalize(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, NormalizeError::Number { field: "q", .. }));
    }

    #[test]
    fn non_finite_number_rejected() {
        let raw = AGG_TRADE.replace("\"37000.50\"", "\"NaN\"");
        assert!(matches!(
            normalize(raw.as_bytes()),
            Err(NormalizeError::Number { field: "p", .. })
        ));
    }

    #[test]
    fn empty_ticker_dropped_with_warning() {
        let raw = r#"{"e":"24hrMiniTicker","E":1700000000000,"s":"DEADUSDT","c":"1.0",
                      "o":"0","h":"0.00","l":"0","v":"0","q":"0"}"#;
        let out = normalize(raw.as_bytes()).unwrap();
        assert!(out.events.is_empty());
        assert!(matches!(
            &out.warnings[0],
            NormalizeWarning::EmptyTicker { symbol } if symbol == "DEADUSDT"
        ));
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(normalize(b"not json"), Err(NormalizeError::Json(_))));
        assert!(matches!(normalize(b"\"text\""), Err(NormalizeError::UnexpectedShape)));
        assert!(matches!(
            normalize(br#"{"stream":"x"}"#),
            Err(NormalizeError::MissingPayload)
        ));
        assert!(matches!(
            normalize(br#"{"data":{"s":"BTCUSDT"}}"#),
            Err(NormalizeError::MissingEventType)
        ));
        assert!(matches!(
            normalize(br#"{"data":{"e":7}}"#),
            Err(NormalizeError::EventTypeNotString(_))
        ));
        assert!(matches!(
            normalize(br#"{"data":{"e":"aggTrade","s":"BTCUSDT"}}"#),
            Err(NormalizeError::Decode { kind: "aggTrade", .. })
        ));
    }

    #[test]
    fn normalize_is_repeatable() {
        let raw = format!("[{},{}]", ticker_json("BTCUSDT", "37000.01"), ticker_json("ETHUSDT", "2000.5"));
        let first = normalize(raw.as_bytes()).unwrap();
        let second = normalize(raw.as_bytes()).unwrap();
        assert_eq!(first.events, second.events);

        let a = normalize(AGG_TRADE.as_bytes()).unwrap().events;
        let b = normalize(AGG_TRADE.as_bytes()).unwrap().events;
        assert_eq!(a[0].price.to_bits(), b[0].price.to_bits());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn pool_forwards_events_and_survives_bad_input() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let (trigger, signal) = crate::shutdown::channel();
        let fanout = EventFanout::new().with_target("test", ev_tx);
        let handles = NormalizerPool::spawn(3, raw_rx, fanout, signal);

        raw_tx.send(b"garbage".to_vec()).await.unwrap();
        raw_tx.send(AGG_TRADE.as_bytes().to_vec()).await.unwrap();

        let ev = ev_rx.recv().await.expect("event forwarded");
        assert_eq!(ev.symbol, "BTCUSDT");

        trigger.trigger();
        for h in handles {
            h.await.unwrap();
        }
    }
}
