// =============================================================================
// Window Aggregator: concurrent, self-expiring OHLCV buckets
// =============================================================================
//
// One bucket per (symbol, interval, bucket start). Buckets live in a sharded
// concurrent map; each bucket has its own lock so trades for different keys
// never contend. A separate sweep task closes buckets whose time range has
// elapsed, hands non-empty ones to the output channel and removes them.
//
// Bucket lifecycle: absent -> open -> closed -> removed. A closed bucket never
// reopens.
//
// Bucketing uses ingestion time, not the exchange timestamp, so delayed or
// reordered delivery is not corrected after the fact.
//
// Late data: once a sweep at instant T has run, any bucket ending at or
// before T is considered gone. A trade that maps to such a bucket (or finds
// its bucket already closed) is dropped and counted in `late_trades`, so no
// bucket is ever emitted twice.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::significance::{PriceTiers, SignificanceFilter, Significant};
use super::window::{Window, WindowKey, WindowState};
use crate::market_data::CanonicalEvent;
use crate::shutdown::ShutdownSignal;
use crate::types::Interval;

/// A price change large enough to pass the significance filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceMove {
    pub symbol: String,
    pub previous: Option<f64>,
    pub price: f64,
    pub change_percent: f64,
    pub observed_at: DateTime<Utc>,
}

/// Counters exposed for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub tracked_buckets: usize,
    pub ingested: u64,
    pub emitted: u64,
    pub discarded: u64,
    pub late_trades: u64,
    pub significant_moves: u64,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub emitted: usize,
    pub discarded: usize,
}

struct Bucket {
    /// Exclusive end of the bucket's time range, epoch ms.
    end_ms: i64,
    state: Mutex<WindowState>,
}

pub struct WindowAggregator {
    intervals: Vec<Interval>,
    buckets: DashMap<WindowKey, Arc<Bucket>>,
    filter: SignificanceFilter,
    output: mpsc::Sender<Window>,
    moves: Option<mpsc::Sender<PriceMove>>,
    /// `now` of the latest sweep, epoch ms.
    swept_through_ms: AtomicI64,
    ingested: AtomicU64,
    emitted: AtomicU64,
    discarded: AtomicU64,
    late_trades: AtomicU64,
    significant_moves: AtomicU64,
}

impl WindowAggregator {
    pub fn new(
        intervals: Vec<Interval>,
        tiers: PriceTiers,
        output: mpsc::Sender<Window>,
        moves: Option<mpsc::Sender<PriceMove>>,
    ) -> Self {
        Self {
            intervals,
            buckets: DashMap::new(),
            filter: SignificanceFilter::new(tiers),
            output,
            moves,
            swept_through_ms: AtomicI64::new(i64::MIN),
            ingested: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            late_trades: AtomicU64::new(0),
            significant_moves: AtomicU64::new(0),
        }
    }

    /// Fold an event into every tracked interval using the wall clock.
    pub fn ingest(&self, event: &CanonicalEvent) {
        self.ingest_at(event, Utc::now().timestamp_millis());
    }

    /// Fold an event into every tracked interval as if received at `now_ms`.
    pub fn ingest_at(&self, event: &CanonicalEvent, now_ms: i64) {
        for interval in &self.intervals {
            self.update_window(event, interval, now_ms);
        }
        self.ingested.fetch_add(1, Ordering::Relaxed);

        // Candles are updated regardless; the filter only gates move notices.
        // Without a listener there is no notice to build.
        let significant = match &self.moves {
            Some(tx) => match self.filter.check(&event.symbol, event.price) {
                Some(hit) => {
                    Self::notify_move(tx, event, hit);
                    true
                }
                None => false,
            },
            None => self.filter.is_significant(&event.symbol, event.price),
        };
        if significant {
            self.significant_moves.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn update_window(&self, event: &CanonicalEvent, interval: &Interval, now_ms: i64) -> bool {
        let start_ms = interval.bucket_start(now_ms);
        let key = WindowKey {
            symbol: event.symbol.clone(),
            interval: interval.label().to_string(),
            start_ms,
        };

        let mut created = false;
        let bucket = Arc::clone(
            self.buckets
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Bucket {
                        end_ms: interval.bucket_end(start_ms),
                        state: Mutex::new(WindowState::default()),
                    })
                })
                .value(),
        );

        {
            let mut state = bucket.state.lock();
            let swept = self.swept_through_ms.load(Ordering::Acquire);
            if !state.is_closed() && bucket.end_ms > swept {
                state.apply(event.price, event.quantity());
                if created {
                    debug!(key = %key, "window started");
                }
                return true;
            }
        }

        self.late_trades.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, price = event.price, "trade for an already swept window dropped");
        if created {
            self.buckets.remove_if(&key, |_, b| Arc::ptr_eq(b, &bucket));
        }
        false
    }

    fn notify_move(tx: &mpsc::Sender<PriceMove>, event: &CanonicalEvent, hit: Significant) {
        let notice = PriceMove {
            symbol: event.symbol.clone(),
            previous: hit.previous,
            price: event.price,
            change_percent: hit.change_percent,
            observed_at: event.timestamp,
        };
        match tx.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(m)) => {
                debug!(symbol = %m.symbol, "price move queue full, notice dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Close, emit and remove every bucket whose range ended at or before
    /// `now_ms`. Empty buckets are removed without being emitted.
    pub async fn sweep(&self, now_ms: i64) -> SweepReport {
        self.swept_through_ms.fetch_max(now_ms, Ordering::AcqRel);

        let expired: Vec<(WindowKey, Arc<Bucket>)> = self
            .buckets
            .iter()
            .filter(|entry| now_ms >= entry.value().end_ms)
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = SweepReport::default();
        for (key, bucket) in expired {
            // Snapshot under the bucket lock; once closed no writer can add to
            // it, so the lock need not be held across the send.
            let window = bucket.state.lock().close(&key, bucket.end_ms);

            match window {
                Some(window) => {
                    let trades = window.trades;
                    if self.output.send(window).await.is_ok() {
                        report.emitted += 1;
                        self.emitted.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, trades, "window emitted");
                    } else {
                        warn!(key = %key, "window consumer closed, window lost");
                        report.discarded += 1;
                        self.discarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    report.discarded += 1;
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.buckets.remove_if(&key, |_, b| Arc::ptr_eq(b, &bucket));
        }

        report
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            tracked_buckets: self.buckets.len(),
            ingested: self.ingested.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            late_trades: self.late_trades.load(Ordering::Relaxed),
            significant_moves: self.significant_moves.load(Ordering::Relaxed),
        }
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    /// Start `workers` ingest tasks sharing one event queue.
    pub fn spawn_ingest_workers(
        self: &Arc<Self>,
        workers: usize,
        events: mpsc::Receiver<CanonicalEvent>,
        shutdown: ShutdownSignal,
    ) -> Vec<JoinHandle<()>> {
        let events = Arc::new(tokio::sync::Mutex::new(events));
        info!(
            workers,
            intervals = ?self.intervals.iter().map(Interval::label).collect::<Vec<_>>(),
            "starting window aggregator"
        );

        (0..workers)
            .map(|id| {
                let agg = Arc::clone(self);
                let events = Arc::clone(&events);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.recv() => break,
                            ev = async { events.lock().await.recv().await } => ev,
                        };
                        match next {
                            Some(event) => agg.ingest(&event),
                            None => break,
                        }
                    }
                    debug!(worker = id, "aggregator ingest worker stopped");
                })
            })
            .collect()
    }

    /// Periodic sweep loop. Open buckets are not flushed on shutdown.
    pub async fn run_sweeper(self: Arc<Self>, cadence: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(Utc::now().timestamp_millis()).await;
                    if report.emitted > 0 || report.discarded > 0 {
                        debug!(
                            emitted = report.emitted,
                            discarded = report.discarded,
                            tracked = self.buckets.len(),
                            "sweep finished"
                        );
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            tracked = stats.tracked_buckets,
            emitted = stats.emitted,
            late = stats.late_trades,
            "window sweeper stopped; open windows left unflushed"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::EventDetail;

    /// 2023-11-14 22:13:20 UTC, aligned to 10 s.
    const T0: i64 = 1_700_000_000_000;

    fn trade(symbol: &str, price: f64, qty: f64) -> CanonicalEvent {
        CanonicalEvent {
            symbol: symbol.into(),
            timestamp: DateTime::from_timestamp_millis(T0).unwrap(),
            price,
            detail: EventDetail::Trade {
                quantity: qty,
                is_buyer_maker: false,
            },
        }
    }

    fn aggregator(
        labels: &[&str],
        capacity: usize,
    ) -> (Arc<WindowAggregator>, mpsc::Receiver<Window>) {
        let intervals = labels.iter().map(|l| Interval::parse(l).unwrap()).collect();
        let (tx, rx) = mpsc::channel(capacity);
        let agg = WindowAggregator::new(intervals, PriceTiers::default(), tx, None);
        (Arc::new(agg), rx)
    }

    #[tokio::test]
    async fn emitted_window_tracks_ohlc() {
        let (agg, mut rx) = aggregator(&["10s"], 8);
        let prices = [100.0, 104.0, 97.5, 101.0, 99.0];
        for (i, p) in prices.iter().enumerate() {
            agg.ingest_at(&trade("BTCUSDT", *p, 0.5), T0 + 1_000 * i as i64);
        }

        let report = agg.sweep(T0 + 10_000).await;
        assert_eq!(report, SweepReport { emitted: 1, discarded: 0 });

        let w = rx.recv().await.unwrap();
        assert_eq!(w.symbol, "BTCUSDT");
        assert_eq!(w.interval, "10s");
        assert_eq!(w.open, 100.0);
        assert_eq!(w.close, 99.0);
        assert_eq!(w.high, 104.0);
        assert_eq!(w.low, 97.5);
        assert_eq!(w.trades, 5);
        assert_eq!(w.quantity, 2.5);
        assert_eq!(w.start_time.timestamp_millis(), T0);
        assert_eq!(w.end_time.timestamp_millis(), T0 + 10_000);
        assert_eq!(agg.stats().tracked_buckets, 0);
    }

    #[tokio::test]
    async fn open_bucket_survives_early_sweep() {
        let (agg, mut rx) = aggregator(&["10s"], 8);
        agg.ingest_at(&trade("ETHUSDT", 2_000.0, 1.0), T0 + 2_000);

        assert_eq!(agg.sweep(T0 + 9_999).await, SweepReport::default());
        assert_eq!(agg.stats().tracked_buckets, 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(agg.sweep(T0 + 10_000).await.emitted, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn empty_bucket_is_removed_without_emission() {
        let (agg, mut rx) = aggregator(&["10s"], 8);
        let key = WindowKey {
            symbol: "XRPUSDT".into(),
            interval: "10s".into(),
            start_ms: T0,
        };
        agg.buckets.insert(
            key.clone(),
            Arc::new(Bucket {
                end_ms: T0 + 10_000,
                state: Mutex::new(WindowState::default()),
            }),
        );

        let report = agg.sweep(T0 + 10_000).await;
        assert_eq!(report, SweepReport { emitted: 0, discarded: 1 });
        assert!(rx.try_recv().is_err());
        assert!(!agg.buckets.contains_key(&key));
    }

    #[tokio::test]
    async fn buckets_follow_ingestion_time_and_wall_alignment() {
        let (agg, mut rx) = aggregator(&["1h"], 8);
        // Exchange timestamp is T0, but the trade is received 25 minutes into
        // the next hour.
        let hour_start = T0 - T0.rem_euclid(3_600_000) + 3_600_000;
        agg.ingest_at(&trade("BTCUSDT", 1.0, 1.0), hour_start + 25 * 60_000);

        agg.sweep(hour_start + 3_600_000).await;
        let w = rx.recv().await.unwrap();
        assert_eq!(w.start_time.timestamp_millis(), hour_start);
        assert_eq!(w.start_time.timestamp_millis() % 3_600_000, 0);
    }

    #[tokio::test]
    async fn every_interval_gets_the_trade() {
        let (agg, mut rx) = aggregator(&["10s", "1h", "1d"], 8);
        agg.ingest_at(&trade("SOLUSDT", 55.0, 3.0), T0 + 1);
        assert_eq!(agg.stats().tracked_buckets, 3);

        assert_eq!(agg.sweep(T0 + 10_000).await.emitted, 1);
        let w = rx.recv().await.unwrap();
        assert_eq!(w.interval, "10s");
        assert_eq!(agg.stats().tracked_buckets, 2);
    }

    #[tokio::test]
    async fn late_trade_after_sweep_is_dropped() {
        let (agg, mut rx) = aggregator(&["10s"], 8);
        agg.ingest_at(&trade("BTCUSDT", 10.0, 1.0), T0 + 9_000);
        agg.sweep(T0 + 10_000).await;
        assert_eq!(rx.recv().await.unwrap().trades, 1);

        // Received "before" the boundary but processed after the sweep.
        agg.ingest_at(&trade("BTCUSDT", 11.0, 1.0), T0 + 9_500);
        let stats = agg.stats();
        assert_eq!(stats.late_trades, 1);
        assert_eq!(stats.tracked_buckets, 0);

        agg.sweep(T0 + 20_000).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_writers_lose_no_updates() {
        const WRITERS: usize = 8;
        const PER_WRITER: usize = 2_500;

        let (agg, mut rx) = aggregator(&["10s"], 8);
        std::thread::scope(|s| {
            for w in 0..WRITERS {
                let agg = &agg;
                s.spawn(move || {
                    for i in 0..PER_WRITER {
                        let price = 100.0 + (w * PER_WRITER + i) as f64 * 0.001;
                        agg.ingest_at(&trade("BTCUSDT", price, 1.0), T0 + 5_000);
                    }
                });
            }
        });

        agg.sweep(T0 + 10_000).await;
        let w = rx.recv().await.unwrap();
        assert_eq!(w.trades, (WRITERS * PER_WRITER) as u64);
        assert_eq!(w.quantity, (WRITERS * PER_WRITER) as f64);
        assert_eq!(w.low, 100.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_racing_writers_emits_once_and_accounts_for_every_trade() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 5_000;

        let (agg, mut rx) = aggregator(&["10s"], 16);
        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let agg = Arc::clone(&agg);
                tokio::task::spawn_blocking(move || {
                    for _ in 0..PER_WRITER {
                        agg.ingest_at(&trade("BTCUSDT", 42.0, 1.0), T0 + 5_000);
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        agg.sweep(T0 + 10_000).await;
        for w in writers {
            w.await.unwrap();
        }
        agg.sweep(T0 + 20_000).await;

        let mut windows = Vec::new();
        while let Ok(w) = rx.try_recv() {
            windows.push(w);
        }
        assert!(windows.len() <= 1, "bucket emitted more than once");

        let emitted: u64 = windows.iter().map(|w| w.trades).sum();
        let stats = agg.stats();
        assert_eq!(emitted + stats.late_trades, (WRITERS * PER_WRITER) as u64);
        assert_eq!(stats.tracked_buckets, 0);
    }

    #[tokio::test]
    async fn significant_moves_are_reported() {
        let intervals = vec![Interval::parse("10s").unwrap()];
        let (tx, _rx) = mpsc::channel(8);
        let (move_tx, mut move_rx) = mpsc::channel(8);
        let agg = WindowAggregator::new(intervals, PriceTiers::default(), tx, Some(move_tx));

        agg.ingest_at(&trade("ABCUSDT", 5.00, 1.0), T0);
        agg.ingest_at(&trade("ABCUSDT", 5.10, 1.0), T0 + 1); // 2 %, below 3 %
        agg.ingest_at(&trade("ABCUSDT", 5.20, 1.0), T0 + 2); // 4 % from 5.00

        let first = move_rx.recv().await.unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.price, 5.00);

        let second = move_rx.recv().await.unwrap();
        assert_eq!(second.previous, Some(5.00));
        assert_eq!(second.price, 5.20);
        assert!(move_rx.try_recv().is_err());

        // Candle saw all three regardless of significance.
        agg.sweep(T0 + 10_000).await;
        assert_eq!(agg.stats().emitted, 1);
        assert_eq!(agg.stats().ingested, 3);
        assert_eq!(agg.stats().significant_moves, 2);
    }

    #[tokio::test]
    async fn significant_moves_are_counted_without_a_listener() {
        let (agg, _rx) = aggregator(&["10s"], 8);

        agg.ingest_at(&trade("ABCUSDT", 5.00, 1.0), T0);
        agg.ingest_at(&trade("ABCUSDT", 5.10, 1.0), T0 + 1);
        agg.ingest_at(&trade("ABCUSDT", 5.20, 1.0), T0 + 2);
        agg.ingest_at(&trade("XYZUSDT", 42.0, 1.0), T0 + 3);

        let stats = agg.stats();
        assert_eq!(stats.ingested, 4);
        assert_eq!(stats.significant_moves, 3);
    }

    #[tokio::test]
    async fn ingest_workers_consume_until_channel_closes() {
        let (agg, _rx) = aggregator(&["1d"], 8);
        let (ev_tx, ev_rx) = mpsc::channel(8);
        let (_trigger, signal) = crate::shutdown::channel();
        let handles = agg.spawn_ingest_workers(2, ev_rx, signal);

        for p in [1.0, 2.0, 3.0] {
            ev_tx.send(trade("ADAUSDT", p, 1.0)).await.unwrap();
        }
        drop(ev_tx);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(agg.stats().ingested, 3);
    }
}
