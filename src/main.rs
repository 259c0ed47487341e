// =============================================================================
// Market Pulse: Main Entry Point
// =============================================================================
//
// Binance broadcast feed -> normalizer workers -> {window aggregator, daily
// stat extractor} -> batch publishers. Runs until Ctrl+C, then drains the
// publishers before exiting.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod backoff;
mod config;
mod error;
mod market_data;
mod publisher;
mod shutdown;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::{DailyStatExtractor, PriceMove, WindowAggregator};
use crate::config::{AppConfig, PublishConfig, SinkKind, DEFAULT_CONFIG_PATH};
use crate::market_data::{EventFanout, FeedClient, NormalizerPool};
use crate::publisher::{BatchPublisher, LogSink, RecordSink, RestProxySink};
use crate::shutdown::ShutdownSignal;
use crate::types::{DeployEnv, Interval};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let (mut config, load_error) = match AppConfig::load(&config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    config
        .apply_env_overrides()
        .context("invalid environment override")?;

    init_tracing(&config);

    if let Some(e) = load_error {
        warn!(path = %config_path, error = %format!("{e:#}"), "failed to load config, using defaults");
    }
    config.validate().context("invalid configuration")?;
    let intervals = config.intervals()?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Market Pulse: Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        env = %config.env,
        feed = %config.feed.url,
        intervals = ?intervals.iter().map(Interval::label).collect::<Vec<_>>(),
        sink = ?config.publish.sink,
        "configuration resolved"
    );

    // ── 2. Channels & shutdown ───────────────────────────────────────────
    let (trigger, shutdown) = shutdown::channel();
    let capacity = config.pipeline.channel_capacity;

    let (raw_tx, raw_rx) = mpsc::channel::<Vec<u8>>(capacity);
    let (window_events_tx, window_events_rx) = mpsc::channel(capacity);
    let (daily_events_tx, daily_events_rx) = mpsc::channel(capacity);
    let (windows_tx, windows_rx) = mpsc::channel(capacity);
    let (stats_tx, stats_rx) = mpsc::channel(capacity);
    let (moves_tx, moves_rx) = mpsc::channel(capacity);

    // ── 3. Publishers ────────────────────────────────────────────────────
    let publish = &config.publish;
    let daily_publisher = BatchPublisher::new(
        "daily_stats",
        stats_rx,
        build_sink(publish, &publish.topic_daily_stats)?,
        publish.batch_size,
        publish.batch_timeout(),
    );
    let window_publisher = BatchPublisher::new(
        "windows",
        windows_rx,
        build_sink(publish, &publish.topic_windows)?,
        publish.batch_size,
        publish.batch_timeout(),
    );
    let daily_handle = tokio::spawn(daily_publisher.run(shutdown.clone()));
    let window_handle = tokio::spawn(window_publisher.run(shutdown.clone()));

    // ── 4. Daily stats ───────────────────────────────────────────────────
    tokio::spawn(DailyStatExtractor::new(daily_events_rx, stats_tx).run(shutdown.clone()));

    // ── 5. Window aggregator ─────────────────────────────────────────────
    let aggregator = Arc::new(WindowAggregator::new(
        intervals,
        config.significance.clone(),
        windows_tx,
        Some(moves_tx),
    ));
    aggregator.spawn_ingest_workers(
        config.pipeline.aggregator_workers,
        window_events_rx,
        shutdown.clone(),
    );
    tokio::spawn(
        Arc::clone(&aggregator).run_sweeper(config.pipeline.sweep_interval(), shutdown.clone()),
    );
    tokio::spawn(log_price_moves(moves_rx, shutdown.clone()));
    tokio::spawn(log_aggregator_stats(Arc::clone(&aggregator), shutdown.clone()));

    // ── 6. Normalizer pool ───────────────────────────────────────────────
    let fanout = EventFanout::new()
        .with_target("window_aggregator", window_events_tx)
        .with_target("daily_stats", daily_events_tx);
    NormalizerPool::spawn(
        config.pipeline.normalizer_workers,
        raw_rx,
        fanout,
        shutdown.clone(),
    );

    // ── 7. Feed ──────────────────────────────────────────────────────────
    let feed_handle = tokio::spawn(FeedClient::new(config.feed.clone(), raw_tx).run(shutdown));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");
    trigger.trigger();

    let (daily, windows) = tokio::join!(daily_handle, window_handle);
    let daily = daily.context("daily stats publisher panicked")?;
    let windows = windows.context("window publisher panicked")?;
    info!(
        daily_sent = daily.messages_sent,
        daily_failed = daily.messages_failed,
        windows_sent = windows.messages_sent,
        windows_failed = windows.messages_failed,
        "publishers drained"
    );

    if let Err(e) = feed_handle.await {
        warn!(error = %e, "feed client task ended abnormally");
    }

    info!("Market Pulse shut down complete.");
    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured level. Formatter by env.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.env {
        DeployEnv::Local => builder.compact().init(),
        DeployEnv::Dev => builder.init(),
        DeployEnv::Prod => builder.json().init(),
    }
}

fn build_sink(publish: &PublishConfig, topic: &str) -> Result<Box<dyn RecordSink>> {
    Ok(match publish.sink {
        SinkKind::Log => Box::new(LogSink::new(topic)),
        SinkKind::RestProxy => Box::new(
            RestProxySink::new(publish, topic)
                .with_context(|| format!("failed to create sink for topic {topic}"))?,
        ),
    })
}

async fn log_price_moves(mut moves: mpsc::Receiver<PriceMove>, mut shutdown: ShutdownSignal) {
    loop {
        let notice = tokio::select! {
            _ = shutdown.recv() => break,
            m = moves.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        info!(
            symbol = %notice.symbol,
            previous = ?notice.previous,
            price = notice.price,
            change_pct = %format!("{:.3}", notice.change_percent),
            at = %notice.observed_at,
            "significant price move"
        );
    }
}

async fn log_aggregator_stats(aggregator: Arc<WindowAggregator>, mut shutdown: ShutdownSignal) {
    let mut interval = tokio::time::interval(STATS_LOG_INTERVAL);
    // First tick is immediate; nothing to report yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let stats = aggregator.stats();
                info!(
                    tracked = stats.tracked_buckets,
                    ingested = stats.ingested,
                    emitted = stats.emitted,
                    discarded = stats.discarded,
                    late = stats.late_trades,
                    significant = stats.significant_moves,
                    intervals = aggregator.intervals().len(),
                    "aggregator stats"
                );
            }
        }
    }
}
