// =============================================================================
// Batch Publisher: size/time triggered flushing to a record sink
// =============================================================================
//
// One publisher per record stream. Records are stamped with a message id on
// arrival and buffered; the buffer is flushed when it reaches `batch_size` or
// when `batch_timeout` passes, whichever comes first. On shutdown, records
// already queued on the input channel are drained, the partial batch is
// flushed and only then is the sink closed.
//
// A failed flush is counted and logged; its records are not retried here
// (the sink owns retries) and the buffer is cleared either way.
// =============================================================================

use std::marker::PhantomData;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use super::message::{OutboundMessage, OutboundRecord};
use super::sink::RecordSink;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub batches_sent: u64,
}

pub struct BatchPublisher<R> {
    name: &'static str,
    input: mpsc::Receiver<R>,
    sink: Box<dyn RecordSink>,
    batch_size: usize,
    batch_timeout: Duration,
    buffer: Vec<OutboundMessage>,
    stats: PublisherStats,
    _record: PhantomData<fn() -> R>,
}

impl<R: OutboundRecord> BatchPublisher<R> {
    pub fn new(
        name: &'static str,
        input: mpsc::Receiver<R>,
        sink: Box<dyn RecordSink>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            name,
            input,
            sink,
            batch_size,
            batch_timeout,
            buffer: Vec::with_capacity(batch_size),
            stats: PublisherStats::default(),
            _record: PhantomData,
        }
    }

    /// Run until shutdown or until the input channel closes; returns the
    /// final counters.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> PublisherStats {
        info!(
            publisher = self.name,
            backend = self.sink.backend_type(),
            batch_size = self.batch_size,
            batch_timeout_ms = self.batch_timeout.as_millis() as u64,
            "starting batch publisher"
        );

        let timer = sleep(self.batch_timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                record = self.input.recv() => {
                    let Some(record) = record else { break };
                    self.push(record);
                    if self.buffer.len() >= self.batch_size {
                        self.flush().await;
                        timer.as_mut().reset(Instant::now() + self.batch_timeout);
                    }
                }

                _ = &mut timer => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                    timer.as_mut().reset(Instant::now() + self.batch_timeout);
                }
            }
        }

        // Whatever is already queued still goes out.
        while let Ok(record) = self.input.try_recv() {
            self.push(record);
            if self.buffer.len() >= self.batch_size {
                self.flush().await;
            }
        }
        if !self.buffer.is_empty() {
            self.flush().await;
        }

        if let Err(e) = self.sink.close().await {
            error!(publisher = self.name, error = %e, "failed to close sink");
        }

        info!(
            publisher = self.name,
            sent = self.stats.messages_sent,
            failed = self.stats.messages_failed,
            batches = self.stats.batches_sent,
            "batch publisher stopped"
        );
        self.stats
    }

    fn push(&mut self, record: R) {
        match record.to_message() {
            Ok(msg) => self.buffer.push(msg),
            Err(e) => {
                self.stats.messages_failed += 1;
                error!(publisher = self.name, key = record.key(), error = %e, "could not encode record");
            }
        }
    }

    async fn flush(&mut self) {
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let started = Instant::now();

        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                self.stats.messages_sent += batch.len() as u64;
                self.stats.batches_sent += 1;
                debug!(
                    publisher = self.name,
                    batch_size = batch.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    sent = self.stats.messages_sent,
                    batches = self.stats.batches_sent,
                    "batch sent"
                );
            }
            Err(e) => {
                self.stats.messages_failed += batch.len() as u64;
                error!(
                    publisher = self.name,
                    batch_size = batch.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "failed to send batch"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::DailyStat;
    use crate::error::PublishError;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Records every batch it is handed.
    #[derive(Clone, Default)]
    struct MemorySink {
        batches: Arc<Mutex<Vec<Vec<OutboundMessage>>>>,
        closed: Arc<AtomicBool>,
        fail: bool,
    }

    impl MemorySink {
        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn write_batch(&mut self, batch: &[OutboundMessage]) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::NoEndpoints);
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), PublishError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "memory"
        }
    }

    fn stat(symbol: &str) -> DailyStat {
        DailyStat {
            symbol: symbol.into(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            quote_volume: 15.0,
            timestamp: Utc::now(),
        }
    }

    fn publisher(
        sink: &MemorySink,
        batch_size: usize,
        timeout: Duration,
    ) -> (mpsc::Sender<DailyStat>, BatchPublisher<DailyStat>) {
        let (tx, rx) = mpsc::channel(64);
        let p = BatchPublisher::new("daily_stats", rx, Box::new(sink.clone()), batch_size, timeout);
        (tx, p)
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_batch_is_full() {
        let sink = MemorySink::default();
        let (tx, p) = publisher(&sink, 3, Duration::from_secs(3_600));
        let (trigger, signal) = crate::shutdown::channel();
        let task = tokio::spawn(p.run(signal));

        for i in 0..7 {
            tx.send(stat(&format!("S{i}USDT"))).await.unwrap();
        }
        tokio::task::yield_now().await;
        trigger.trigger();
        let stats = task.await.unwrap();

        assert_eq!(sink.sizes(), vec![3, 3, 1]);
        assert_eq!(stats.messages_sent, 7);
        assert_eq!(stats.batches_sent, 3);
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_partial_batch_on_timer() {
        let sink = MemorySink::default();
        let (tx, p) = publisher(&sink, 100, Duration::from_secs(2));
        let (_trigger, signal) = crate::shutdown::channel();
        let _task = tokio::spawn(p.run(signal));

        tx.send(stat("BTCUSDT")).await.unwrap();
        tx.send(stat("ETHUSDT")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(sink.sizes().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.sizes(), vec![2]);

        let keys: Vec<String> = sink.batches.lock()[0].iter().map(|m| m.key.clone()).collect();
        assert_eq!(keys, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_sends_nothing() {
        let sink = MemorySink::default();
        let (_tx, p) = publisher(&sink, 10, Duration::from_secs(2));
        let (trigger, signal) = crate::shutdown::channel();
        let task = tokio::spawn(p.run(signal));

        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        let stats = task.await.unwrap();
        assert!(sink.sizes().is_empty());
        assert_eq!(stats, PublisherStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queue_then_closes_sink() {
        let sink = MemorySink::default();
        let (tx, p) = publisher(&sink, 50, Duration::from_secs(3_600));
        let (trigger, signal) = crate::shutdown::channel();

        // Queued before the publisher ever runs.
        for i in 0..5 {
            tx.send(stat(&format!("S{i}USDT"))).await.unwrap();
        }
        trigger.trigger();
        let stats = p.run(signal).await;

        assert_eq!(sink.sizes(), vec![5]);
        assert_eq!(stats.messages_sent, 5);
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_flushes_and_stops() {
        let sink = MemorySink::default();
        let (tx, p) = publisher(&sink, 50, Duration::from_secs(3_600));
        let (_trigger, signal) = crate::shutdown::channel();

        tx.send(stat("BTCUSDT")).await.unwrap();
        drop(tx);
        let stats = p.run(signal).await;
        assert_eq!(stats.messages_sent, 1);
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batches_are_counted() {
        let sink = MemorySink {
            fail: true,
            ..MemorySink::default()
        };
        let (tx, p) = publisher(&sink, 2, Duration::from_secs(3_600));
        let (_trigger, signal) = crate::shutdown::channel();

        for s in ["A", "B", "C"] {
            tx.send(stat(s)).await.unwrap();
        }
        drop(tx);
        let stats = p.run(signal).await;
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_failed, 3);
        assert_eq!(stats.batches_sent, 0);
    }
}
