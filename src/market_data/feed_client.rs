// =============================================================================
// Feed Client: exchange WebSocket to raw byte buffers
// =============================================================================
//
// Owns the socket: connects, forwards every data frame to the raw channel,
// pings on a fixed cadence and treats `read_timeout` of silence as a dead
// connection. Reconnects with exponential backoff until shutdown.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::FeedConfig;
use crate::shutdown::ShutdownSignal;

/// How a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Disconnected,
}

pub struct FeedClient {
    config: FeedConfig,
    output: mpsc::Sender<Vec<u8>>,
}

impl FeedClient {
    pub fn new(config: FeedConfig, output: mpsc::Sender<Vec<u8>>) -> Self {
        Self { config, output }
    }

    /// Run until shutdown, reconnecting whenever the session drops.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut backoff = Backoff::new(self.config.backoff_base(), self.config.backoff_max());
        info!(url = %self.config.url, "starting feed client");

        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.run_session(&mut backoff, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => {
                    warn!(url = %self.config.url, "feed disconnected");
                }
                Err(e) => {
                    error!(url = %self.config.url, error = %e, "feed session failed");
                }
            }

            let delay = backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "reconnecting feed"
            );
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("feed client stopped");
    }

    async fn run_session(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut ShutdownSignal,
    ) -> Result<SessionEnd> {
        info!(url = %self.config.url, "connecting to feed WebSocket");
        let (ws_stream, _response) = connect_async(self.config.url.as_str())
            .await
            .context("failed to connect to feed WebSocket")?;

        info!(url = %self.config.url, "feed WebSocket connected");
        backoff.reset();

        let (mut write, mut read) = ws_stream.split();
        let mut ping = interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it.
        ping.tick().await;

        let read_timeout = self.config.read_timeout();
        let mut deadline = Instant::now() + read_timeout;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }

                _ = ping.tick() => {
                    debug!("sending ping");
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("failed to send ping")?;
                }

                _ = sleep_until(deadline) => {
                    warn!(
                        timeout_ms = read_timeout.as_millis() as u64,
                        "no data from feed within read deadline"
                    );
                    return Ok(SessionEnd::Disconnected);
                }

                frame = read.next() => {
                    // Any inbound frame, pongs included, proves the link is alive.
                    deadline = Instant::now() + read_timeout;

                    match frame {
                        Some(Ok(msg)) => {
                            if let Some(bytes) = frame_payload(msg) {
                                // Awaited: a full queue stalls the socket read.
                                if self.output.send(bytes).await.is_err() {
                                    info!("raw message consumer closed");
                                    return Ok(SessionEnd::Shutdown);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            return Err(e).context("feed WebSocket read error");
                        }
                        None => return Ok(SessionEnd::Disconnected),
                    }
                }
            }
        }
    }
}

/// Extract the payload of a data frame. Control frames are handled by
/// tungstenite (pongs are queued automatically) and yield nothing.
fn frame_payload(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Ping(_) => {
            debug!("ping from exchange");
            None
        }
        Message::Pong(_) => {
            debug!("pong from exchange");
            None
        }
        Message::Close(frame) => {
            info!(frame = ?frame, "close frame from exchange");
            None
        }
        Message::Frame(_) => None,
    }
}

/// Binance broadcast stream of every symbol's 24h mini ticker.
pub const DEFAULT_FEED_URL: &str = "wss://stream.binance.com:9443/ws/!miniTicker@arr";
