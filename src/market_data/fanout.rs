use tokio::sync::mpsc;
use tracing::debug;

use super::event::CanonicalEvent;

/// Delivers every normalized event to each downstream consumer.
///
/// Sends are awaited, so a full consumer queue stalls the caller; that is the
/// pipeline's backpressure path back towards the feed reader.
#[derive(Clone, Default)]
pub struct EventFanout {
    targets: Vec<(&'static str, mpsc::Sender<CanonicalEvent>)>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, name: &'static str, tx: mpsc::Sender<CanonicalEvent>) -> Self {
        self.targets.push((name, tx));
        self
    }

    /// Returns how many consumers accepted the event. Zero means every
    /// consumer has gone away.
    pub async fn send(&self, event: CanonicalEvent) -> usize {
        let mut delivered = 0;
        let Some(((last_name, last_tx), rest)) = self.targets.split_last() else {
            return 0;
        };

        for (name, tx) in rest {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(consumer = name, "event consumer closed");
            }
        }
        if last_tx.send(event).await.is_ok() {
            delivered += 1;
        } else {
            debug!(consumer = last_name, "event consumer closed");
        }

        delivered
    }
}
