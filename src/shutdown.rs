//! Process-wide shutdown signal shared by every long-running task.

use tokio::sync::watch;

/// Sending half; flipping it to `true` (or dropping it) stops all tasks.
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Receiving half, cheap to clone into each task.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Every receiver may already be gone; nothing to do then.
        let _ = self.0.send(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested or the trigger was dropped.
    pub async fn recv(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
