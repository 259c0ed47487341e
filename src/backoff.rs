// =============================================================================
// Exponential backoff
// =============================================================================
//
// Delay starts at `base`, doubles after every failure and is capped at `max`.
// Callers reset it once an attempt succeeds.
// =============================================================================

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    /// Failures seen since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
