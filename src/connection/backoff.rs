use std::time::Duration;

/// Reconnect delay curve: `initial`, doubling per failed attempt, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempts: 0,
        }
    }

    /// Delay after `failures` previous failures, without advancing the curve.
    pub fn delay_at(&self, failures: u32) -> Duration {
        self.initial
            .checked_mul(1u32 << failures.min(31))
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before the next attempt; advances the curve.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_at(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
