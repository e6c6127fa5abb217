//! Bounded-retry restart policy for a crashing backend.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RestartConfig;
use crate::connection::backoff::Backoff;

/// Tracks restarts inside a rolling window and hands out the delay before the
/// next one, or `None` once the budget is spent.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_restarts: u32,
    window: Duration,
    curve: Backoff,
    recent: VecDeque<Instant>,
    total: u32,
}

impl RestartPolicy {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.window(),
            curve: Backoff::new(config.initial_delay(), config.max_delay()),
            recent: VecDeque::new(),
            total: 0,
        }
    }

    /// Delay before restart number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.curve.delay_at(attempt.saturating_sub(1))
    }

    /// Record a crash at `now`. Returns the delay to wait before restarting, or
    /// `None` if `max_restarts` restarts already happened inside the window.
    pub fn on_crash(&mut self, now: Instant) -> Option<Duration> {
        while let Some(first) = self.recent.front() {
            if now.duration_since(*first) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        let attempt = self.recent.len() as u32 + 1;
        if attempt > self.max_restarts {
            return None;
        }
        self.recent.push_back(now);
        self.total += 1;
        Some(self.delay_for(attempt))
    }

    /// Restarts performed over the policy's lifetime.
    pub fn total_restarts(&self) -> u32 {
        self.total
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }
}
