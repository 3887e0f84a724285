//! Retry pacing for actor-driven connect attempts.
//!
//! Classic doubling backoff: 1s, 2s, 4s, ... capped at five minutes.
//! Separate from the state manager's eligibility clock; this one decides
//! how long the actor sleeps before re-queueing a Connect command.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Pacing for connect retries: 1 second base, 5 minute cap.
    pub fn connect_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    /// Delay to sleep before the next attempt; advances the counter.
    pub fn next(&mut self) -> Duration {
        let multiplier = 2u64.saturating_pow(self.attempt);
        let delay_ms = (self.base.as_millis() as u64)
            .saturating_mul(multiplier)
            .min(self.cap.as_millis() as u64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay_ms)
    }

    /// Forget failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed so far (0-indexed before the first `next`).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
