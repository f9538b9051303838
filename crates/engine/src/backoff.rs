//! Exponential retry backoff.
//!
//! After an attempt fails transiently, the next one waits
//! `base * 2^attempt_count`, capped at `cap`.

use std::time::Duration;

/// Capped exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the next attempt, given how many attempts were made so far.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        2u32.checked_pow(attempt_count)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
