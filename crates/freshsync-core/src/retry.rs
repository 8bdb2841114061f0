//! Reconnect backoff for pipeline supervisors.
//!
//! The supervisor retries transient failures forever; what varies is the
//! delay between attempts. [`RetryPolicy`] holds the schedule and
//! [`Backoff`] the per-pipeline cursor into it. The supervisor resets
//! the cursor whenever a progress mark lands in a sink.

use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy, clamping the multiplier to ≥ 1.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Creates the stateful cursor for one pipeline.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            next: self.initial,
            attempts: 0,
        }
    }
}

impl Default for RetryPolicy {
    /// 1 s initial, doubling, capped at 30 s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

/// Stateful backoff cursor.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    next: Duration,
    attempts: u64,
}

impl Backoff {
    /// Returns the delay to sleep before the next attempt, advancing the
    /// schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown = delay.mul_f64(self.policy.multiplier);
        self.next = grown.min(self.policy.max);
        self.attempts += 1;
        delay
    }

    /// Resets the schedule to the initial delay.
    pub fn reset(&mut self) {
        self.next = self.policy.initial;
        self.attempts = 0;
    }

    /// Attempts taken since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}
