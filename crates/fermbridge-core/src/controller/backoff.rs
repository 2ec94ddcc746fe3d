//! Reconnect backoff

use std::time::Duration;

/// Capped multiplicative backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt
    pub base: Duration,
    /// Growth factor between attempts
    pub factor: u32,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// Backoff state for one session
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let multiplier = self
            .policy
            .factor
            .max(1)
            .checked_pow(self.attempt)
            .unwrap_or(u32::MAX);
        let delay = self
            .policy
            .base
            .checked_mul(multiplier)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Back to baseline after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
