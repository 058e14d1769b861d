//! Lazy Pirate retry policy for bus clients.
//!
//! From zguide Chapter 4: retry a request on timeout with a fresh request id,
//! backing off between attempts, and cap the backoff so a dead peer never
//! produces hours-long delays.

use std::time::Duration;

/// Retry and timeout settings for one client.
#[derive(Debug, Clone)]
pub struct LazyPirateConfig {
    /// Timeout per request attempt
    pub timeout: Duration,
    /// Additional attempts after the first one times out
    pub max_retries: u32,
    /// Initial backoff between retries
    pub backoff_base: Duration,
    /// Maximum backoff between retries (caps exponential growth)
    pub backoff_max: Duration,
}

impl Default for LazyPirateConfig {
    fn default() -> Self {
        Self {
            // a remote call may take the full 10s mailbox wait server-side
            timeout: Duration::from_secs(15),
            max_retries: 1,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl LazyPirateConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate backoff delay for a given attempt number
    ///
    /// attempt 0: no delay
    /// attempt n: min(backoff_base * 2^(n-1), backoff_max)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        std::cmp::min(delay, self.backoff_max)
    }
}
