//! Backoff policy for transient-failure retries.

use std::time::Duration;

use thiserror::Error;

/// Default backoff ladder: 1s, 3s, 10s, then 30s for every further attempt.
pub const DEFAULT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, Error)]
pub enum RetryPolicyError {
    #[error("backoff table must not be empty")]
    EmptyBackoff,
}

/// Maps an attempt number to a wait duration.
///
/// Attempts past the end of the table reuse its last entry, so the delay is
/// non-decreasing and plateaus at the ceiling. Attempts are unbounded unless
/// `max_attempts` is set.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
    max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF.to_vec(),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        backoff: Vec<Duration>,
        max_attempts: Option<u32>,
    ) -> Result<Self, RetryPolicyError> {
        if backoff.is_empty() {
            return Err(RetryPolicyError::EmptyBackoff);
        }
        Ok(Self {
            backoff,
            max_attempts,
        })
    }

    /// Delay to wait after a failure of the delivery carrying attempt
    /// counter `attempt` (0 for a first delivery).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.backoff.len() - 1);
        self.backoff[index]
    }

    /// Whether retry number `attempt` exceeds the configured bound.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}
