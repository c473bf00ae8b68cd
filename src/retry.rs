//! Retry policy with exponential backoff and jitter.
//!
//! | Attempt | Backoff (base 500ms, cap 60s) | With jitter |
//! |---------|-------------------------------|-------------|
//! | 0       | 500ms                         | 0.5–1s      |
//! | 1       | 1s                            | 1–2s        |
//! | 2       | 2s                            | 2–4s        |
//! | 7+      | 60s                           | 60–120s     |
//!
//! Jitter is drawn uniformly from `[0, backoff]` and added on top, so jobs
//! that failed together do not come back together.

use std::time::Duration;

use rand::Rng;

use crate::config::OrchestratorConfig;
use crate::error::ErrorKind;

/// Backoff and retry-eligibility rules. Stateless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-queue cycles allowed before a job fails.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Build from validated configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// `min(base_delay * 2^attempt, max_delay)`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before a job that has been re-queued `attempt` times becomes
    /// eligible again: the backoff plus jitter in `[0, backoff]`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let span = backoff.as_millis() as u64;
        let jitter = if span == 0 {
            0
        } else {
            rand::rng().random_range(0..=span)
        };
        backoff + Duration::from_millis(jitter)
    }

    /// Whether a job that has been re-queued `attempt` times and just
    /// failed with `kind` may be re-queued again.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < self.max_retries
    }
}
