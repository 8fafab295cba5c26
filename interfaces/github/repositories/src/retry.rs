use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_RATE_LIMIT_BUFFER: Duration = Duration::from_secs(1);
pub const DEFAULT_RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60 * 60);

/// How long to keep trying a page before giving up on it.
///
/// Transient failures draw from a bounded exponential backoff. Rate-limit
/// waits are computed separately and never consume that budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for transient failures, including the first one.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
    /// Added on top of the signalled reset time.
    pub rate_limit_buffer: Duration,
    /// Used when the remote says "slow down" without saying until when.
    pub rate_limit_fallback: Duration,
    /// Upper bound for a single rate-limit wait.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: false,
            rate_limit_buffer: DEFAULT_RATE_LIMIT_BUFFER,
            rate_limit_fallback: DEFAULT_RATE_LIMIT_FALLBACK,
            max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Fresh delay sequence for one page; yields `max_attempts - 1` delays.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1));

        if self.jitter {
            builder = builder.with_jitter();
        }

        builder.build()
    }

    /// Time to suspend before re-issuing a rate-limited request.
    pub fn rate_limit_wait(&self, now: DateTime<Utc>, reset_at: Option<DateTime<Utc>>) -> Duration {
        let wait = match reset_at {
            Some(reset_at) => (reset_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .saturating_add(self.rate_limit_buffer),
            None => self.rate_limit_fallback,
        };

        wait.min(self.max_rate_limit_wait)
    }
}
