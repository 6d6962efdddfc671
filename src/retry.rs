//! Retry policy applied at the HTTP page boundary.

use reqwest::StatusCode;
use std::time::Duration;

/// Explicit retry policy: bounded attempts, exponential backoff, and a fixed
/// set of retryable conditions. One policy instance is built per job run
/// from the app configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based): base * 2^attempt,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(10);
        self.base_delay
            .saturating_mul(factor as u32)
            .min(self.max_delay)
    }

    /// Server-side failures and throttling are retryable; client errors are
    /// not (re-sending the same bad request cannot succeed).
    pub fn is_retryable_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    /// Transport-level conditions worth retrying: timeouts and failures to
    /// connect. Anything else (TLS, body decode) aborts.
    pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(0), Duration::from_secs(5));
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(2), Duration::from_secs(20));
        assert_eq!(p.backoff(9), Duration::from_secs(60));
    }

    #[test]
    fn retryable_statuses() {
        assert!(RetryPolicy::is_retryable_status(
            StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(RetryPolicy::is_retryable_status(
            StatusCode::TOO_MANY_REQUESTS
        ));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::UNAUTHORIZED));
    }
}
