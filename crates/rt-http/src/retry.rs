//! Retry engine: backoff computation and retryability classification.
//! `Client::send` drives a loop around these, not the other way around, so
//! the policy itself stays free of any dependency on the transport.

use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;

use crate::error::HttpError;

/// Injectable retryability test for transport-level (non-status) failures.
/// Defaults to `HttpError::is_retryable_transport`, but callers that talk to
/// a backend with its own notion of "safe to retry" (e.g. treating a
/// particular `Io` variant as transient) can supply their own.
#[derive(Clone)]
pub struct RetryableExceptions(Rc<dyn Fn(&HttpError) -> bool>);

impl RetryableExceptions {
    pub fn new(predicate: impl Fn(&HttpError) -> bool + 'static) -> Self {
        Self(Rc::new(predicate))
    }

    fn test(&self, err: &HttpError) -> bool {
        (self.0)(err)
    }
}

impl Default for RetryableExceptions {
    fn default() -> Self {
        Self::new(HttpError::is_retryable_transport)
    }
}

impl std::fmt::Debug for RetryableExceptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RetryableExceptions(..)")
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// In `[0, 1]`; the delay is scaled by `1 + rand(0, jitter)`.
    pub jitter: f64,
    pub retryable_status_codes: HashSet<u16>,
    /// Predicate deciding whether a transport-level (non-status) error is
    /// worth retrying. Consulted by `is_retryable_error` alongside
    /// `retryable_status_codes`.
    pub retryable_exceptions: RetryableExceptions,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            retryable_status_codes: HashSet::new(),
            retryable_exceptions: RetryableExceptions::default(),
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Whether `err` should be retried: `Status` errors consult
    /// `retryable_status_codes`, everything else goes through the
    /// injectable `retryable_exceptions` predicate.
    pub fn is_retryable_error(&self, err: &HttpError) -> bool {
        match err {
            HttpError::Status { status } => self.is_retryable_status(*status),
            other => self.retryable_exceptions.test(other),
        }
    }

    /// `delay = min(max_delay, base_delay * multiplier^(attempt-1)) * (1 + rand(0, jitter))`,
    /// `attempt` being 1-indexed (the attempt that just failed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32 - 1);
        let bounded = base.min(self.max_delay.as_secs_f64());
        let jitter_factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((bounded * jitter_factor).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_geometrically_until_capped() {
        let cfg = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(500)); // capped
    }

    #[test]
    fn status_not_in_retryable_set_is_not_retried() {
        let mut cfg = RetryConfig::default();
        cfg.retryable_status_codes.insert(503);
        assert!(!cfg.is_retryable_status(404));
        assert!(cfg.is_retryable_status(503));
    }

    #[test]
    fn default_predicate_matches_is_retryable_transport() {
        let cfg = RetryConfig::default();
        assert!(cfg.is_retryable_error(&HttpError::Transport("boom".into())));
        assert!(cfg.is_retryable_error(&HttpError::Timeout(Duration::from_secs(1))));
        assert!(!cfg.is_retryable_error(&HttpError::Cancelled));
    }

    #[test]
    fn custom_predicate_overrides_the_default_transport_check() {
        let mut cfg = RetryConfig::default();
        cfg.retryable_exceptions = RetryableExceptions::new(|err| matches!(err, HttpError::Io(_)));
        assert!(!cfg.is_retryable_error(&HttpError::Transport("boom".into())));
        assert!(cfg.is_retryable_error(&HttpError::Io("disk full".into())));
    }
}
