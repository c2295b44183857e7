//! Retry policy applied to launch failures and non-zero exits
//! (spec.md §4.2, §7).
//!
//! Grounded on the teacher's `HttpClient::calculate_backoff`/retry loop
//! (`api/client.rs`): exponential backoff computed per attempt (reset each
//! attempt, not accumulated across the whole budget — see SPEC_FULL.md §20),
//! capped at a maximum delay, with jitter.

use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;

use crate::error::XecError;

/// A predicate deciding whether a given error/exit should be retried.
pub type ErrorPredicate = std::sync::Arc<dyn Fn(&XecError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryConfig {
    pub times: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
    pub predicate: Option<ErrorPredicate>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("times", &self.times)
            .field("backoff", &self.backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter", &self.jitter)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            times: 0,
            backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            jitter: true,
            predicate: None,
        }
    }
}

impl RetryConfig {
    /// Exponential delay for `attempt` (0-indexed), reset per attempt as
    /// decided in SPEC_FULL.md §20, mirroring
    /// `HttpClient::calculate_backoff` but built on the `backoff` crate's
    /// `ExponentialBackoff` instead of hand-rolled math.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut b = ExponentialBackoff {
            initial_interval: self.backoff,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            randomization_factor: if self.jitter { 0.25 } else { 0.0 },
            multiplier: 2.0,
            ..ExponentialBackoff::default()
        };
        // ExponentialBackoff only exposes the *next* interval via repeated
        // `.next_backoff()` calls, so replay attempt+1 steps from a fresh
        // backoff to get a value that depends solely on `attempt`.
        let mut delay = b.next_backoff().unwrap_or(self.backoff);
        for _ in 0..attempt {
            delay = b.next_backoff().unwrap_or(self.max_backoff);
        }
        delay.min(self.max_backoff)
    }

    /// Whether this error on this attempt should trigger a retry, honouring
    /// the "never retry ValidationError/InvalidState/Cancelled" rule
    /// (spec.md §7). Launch failures are retried up to `times` regardless of
    /// a predicate; a non-zero exit (`CommandError`) is only retried when a
    /// predicate is configured and returns true for it (spec.md §4.2
    /// "retries are applied only to launch failures and to non-zero exits
    /// when nothrow is false and a user-supplied predicate returns true").
    pub fn should_retry(&self, attempt: u32, error: &XecError) -> bool {
        if attempt >= self.times {
            return false;
        }
        if !error.is_retryable() {
            return false;
        }
        if matches!(error, XecError::Command(_)) {
            return self.predicate.as_ref().is_some_and(|p| p(error));
        }
        match &self.predicate {
            Some(p) => p(error),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let cfg = RetryConfig { jitter: false, ..RetryConfig::default() };
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(800));
        let capped = cfg.delay_for_attempt(20);
        assert_eq!(capped, cfg.max_backoff);
    }

    #[test]
    fn never_retries_validation_or_cancelled() {
        let cfg = RetryConfig { times: 5, ..RetryConfig::default() };
        assert!(!cfg.should_retry(0, &XecError::Validation("bad".into())));
        assert!(!cfg.should_retry(0, &XecError::Cancelled));
        assert!(!cfg.should_retry(0, &XecError::InvalidState("launched".into())));
    }

    fn command_error() -> XecError {
        let now = chrono::Utc::now();
        XecError::Command(Box::new(crate::result::ExecutionResult {
            stdout: String::new(),
            stderr: String::new(),
            combined: String::new(),
            exit_code: Some(1),
            signal: None,
            duration_ms: 0,
            started_at: now,
            finished_at: now,
            command: "exit 1".to_string(),
            adapter_kind: "local".to_string(),
            piped_from: None,
        }))
    }

    #[test]
    fn non_zero_exit_is_not_retried_without_a_predicate() {
        let cfg = RetryConfig { times: 3, ..RetryConfig::default() };
        assert!(!cfg.should_retry(0, &command_error()));
    }

    #[test]
    fn non_zero_exit_is_retried_only_when_the_predicate_says_so() {
        let cfg = RetryConfig {
            times: 3,
            predicate: Some(std::sync::Arc::new(|e| matches!(e, XecError::Command(_)))),
            ..RetryConfig::default()
        };
        assert!(cfg.should_retry(0, &command_error()));
    }

    #[test]
    fn launch_failures_are_retried_without_a_predicate() {
        let cfg = RetryConfig { times: 3, ..RetryConfig::default() };
        assert!(cfg.should_retry(0, &XecError::AdapterUnavailable("no docker".into())));
    }

    #[test]
    fn stops_once_attempt_budget_exhausted() {
        let cfg = RetryConfig { times: 2, ..RetryConfig::default() };
        let err = XecError::Timeout(Duration::from_secs(1));
        assert!(cfg.should_retry(0, &err));
        assert!(cfg.should_retry(1, &err));
        assert!(!cfg.should_retry(2, &err));
    }
}
