//! Retry policy and error classification.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use stackbrowser_tools::StepError;

/// Classifies an error as worth retrying.
pub trait Transient {
    /// Timeouts, 5xx-equivalents and connection failures are transient.
    /// Validation failures and 4xx-equivalents are not.
    fn is_transient(&self) -> bool;
}

impl Transient for StepError {
    fn is_transient(&self) -> bool {
        StepError::is_transient(self)
    }
}

/// Retry and breaker settings for one protected operation.
///
/// Can be declared per step in a workflow definition (`retryPolicy`);
/// missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound on a single retry delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Consecutive transient failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before a trial
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `backoff_ms * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self.backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_ms, 500);
        assert_eq!(policy.max_backoff_ms, 10_000);
        assert_eq!(policy.failure_threshold, 5);
        assert_eq!(policy.reset_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"maxAttempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_ms, 500);
        assert_eq!(policy.failure_threshold, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(5), Duration::from_millis(10_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(10_000));
    }

    #[test]
    fn test_step_error_classification() {
        assert!(Transient::is_transient(&StepError::Timeout(100)));
        assert!(!Transient::is_transient(&StepError::InvalidParameters("x".into())));
    }
}
