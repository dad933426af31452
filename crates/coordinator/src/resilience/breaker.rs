//! Per-key circuit breakers and the `protect` wrapper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

use super::retry::{RetryPolicy, Transient};

/// Breaker position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Monitoring view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_for_ms: Option<u64>,
}

/// Outcome of a protected call that did not succeed.
#[derive(Debug, Error)]
pub enum ProtectError<E> {
    /// The breaker rejected the call; the operation was not invoked
    #[error("Circuit open for '{key}'")]
    CircuitOpen { key: String },

    /// The operation failed and will not be retried further
    #[error("{source} (after {attempts} attempt(s))")]
    Failed {
        #[source]
        source: E,
        attempts: u32,
    },
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    /// When the circuit opened, or when the half-open trial started
    since: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every state change. Outcomes of calls admitted under an
    /// older generation are ignored.
    generation: u64,
}

impl Breaker {
    /// Admit a call, returning the generation it runs under.
    fn admit(&mut self, policy: &RetryPolicy) -> Option<u64> {
        let reset = policy.reset_timeout();
        let elapsed = self.since.map(|t| t.elapsed()).unwrap_or_default();
        match self.state {
            CircuitState::Closed => Some(self.generation),
            CircuitState::Open if elapsed >= reset => {
                self.state = CircuitState::HalfOpen;
                Some(self.start_trial())
            }
            CircuitState::Open => None,
            // A trial abandoned mid-flight (caller dropped the future) must
            // not wedge the breaker half-open.
            CircuitState::HalfOpen if !self.trial_in_flight || elapsed >= reset => Some(self.start_trial()),
            CircuitState::HalfOpen => None,
        }
    }

    fn start_trial(&mut self) -> u64 {
        self.trial_in_flight = true;
        self.since = Some(Instant::now());
        self.generation += 1;
        self.generation
    }

    /// Returns true when this success closed the circuit.
    fn on_success(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        let closed = self.state != CircuitState::Closed;
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.since = None;
        self.trial_in_flight = false;
        if closed {
            self.generation += 1;
        }
        closed
    }

    /// Returns true when this failure opened the circuit.
    fn on_failure(&mut self, generation: u64, policy: &RetryPolicy) -> bool {
        if generation != self.generation {
            return false;
        }
        self.failures = self.failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => {
                self.open();
                true
            }
            CircuitState::Closed if self.failures >= policy.failure_threshold.max(1) => {
                self.open();
                true
            }
            _ => false,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.since = Some(Instant::now());
        self.trial_in_flight = false;
        self.generation += 1;
    }
}

/// Circuit breakers keyed by operation (one per downstream capability).
///
/// The map lock is held only for state transitions, never across the
/// protected call.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Breaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` with retries behind the breaker for `key`.
    ///
    /// `op` receives the 1-based attempt number. Transient errors are
    /// retried up to `policy.max_attempts` with exponential backoff and
    /// count toward opening the circuit. Permanent errors return at once
    /// and count as the downstream answering.
    pub async fn protect<T, E, F, Fut>(&self, key: &str, policy: &RetryPolicy, mut op: F) -> Result<T, ProtectError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let Some(generation) = self.admit(key, policy).await else {
                tracing::debug!(key = %key, "Circuit open, rejecting call");
                return Err(ProtectError::CircuitOpen { key: key.to_string() });
            };

            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    self.record_success(key, generation).await;
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    self.record_success(key, generation).await;
                    return Err(ProtectError::Failed { source: e, attempts: attempt });
                }
                Err(e) => {
                    self.record_failure(key, generation, policy).await;
                    if attempt >= max_attempts {
                        return Err(ProtectError::Failed { source: e, attempts: attempt });
                    }
                    let delay = policy.backoff(attempt - 1);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Current state of the breaker for `key`. Unknown keys are closed.
    pub async fn snapshot(&self, key: &str) -> BreakerSnapshot {
        let breakers = self.breakers.lock().await;
        match breakers.get(key) {
            Some(b) => BreakerSnapshot {
                state: b.state,
                failure_count: b.failures,
                opened_for_ms: match b.state {
                    CircuitState::Closed => None,
                    _ => b.since.map(|t| t.elapsed().as_millis() as u64),
                },
            },
            None => BreakerSnapshot {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_for_ms: None,
            },
        }
    }

    /// Close the breaker for `key`.
    pub async fn reset(&self, key: &str) {
        self.breakers.lock().await.remove(key);
    }

    async fn admit(&self, key: &str, policy: &RetryPolicy) -> Option<u64> {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(key.to_string()).or_default();
        let before = breaker.state;
        let admitted = breaker.admit(policy);
        if before == CircuitState::Open && breaker.state == CircuitState::HalfOpen {
            tracing::info!(key = %key, "Circuit half-open, allowing trial call");
        }
        admitted
    }

    async fn record_success(&self, key: &str, generation: u64) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(key) {
            if breaker.on_success(generation) {
                tracing::info!(key = %key, "Circuit closed");
            }
        }
    }

    async fn record_failure(&self, key: &str, generation: u64, policy: &RetryPolicy) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(key.to_string()).or_default();
        if breaker.on_failure(generation, policy) {
            tracing::warn!(key = %key, failures = breaker.failures, "Circuit opened");
        }
    }
}
