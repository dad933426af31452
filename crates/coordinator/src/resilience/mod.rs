//! Retry with exponential backoff behind per-key circuit breakers.

mod breaker;
mod retry;

pub use breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState, ProtectError};
pub use retry::{RetryPolicy, Transient};
