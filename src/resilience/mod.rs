//! Failure containment: circuit breaker and retry backoff

mod backoff;
mod breaker;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState, Counts};
