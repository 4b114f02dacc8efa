//! Admission and failure-isolation gates in front of the tunnel.
//!
//! - `rate_limiter`: token bucket, one per identity
//! - `circuit_breaker`: closed/open/half-open gate around a protected call
//! - `validator`: IP allow-list, size, rate limit and header checks composed
//!   into a single admission decision

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod validator;

pub use circuit_breaker::{CircuitBreaker, CircuitError, CircuitState};
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use validator::{IpAllowList, RequestValidator, ValidationError};
