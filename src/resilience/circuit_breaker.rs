//! Three-state circuit breaker.
//!
//! - **Closed**: calls pass through, consecutive failures are counted
//! - **Open**: calls fail immediately with [`CircuitError::Open`]
//! - **Half-open**: exactly one trial call is let through
//!
//! `Open → HalfOpen` is evaluated lazily on the next call once the cool-down
//! has elapsed since the last failure. Bookkeeping happens under a short
//! synchronous lock; the protected call itself runs unlocked.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// How a call was admitted; decides how its outcome is accounted.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// reporting an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state as last recorded. Does not perform the lazy
    /// `Open → HalfOpen` transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Run `f` through the breaker, counting any `Err` as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(f, Result::is_ok).await
    }

    /// Run `f` through the breaker; `is_success` classifies the outcome, so an
    /// `Ok` carrying e.g. an HTTP 5xx can still count as a failure.
    pub async fn call_with<F, Fut, T, E, P>(&self, f: F, is_success: P) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&Result<T, E>) -> bool,
    {
        let permit = self.acquire().ok_or(CircuitError::Open)?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: permit == Permit::Trial,
        };

        let result = f().await;
        let success = is_success(&result);
        guard.armed = false;
        self.record(permit, success);

        result.map_err(CircuitError::Inner)
    }

    fn acquire(&self) -> Option<Permit> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.open_timeout);
                if !cooled {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(name = %self.name, "Circuit breaker half-open");
                Some(Permit::Trial)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Permit::Trial)
                }
            }
        }
    }

    fn record(&self, permit: Permit, success: bool) {
        let mut inner = self.lock();
        match (permit, inner.state) {
            (Permit::Trial, _) => {
                inner.trial_in_flight = false;
                if success {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.last_failure = None;
                    info!(name = %self.name, "Circuit breaker closed");
                } else {
                    inner.state = CircuitState::Open;
                    inner.failures = inner.failures.saturating_add(1);
                    inner.last_failure = Some(Instant::now());
                    warn!(name = %self.name, "Circuit breaker re-opened after failed trial");
                }
            }
            (Permit::Normal, CircuitState::Closed) => {
                if success {
                    inner.failures = 0;
                    return;
                }
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                if inner.failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        name = %self.name,
                        failures = inner.failures,
                        "Circuit breaker opened"
                    );
                }
            }
            // Admitted while closed but finished after the breaker tripped:
            // the trial decides recovery, not stragglers.
            (Permit::Normal, _) => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
