//! Rate-limited, circuit-broken execution of provider-facing operations.
//!
//! Fallbacks are plain closures handed to [`Resilience::call`] together with
//! the operation, so the recovery path is checked by the compiler.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Closed -> Open after `failure_threshold` consecutive failures,
/// Open -> HalfOpen once `open_duration` has elapsed,
/// HalfOpen -> Closed on a successful probe, back to Open on a failed one.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_state_change: Instant,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_state_change: Instant::now(),
            failure_threshold: failure_threshold.max(1),
            open_duration,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.last_state_change.elapsed() >= self.open_duration {
                    self.transition_to(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => self.transition_to(CircuitState::Closed),
            _ => self.failure_count = 0,
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition_to(&mut self, state: CircuitState) {
        debug!("Circuit breaker {:?} -> {:?}", self.state, state);
        self.state = state;
        self.last_state_change = Instant::now();
        if state == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

#[derive(Clone)]
pub struct Resilience {
    name: &'static str,
    limiter: Arc<DefaultDirectRateLimiter>,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl Resilience {
    pub fn new(
        name: &'static str,
        requests_per_minute: u32,
        failure_threshold: u32,
        open_duration: Duration,
    ) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(nonzero!(60u32));
        Self {
            name,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(
                failure_threshold,
                open_duration,
            ))),
        }
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().await.state()
    }

    /// Runs `op` behind the rate limiter and circuit breaker.
    ///
    /// A rate-limited call fails with [`AppError::RateLimited`] and skips the
    /// fallback. An open circuit or a failing `op` hands the error to
    /// `fallback`, whose result is returned as-is.
    pub async fn call<T, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(AppError) -> Result<T>,
    {
        if self.limiter.check().is_err() {
            warn!("Request blocked by rate limiter '{}'", self.name);
            return Err(AppError::RateLimited(self.name.to_string()));
        }

        if !self.breaker.lock().await.allow_request() {
            warn!("Circuit '{}' is open, short-circuiting", self.name);
            return fallback(AppError::CircuitOpen(self.name.to_string()));
        }

        match op().await {
            Ok(value) => {
                self.breaker.lock().await.record_success();
                Ok(value)
            }
            Err(err) => {
                let mut breaker = self.breaker.lock().await;
                breaker.record_failure();
                if breaker.state() == CircuitState::Open {
                    info!("Circuit '{}' opened", self.name);
                }
                drop(breaker);
                error!("Resilience error in '{}': {}", self.name, err);
                fallback(err)
            }
        }
    }

    /// Like [`Resilience::call`] but recovers to `T::default()` on failure.
    pub async fn call_or_default<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call(op, |_| Ok(T::default())).await
    }
}
