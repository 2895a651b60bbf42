//! A three-state circuit breaker guarding connection creation.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::PoolError;

/// Configuration for a [`CircuitBreaker`].
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub exponential_backoff_factor: f64,
    pub max_reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            exponential_backoff_factor: 2.0,
            max_reset_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// The current state of a [`CircuitBreaker`], observable on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed,
    Open {
        opened_at: Instant,
        reset_timeout: Duration,
    },
    HalfOpen {
        reset_timeout: Duration,
    },
}

/// A three-state breaker (Closed/Open/HalfOpen) wrapping connection
/// creation. Only *consecutive* failures count; a success in `Closed`
/// resets the counter. Concurrency-safe.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    consecutive_failures: AtomicU32,
    trial_in_flight: std::sync::atomic::AtomicBool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed),
            consecutive_failures: AtomicU32::new(0),
            trial_in_flight: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Current state. If `Open`'s reset timeout has elapsed, this observes
    /// (and performs) the transition to `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        match *inner {
            Inner::Closed => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if let Inner::Open {
            opened_at,
            reset_timeout,
        } = *inner
        {
            if opened_at.elapsed() >= reset_timeout {
                debug!("circuit breaker reset timeout elapsed, transitioning to half-open");
                *inner = Inner::HalfOpen { reset_timeout };
            }
        }
    }

    /// Run `action` through the breaker. Fails immediately with
    /// [`PoolError::BreakerOpen`] without invoking `action` when the breaker
    /// is `Open`, or when it is `HalfOpen` with a trial already in flight.
    pub async fn call<F, Fut, T, E>(&self, action: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<PoolError>,
    {
        let is_trial = {
            let mut inner = self.inner.lock();
            self.maybe_transition_to_half_open(&mut inner);
            match *inner {
                Inner::Open { .. } => return Err(PoolError::BreakerOpen),
                Inner::HalfOpen { .. } => {
                    if self
                        .trial_in_flight
                        .compare_exchange(
                            false,
                            true,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        return Err(PoolError::BreakerOpen);
                    }
                    true
                }
                Inner::Closed => false,
            }
        };

        let result = action().await;

        if is_trial {
            self.trial_in_flight.store(false, Ordering::Release);
        }

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err.into())
            }
        }
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let mut inner = self.inner.lock();
        if !matches!(*inner, Inner::Closed) {
            debug!("circuit breaker trial succeeded, closing");
        }
        *inner = Inner::Closed;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.max_failures {
                    warn!(
                        failures,
                        max_failures = self.config.max_failures,
                        "circuit breaker tripped, opening"
                    );
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                        reset_timeout: self.config.reset_timeout,
                    };
                }
            }
            Inner::HalfOpen { reset_timeout } => {
                let next_timeout = Duration::from_secs_f64(
                    (reset_timeout.as_secs_f64() * self.config.exponential_backoff_factor)
                        .min(self.config.max_reset_timeout.as_secs_f64()),
                );
                warn!(
                    next_timeout_secs = next_timeout.as_secs_f64(),
                    "circuit breaker trial failed, reopening with backoff"
                );
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                    reset_timeout: next_timeout,
                };
            }
            Inner::Open { .. } => {
                // A stray failure report for an action that raced the
                // breaker opening; nothing to do.
            }
        }
    }

    /// Force `Closed` and clear counters.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        *self.inner.lock() = Inner::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Boom;
    impl From<Boom> for PoolError {
        fn from(_: Boom) -> Self {
            PoolError::ValidationFailure("boom".into())
        }
    }

    fn breaker(max_failures: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            max_failures,
            reset_timeout,
            exponential_backoff_factor: 2.0,
            max_reset_timeout: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn opens_after_max_consecutive_failures() {
        let cb = breaker(3, Duration::from_millis(50));
        for _ in 0..3 {
            let _ = cb.call(|| async { Err::<(), Boom>(Boom) }).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);

        let calls = Arc::new(Counter::new(0));
        let calls2 = calls.clone();
        let result = cb
            .call(move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Boom>(())
                }
            })
            .await;
        assert!(matches!(result, Err(PoolError::BreakerOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "action must not run while open");
    }

    #[tokio::test]
    async fn allows_a_trial_after_reset_timeout_and_closes_on_success() {
        let cb = breaker(1, Duration::from_millis(20));
        let _ = cb.call(|| async { Err::<(), Boom>(Boom) }).await;
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = cb.call(|| async { Ok::<_, Boom>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_in_closed_resets_the_failure_counter() {
        let cb = breaker(3, Duration::from_secs(30));
        let _ = cb.call(|| async { Err::<(), Boom>(Boom) }).await;
        let _ = cb.call(|| async { Ok::<_, Boom>(()) }).await;
        let _ = cb.call(|| async { Err::<(), Boom>(Boom) }).await;
        let _ = cb.call(|| async { Err::<(), Boom>(Boom) }).await;
        // Only 2 consecutive failures since the reset; breaker stays closed.
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn manual_reset_forces_closed() {
        let cb = breaker(1, Duration::from_secs(30));
        let _ = cb.call(|| async { Err::<(), Boom>(Boom) }).await;
        assert_eq!(cb.state(), BreakerState::Open);
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
