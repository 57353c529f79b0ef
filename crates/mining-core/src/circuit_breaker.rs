//! Circuit breaker guarding a flaky external dependency.
//!
//! ```text
//! Closed --[failures >= threshold]--> Open
//! Open --[cooldown elapsed, next call]--> HalfOpen
//! HalfOpen --[trial succeeds]--> Closed
//! HalfOpen --[trial fails]--> Open (timestamp reset)
//! ```
//!
//! All state (status, failure count, open timestamp, cached value) lives
//! behind one mutex so it is never observed in a torn combination. The lock
//! is never held while the guarded operation runs.

use crate::{MiningError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit (default: 3)
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call (default: 30s)
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner<T> {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    cached: Option<T>,
}

/// Circuit breaker with last-good-value cache
#[derive(Debug)]
pub struct CircuitBreaker<T> {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner<T>>,
}

/// Admission ticket for one guarded call. Releases a half-open trial slot
/// if the call is dropped before it settles.
struct Permit<'a, T> {
    breaker: &'a CircuitBreaker<T>,
    trial: bool,
    settled: bool,
}

impl<T> Drop for Permit<'_, T> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl<T: Clone> CircuitBreaker<T> {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            ..config
        };
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
                cached: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Last successful result, regardless of the current state
    pub fn get_cached(&self) -> Option<T> {
        self.inner.lock().cached.clone()
    }

    /// Force the circuit closed and clear the failure count. The cache is kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Run `operation` under breaker protection.
    ///
    /// While open, fails immediately with [`MiningError::CircuitOpen`] without
    /// invoking `operation`. A [`MiningError::Cancelled`] result is neither a
    /// success nor a failure of the dependency and leaves the counters alone.
    pub async fn execute<F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.admit()?;

        let result = operation().await;

        match &result {
            Ok(value) => self.record_success(value.clone()),
            Err(MiningError::Cancelled) => {}
            Err(_) => self.record_failure(),
        }
        if !matches!(result, Err(MiningError::Cancelled)) {
            permit.settled = true;
        }

        result
    }

    fn admit(&self) -> Result<Permit<'_, T>> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);

                if !cooled_down {
                    return Err(MiningError::CircuitOpen(self.name.clone()));
                }

                info!("Circuit breaker {} transitioning to half-open", self.name);
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(MiningError::CircuitOpen(self.name.clone()));
                }
                inner.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
        }
    }

    fn record_success(&self, value: T) {
        let mut inner = self.inner.lock();

        inner.cached = Some(value);
        inner.failures = 0;
        inner.trial_in_flight = false;

        if inner.state != CircuitState::Closed {
            info!("Circuit breaker {} closed after successful trial", self.name);
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();

        inner.failures = inner.failures.saturating_add(1);
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker {} opened after {} consecutive failures",
                        self.name, inner.failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker {} trial failed, reopening", self.name);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker<String> {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker<String>, calls: &AtomicUsize) -> Result<String> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MiningError::Connection("refused".to_string()))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker<String>, calls: &AtomicUsize, value: &str) -> Result<String> {
        let value = value.to_string();
        cb.execute(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
        .await
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.get_cached().is_none());
    }

    #[tokio::test]
    async fn test_success_caches_and_resets() {
        let cb = breaker(3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.failure_count(), 1);

        let value = succeed(&cb, &calls, "v6.21.0").await.unwrap();
        assert_eq!(value, "v6.21.0");
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.get_cached().as_deref(), Some("v6.21.0"));
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_calls() {
        let cb = breaker(5, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        succeed(&cb, &calls, "v1.0.0").await.unwrap();

        for _ in 0..5 {
            assert!(matches!(fail(&cb, &calls).await, Err(MiningError::Connection(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let result = fail(&cb, &calls).await;
        assert!(matches!(result, Err(MiningError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        assert_eq!(cb.get_cached().as_deref(), Some("v1.0.0"));
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let cb = breaker(1, Duration::from_millis(30));
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = succeed(&cb, &calls, "v2").await.unwrap();
        assert_eq!(value, "v2");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(30));
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(fail(&cb, &calls).await, Err(MiningError::Connection(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        // Open timestamp was reset, so the next call is rejected again
        assert!(matches!(fail(&cb, &calls).await, Err(MiningError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let cb = Arc::new(breaker(1, Duration::from_millis(10)));
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok("ok".to_string())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&cb, &calls, "other").await, Err(MiningError::CircuitOpen(_))));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "ok");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_does_not_count() {
        let cb = breaker(1, Duration::from_secs(60));
        let result = cb.execute(|| async { Err(MiningError::Cancelled) }).await;
        assert!(matches!(result, Err(MiningError::Cancelled)));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb, &calls, "v3").await.is_ok());
    }
}
