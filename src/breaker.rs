//! Circuit breaker for isolating failing job handlers.
//!
//! One breaker guards each queue's handler invocations. After a run of
//! consecutive failures the circuit opens and calls fail fast without
//! touching the handler; once the reset timeout elapses a single probe
//! call is let through, and its outcome decides whether the circuit
//! closes again or re-opens.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

/// The observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A single trial call is permitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub error_threshold: u32,
    /// How long the circuit stays open before permitting a probe call.
    pub reset_timeout: Duration,
    /// Upper bound on a single protected call; elapse counts as a failure.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the consecutive-failure threshold.
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Sets the open-to-half-open reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit open; retry in {retry_after:?}")]
    Open {
        /// Time remaining until a probe call will be permitted.
        retry_after: Duration,
    },

    /// The operation exceeded the configured call timeout.
    #[error("call timed out after {elapsed:?}")]
    Timeout {
        /// How long the call ran before being cut off.
        elapsed: Duration,
    },

    /// The operation itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` if this error is a fast rejection from an open circuit.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure-isolation state machine guarding one queue's handler calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given name and configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Returns the breaker's name (the queue it guards).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    ///
    /// An open circuit whose reset timeout has elapsed reports
    /// [`CircuitState::HalfOpen`]: the next call will be admitted as a probe.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.reset_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Returns the current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Returns when the last failure was recorded.
    pub fn last_failure(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    /// Executes `op` through the breaker.
    ///
    /// Fails fast with [`BreakerError::Open`] when the circuit is open and
    /// the reset timeout has not elapsed. The call is bounded by the
    /// configured call timeout; elapse is recorded as a failure and
    /// surfaced as [`BreakerError::Timeout`]. Any other error from `op`
    /// increments the failure count and may open the circuit.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.admit()?;

        let started = Instant::now();
        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(&e.to_string());
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                let elapsed = started.elapsed();
                self.on_failure("call timeout");
                Err(BreakerError::Timeout { elapsed })
            }
        }
    }

    /// Admits or rejects a call, claiming the half-open probe slot if due.
    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.reset_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(circuit = %self.name, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    Err(BreakerError::Open {
                        retry_after: self.config.reset_timeout.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerError::Open {
                        retry_after: self.config.reset_timeout,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(circuit = %self.name, "circuit closed");
            }
        }
    }

    fn on_failure(&self, error: &str) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.error_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        error = %error,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.consecutive_failures += 1;
                warn!(circuit = %self.name, error = %error, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    fn reset_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned lock means a panic mid-transition; the state is a few
        // plain fields, so continuing with the inner value is sound.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_error_threshold(threshold)
                .with_reset_timeout(reset)
                .with_call_timeout(Duration::from_millis(200)),
        )
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .execute::<(), _, _, _>(|| async { Err("boom".to_string()) })
            .await;
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_calls() {
        let b = breaker(3, Duration::from_secs(30));
        assert_eq!(b.state(), CircuitState::Closed);

        let out = b
            .execute::<_, String, _, _>(|| async { Ok(41 + 1) })
            .await
            .expect("call passes");
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let b = breaker(3, Duration::from_secs(30));
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        // The operation must not run while the circuit is open.
        let invoked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invoked);
        let result = b
            .execute::<(), String, _, _>(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, Duration::from_secs(30));
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.failure_count(), 2);

        b.execute::<_, String, _, _>(|| async { Ok(()) })
            .await
            .expect("success");
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let b = breaker(2, Duration::from_millis(20));
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.execute::<_, String, _, _>(|| async { Ok(()) })
            .await
            .expect("probe passes");
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let b = breaker(2, Duration::from_millis(20));
        fail(&b).await;
        fail(&b).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        // The reset clock restarted with the failed probe.
        let result = b.execute::<(), String, _, _>(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let b = breaker(1, Duration::from_secs(30));
        let result = b
            .execute::<(), String, _, _>(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_single_probe_in_half_open() {
        let b = Arc::new(breaker(1, Duration::from_millis(10)));
        fail(&b).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First caller claims the probe slot and holds it; a second caller
        // must be rejected while the probe is in flight.
        let probe = Arc::clone(&b);
        let slow_probe = tokio::spawn(async move {
            probe
                .execute::<_, String, _, _>(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = b.execute::<(), String, _, _>(|| async { Ok(()) }).await;
        assert!(matches!(second, Err(BreakerError::Open { .. })));

        slow_probe.await.expect("join").expect("probe succeeds");
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
