//! Circuit breaker guarding a single downstream call path.
//!
//! Three states:
//! - **Closed**: calls flow through; consecutive failures are counted
//! - **Open**: calls fail fast without invoking the operation
//! - **HalfOpen**: one trial call at a time; enough successes close the circuit
//!
//! The Open to HalfOpen transition is evaluated lazily at the top of
//! [`CircuitBreaker::execute`]; no timer fires it.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => f.write_str("CLOSED"),
            State::Open => f.write_str("OPEN"),
            State::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening the circuit
    pub failure_threshold: u64,
    /// Time after the last failure before a trial call is allowed
    pub reset_timeout: Duration,
    /// Consecutive successes in HalfOpen before closing
    pub success_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u64) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }
}

/// Failure surfaced by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit breaker {name} is open")]
    Open { name: String },
    /// The operation exceeded the budget passed to `execute_with_timeout`.
    #[error("circuit breaker {name}: operation timed out after {duration_ms}ms")]
    Timeout { name: String, duration_ms: u64 },
    /// The operation itself failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: u64,
    success_count: u64,
    last_failure: Option<Instant>,
    /// A HalfOpen trial call is running; others fail fast until it ends.
    trial_in_flight: bool,
}

/// Frees the HalfOpen trial slot when the admitted call ends or is dropped.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.breaker.inner.lock().trial_in_flight = false;
    }
}

/// Serializable view of a breaker, used by the stats and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: State,
    pub failure_count: u64,
    pub success_count: u64,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejected: u64,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds until an Open circuit admits a trial call.
    pub next_attempt_in_ms: Option<u64>,
}

/// Circuit breaker for preventing cascading failures.
///
/// # Example
///
/// ```
/// use rust_meshplane::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let cb = CircuitBreaker::new("payments", CircuitBreakerConfig::default());
///
///     let result = cb.execute(|| async { Ok::<_, std::io::Error>("paid") }).await;
///     assert!(result.is_ok());
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `op` unless the circuit is open.
    ///
    /// The breaker never retries; an `Err` from `op` is recorded and returned.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _trial = self.admit::<E>()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Like [`execute`](Self::execute) but bounds `op` by `budget`; a timeout counts as a failure.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        budget: Duration,
        op: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _trial = self.admit::<E>()?;
        match tokio::time::timeout(budget, op()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                Err(CircuitBreakerError::Timeout {
                    name: self.name.clone(),
                    duration_ms: budget.as_millis() as u64,
                })
            }
        }
    }

    /// Lazy state guard evaluated on every call attempt.
    ///
    /// In HalfOpen only one call is admitted at a time; the returned guard
    /// holds that slot.
    fn admit<E>(&self) -> Result<Option<TrialGuard<'_>>, CircuitBreakerError<E>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.state == State::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true);
            if !elapsed {
                drop(inner);
                return Err(self.reject("circuit open, failing fast"));
            }
            inner.state = State::HalfOpen;
            inner.success_count = 0;
            inner.trial_in_flight = false;
            info!(breaker = %self.name, "circuit half-open");
        }
        if inner.state != State::HalfOpen {
            return Ok(None);
        }
        if inner.trial_in_flight {
            drop(inner);
            return Err(self.reject("trial call in flight, failing fast"));
        }
        inner.trial_in_flight = true;
        Ok(Some(TrialGuard { breaker: self }))
    }

    fn reject<E>(&self, reason: &'static str) -> CircuitBreakerError<E> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(breaker = %self.name, reason);
        CircuitBreakerError::Open {
            name: self.name.clone(),
        }
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => inner.failure_count = 0,
            State::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            // A call admitted before the circuit opened.
            State::Open => {}
        }
    }

    fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = State::Open;
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.success_count = 0;
                warn!(breaker = %self.name, "trial call failed, circuit re-opened");
            }
            State::Open => {}
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let since_failure = inner.last_failure.map(|t| t.elapsed());
        let next_attempt_in_ms = match (inner.state, since_failure) {
            (State::Open, Some(elapsed)) => Some(
                self.config
                    .reset_timeout
                    .saturating_sub(elapsed)
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_failure_ms_ago: since_failure.map(|d| d.as_millis() as u64),
            next_attempt_in_ms,
        }
    }

    /// Forces the circuit closed and clears the counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }
}

/// Breakers keyed by protected target, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `name`, creating it with `config` if absent.
    ///
    /// The config of an existing breaker is left untouched.
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut out: Vec<CircuitBreakerSnapshot> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
