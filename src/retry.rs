//! Retry policy with exponential backoff.
//!
//! The same [`RetryConfig`] drives two things: the registry connectivity check
//! at startup, and the retry policy rendered into generated sidecar listeners.
//! The gateway itself never retries forwarded calls.

use crate::error::MeshError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Conditions under which the sidecar retries a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryCondition {
    ConnectFailure,
    RefusedStream,
    Unavailable,
    Cancelled,
    RetriableStatusCodes,
}

impl RetryCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryCondition::ConnectFailure => "connect-failure",
            RetryCondition::RefusedStream => "refused-stream",
            RetryCondition::Unavailable => "unavailable",
            RetryCondition::Cancelled => "cancelled",
            RetryCondition::RetriableStatusCodes => "retriable-status-codes",
        }
    }
}

/// Backoff and retry budget.
///
/// Defaults mirror the policy written into generated listeners: three
/// retries, 250ms doubling to a 2s cap, on connection-level failures and
/// 503/504.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    pub retry_on: Vec<RetryCondition>,
    /// Status codes covered by [`RetryCondition::RetriableStatusCodes`].
    pub retriable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            use_jitter: true,
            retry_on: vec![
                RetryCondition::ConnectFailure,
                RetryCondition::RefusedStream,
                RetryCondition::Unavailable,
                RetryCondition::Cancelled,
                RetryCondition::RetriableStatusCodes,
            ],
            retriable_status_codes: vec![503, 504],
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.use_jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, conditions: Vec<RetryCondition>) -> Self {
        self.retry_on = conditions;
        self
    }

    /// Status codes the sidecar retries, empty unless
    /// [`RetryCondition::RetriableStatusCodes`] is enabled.
    pub fn sidecar_status_codes(&self) -> Vec<u16> {
        if self.retry_on.contains(&RetryCondition::RetriableStatusCodes) {
            self.retriable_status_codes.clone()
        } else {
            Vec::new()
        }
    }

    /// Comma-separated condition list in sidecar `retry_on` syntax.
    pub fn retry_on_header(&self) -> String {
        self.retry_on
            .iter()
            .map(RetryCondition::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Errors that know whether repeating the operation could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for MeshError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Registry(_)
                | MeshError::RegistryTransport(_)
                | MeshError::Timeout { .. }
                | MeshError::Io(_)
                | MeshError::Http(_)
        )
    }
}

/// Attempt counter plus delay calculation for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Retries taken so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry: `base * multiplier^attempt`, capped at
    /// `max_delay`, then scaled into `[0.5, 1.0)` when jitter is on.
    pub fn next_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let uncapped = self.config.base_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        let mut secs = uncapped.min(self.config.max_delay.as_secs_f64());
        if self.config.use_jitter {
            secs *= rand::thread_rng().gen_range(0.5..1.0);
        }
        Duration::from_secs_f64(secs)
    }

    /// Consumes one retry from the budget, returning how long to wait first.
    pub fn record_retry(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let delay = self.next_delay();
        self.attempt += 1;
        debug!(
            retry = self.attempt,
            budget = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        Some(delay)
    }
}

/// Runs a fallible async operation under a [`RetryPolicy`].
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub async fn execute<F, Fut, T, E>(&mut self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Debug + std::fmt::Display,
    {
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = if err.is_retryable() {
                self.policy.record_retry()
            } else {
                None
            };

            match delay {
                Some(delay) => {
                    warn!(
                        retry = self.policy.attempt(),
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(RetryError::Exhausted {
                        attempts: self.policy.attempt() + 1,
                        last_error: err,
                    })
                }
            }
        }
    }
}

/// Returned once an operation has failed for good.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Debug + std::fmt::Display> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E: std::fmt::Debug + std::fmt::Display> RetryError<E> {
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}
