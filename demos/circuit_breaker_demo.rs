//! Circuit breaker demonstration.
//!
//! Drives a breaker through CLOSED, OPEN, HALF_OPEN and back using a
//! simulated upstream call, including a timed-out call.
//!
//! Run with:
//! ```bash
//! cargo run --example circuit_breaker_demo
//! ```

use rust_meshplane::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug)]
struct UpstreamDown;

impl std::fmt::Display for UpstreamDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("upstream refused the connection")
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    info!("Circuit Breaker Demonstration");

    let config = CircuitBreakerConfig::default()
        .with_failure_threshold(3)
        .with_reset_timeout(Duration::from_secs(2))
        .with_success_threshold(2);

    info!(
        failure_threshold = config.failure_threshold,
        reset_timeout = ?config.reset_timeout,
        success_threshold = config.success_threshold,
        "configuration"
    );

    let cb = CircuitBreaker::new("payment-service", config);

    info!("Scenario 1: consecutive failures open the circuit");
    for i in 1..=3 {
        match cb.execute(|| simulate_call(false)).await {
            Ok(()) => info!("  call #{} succeeded", i),
            Err(e) => warn!("  call #{} failed: {}", i, e),
        }
    }
    info!("state: {}", cb.state());
    assert_eq!(cb.state(), State::Open);

    info!("Scenario 2: calls fail fast while open");
    match cb.execute(|| simulate_call(true)).await {
        Err(CircuitBreakerError::Open { name }) => warn!("  rejected by breaker {}", name),
        other => info!("  unexpected outcome: {:?}", other.is_ok()),
    }

    info!("Scenario 3: after the reset timeout a probe is let through");
    sleep(Duration::from_secs(2)).await;
    for i in 1..=2 {
        if cb.execute(|| simulate_call(true)).await.is_ok() {
            info!("  probe #{} succeeded, state: {}", i, cb.state());
        }
    }
    assert_eq!(cb.state(), State::Closed);

    info!("Scenario 4: a slow call counts as a failure");
    cb.reset();
    let slow = cb
        .execute_with_timeout(Duration::from_millis(50), || async {
            sleep(Duration::from_millis(200)).await;
            Ok::<_, UpstreamDown>(())
        })
        .await;
    if let Err(e) = slow {
        warn!("  {}", e);
    }

    info!("Scenario 5: a failed probe reopens the circuit");
    for _ in 0..2 {
        let _ = cb.execute(|| simulate_call(false)).await;
    }
    sleep(Duration::from_secs(2)).await;
    let _ = cb.execute(|| simulate_call(false)).await;
    info!("state after failed probe: {}", cb.state());
    assert_eq!(cb.state(), State::Open);

    let stats = cb.snapshot();
    info!(
        requests = stats.requests,
        successes = stats.successes,
        failures = stats.failures,
        timeouts = stats.timeouts,
        rejected = stats.rejected,
        "final statistics"
    );
    info!("Demo complete!");
}

/// Simulates an upstream call with configurable success/failure.
async fn simulate_call(success: bool) -> Result<(), UpstreamDown> {
    sleep(Duration::from_millis(10)).await;
    if success {
        Ok(())
    } else {
        Err(UpstreamDown)
    }
}
