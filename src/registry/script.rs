//! Local script health checks.
//!
//! A script check runs a shell command on a fixed interval and pushes the
//! outcome to the registry's TTL check. Failures to run the command are
//! reported as critical; the next tick retries without backoff.

use super::model::HealthState;
use super::RegistryBackend;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

const MAX_OUTPUT_BYTES: usize = 4096;

/// Result of one script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptOutcome {
    pub status: HealthState,
    pub output: String,
}

fn truncate(mut output: String) -> String {
    if output.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
    }
    output
}

/// Runs `command` through `sh -c`; exit status 0 is passing.
pub(crate) async fn run_script(command: &str, budget: Duration) -> ScriptOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match timeout(budget, child).await {
        Ok(Ok(out)) => {
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if out.status.success() {
                ScriptOutcome {
                    status: HealthState::Passing,
                    output: truncate(stdout),
                }
            } else {
                let detail = if stderr.is_empty() { stdout } else { stderr };
                ScriptOutcome {
                    status: HealthState::Critical,
                    output: truncate(format!("{}: {}", out.status, detail)),
                }
            }
        }
        Ok(Err(e)) => ScriptOutcome {
            status: HealthState::Critical,
            output: format!("failed to run check script: {}", e),
        },
        Err(_) => ScriptOutcome {
            status: HealthState::Critical,
            output: format!("check script timed out after {}ms", budget.as_millis()),
        },
    }
}

/// Spawns the polling loop for one instance's script check.
///
/// The first run happens immediately. The returned handle is aborted on
/// deregistration.
pub(crate) fn spawn_script_poller(
    backend: Arc<dyn RegistryBackend>,
    instance_id: String,
    check_id: String,
    command: String,
    every: Duration,
    budget: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let outcome = run_script(&command, budget).await;
            debug!(
                instance = %instance_id,
                status = outcome.status.as_str(),
                "script check completed"
            );
            if outcome.status != HealthState::Passing {
                warn!(
                    instance = %instance_id,
                    output = %outcome.output,
                    "script check failing"
                );
            }
            if let Err(e) = backend
                .update_check(&check_id, outcome.status, &outcome.output)
                .await
            {
                warn!(instance = %instance_id, error = %e, "failed to push script check result");
            }
        }
    })
}
