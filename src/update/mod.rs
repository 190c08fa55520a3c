//! Update/rollback controller.
//!
//! The gateway only launches and observes the runner; the runner itself is
//! a separate process (`mcapp-update-runner`) with its own HTTP surface on
//! port 2985, so a mid-update gateway restart cannot kill the deployment.

pub mod health;
pub mod runner;
pub mod slots;

pub use self::runner::{EventBus, RunnerState, GRACE_PERIOD, RUNNER_PORT};

use crate::error::{GatewayError, GatewayResult};

/// Spawn the runner through the privileged wrapper
/// (`sudo systemd-run --scope`), detached from the gateway process.
pub async fn spawn_runner(mode: &str, dev: bool) -> GatewayResult<()> {
    let layout = slots::SlotLayout::default_layout();
    let runner = layout.root().join("current/bin/mcapp-update-runner");
    if !runner.exists() {
        return Err(GatewayError::Validation(format!(
            "Update runner not found at {}",
            runner.display()
        )));
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let mut cmd = tokio::process::Command::new("sudo");
    cmd.args(["systemd-run", "--scope", "--unit=mcapp-update"])
        .arg(&runner)
        .args(["--mode", mode])
        .args(["--home", &home])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if dev {
        cmd.arg("--dev");
    }

    cmd.spawn()?;
    tracing::info!(mode, dev, "update runner launched");
    Ok(())
}
