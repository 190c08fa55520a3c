//! Standalone update runner.
//!
//! Launched by the gateway via `sudo systemd-run --scope`, or by a systemd
//! .path unit watching the update trigger file. Streams deployment output
//! over SSE on port 2985, runs health checks, auto-rolls back on failure,
//! and self-terminates after a grace period.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use clap::Parser;
use mcapp::update::runner::{run_rollback, run_update, runner_app, EventBus, RunnerState};
use mcapp::update::slots::SlotLayout;
use mcapp::update::{GRACE_PERIOD, RUNNER_PORT};
use tokio::net::TcpListener;
use tracing::info;

/// Trigger file consumed by .path activation.
const TRIGGER_FILE: &str = "/var/lib/mcapp/update-trigger";

#[derive(Debug, Parser)]
#[command(name = "mcapp-update-runner", about = "McApp slot update runner")]
struct Args {
    /// Operation mode (required unless --args-file is given)
    #[arg(long, value_parser = ["update", "rollback"])]
    mode: Option<String>,

    /// Use the development pre-release
    #[arg(long)]
    dev: bool,

    /// User home directory for the slot layout
    #[arg(long)]
    home: Option<PathBuf>,

    /// JSON file with mode/dev args (systemd .path trigger)
    #[arg(long)]
    args_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mcapp=info".parse()?),
        )
        .init();

    let mut args = Args::parse();

    // .path activation hands the arguments over as a JSON file and leaves a
    // trigger file behind; both are consumed here.
    if let Some(args_file) = &args.args_file {
        if let Ok(text) = std::fs::read_to_string(args_file) {
            let parsed: serde_json::Value = serde_json::from_str(&text)?;
            if args.mode.is_none() {
                args.mode = parsed
                    .get("mode")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .or(Some("update".to_string()));
            }
            if !args.dev {
                args.dev = parsed
                    .get("dev")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
            }
            let _ = std::fs::remove_file(args_file);
        }
        let _ = std::fs::remove_file(TRIGGER_FILE);
    }

    let Some(mode) = args.mode.clone() else {
        bail!("--mode is required (or provide --args-file)");
    };

    let home = match args.home {
        Some(home) => home,
        None => PathBuf::from(std::env::var("HOME")?),
    };
    info!(%mode, dev = args.dev, home = %home.display(), "update runner starting");

    let layout = SlotLayout::new(&home);
    layout.ensure_dirs()?;

    let state = Arc::new(RunnerState {
        bus: EventBus::new(),
        layout,
        mode: mode.clone(),
        result: Mutex::new(None),
    });

    let listener = TcpListener::bind(("0.0.0.0", RUNNER_PORT)).await?;
    info!(port = RUNNER_PORT, "runner HTTP server listening");
    let app = runner_app(state.clone());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    state.bus.publish_phase(
        "started",
        0,
        &format!("Update runner started (mode: {mode})"),
    );

    let result = if mode == "update" {
        run_update(&state, args.dev).await
    } else {
        run_rollback(&state).await
    };

    info!(result = %result, "runner finished");
    *state.result.lock().expect("result poisoned") = Some(result.clone());
    state.bus.publish("result", result.clone());

    // Grace period so connected clients can read the final result.
    tokio::time::sleep(GRACE_PERIOD).await;
    server.abort();

    if result.get("status").and_then(serde_json::Value::as_str) == Some("failed") {
        std::process::exit(1);
    }
    Ok(())
}
