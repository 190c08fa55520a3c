//! The update runner: event bus, HTTP/SSE surface on port 2985, and the
//! update/rollback flows.
//!
//! Runs as a separate process spawned by the gateway through a privileged
//! wrapper. Streams bootstrap output as `log` SSE events, progress as
//! `phase` events, replays history to late joiners, and self-terminates
//! after a grace period once the final `result` is published.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::Stream;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::health::run_health_checks;
use super::slots::SlotLayout;
use crate::error::GatewayResult;

/// Fixed runner port, LAN-only.
pub const RUNNER_PORT: u16 = 2985;
/// Bootstrap ceiling.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(900);
/// Keep the server alive this long after the final result.
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// SSE event broadcaster with a replay buffer for late joiners.
pub struct EventBus {
    history: Mutex<Vec<(String, Value)>>,
    tx: broadcast::Sender<(String, Value)>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self {
            history: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Publish one event to history and every connected stream.
    pub fn publish(&self, event_type: &str, data: Value) {
        self.history
            .lock()
            .expect("history poisoned")
            .push((event_type.to_string(), data.clone()));
        let _ = self.tx.send((event_type.to_string(), data));
    }

    pub fn publish_phase(&self, phase: &str, progress: u8, message: &str) {
        self.publish(
            "phase",
            json!({"phase": phase, "progress": progress, "message": message}),
        );
    }

    pub fn publish_log(&self, phase: &str, line: &str) {
        self.publish("log", json!({"line": line, "phase": phase}));
    }

    fn subscribe(&self) -> (Vec<(String, Value)>, broadcast::Receiver<(String, Value)>) {
        let history = self.history.lock().expect("history poisoned").clone();
        (history, self.tx.subscribe())
    }
}

/// Shared state of the runner server.
pub struct RunnerState {
    pub bus: EventBus,
    pub layout: SlotLayout,
    pub mode: String,
    pub result: Mutex<Option<Value>>,
}

/// Build the runner's HTTP app: `/stream`, `/status`, `/slots`.
pub fn runner_app(state: Arc<RunnerState>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/status", get(status))
        .route("/slots", get(slots))
        .with_state(state)
}

async fn stream(
    State(state): State<Arc<RunnerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (history, rx) = state.bus.subscribe();

    struct StreamState {
        history: std::vec::IntoIter<(String, Value)>,
        rx: broadcast::Receiver<(String, Value)>,
    }

    let stream = futures::stream::unfold(
        StreamState {
            history: history.into_iter(),
            rx,
        },
        |mut s| async move {
            if let Some((event_type, data)) = s.history.next() {
                return Some((Ok(to_event(&event_type, &data)), s));
            }
            loop {
                match tokio::time::timeout(Duration::from_secs(30), s.rx.recv()).await {
                    Ok(Ok((event_type, data))) => {
                        return Some((Ok(to_event(&event_type, &data)), s));
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                    Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                    Err(_) => {
                        return Some((Ok(Event::default().comment("keepalive")), s));
                    }
                }
            }
        },
    );

    Sse::new(stream)
}

fn to_event(event_type: &str, data: &Value) -> Event {
    Event::default().event(event_type).data(data.to_string())
}

async fn status(State(state): State<Arc<RunnerState>>) -> Json<Value> {
    Json(json!({
        "mode": state.mode,
        "result": state.result.lock().expect("result poisoned").clone(),
        "slots": state.layout.all_slots(),
        "active_slot": state.layout.active_slot(),
    }))
}

async fn slots(State(state): State<Arc<RunnerState>>) -> Json<Value> {
    Json(state.layout.overview())
}

// ── Update flow ─────────────────────────────────────────────────

/// Full update cycle: pick the target slot, snapshot config, run the
/// bootstrap, swap the symlink, health-check, auto-rollback on failure.
pub async fn run_update(state: &RunnerState, dev_mode: bool) -> Value {
    let start = Instant::now();
    let bus = &state.bus;
    let layout = &state.layout;

    let active_slot = layout.active_slot();
    let target_slot = layout.oldest_slot();
    bus.publish_phase(
        "prepare",
        5,
        &format!("Target: slot-{target_slot} (active: {active_slot:?})"),
    );

    if let Some(active) = active_slot {
        bus.publish_phase("snapshot", 10, "Snapshotting config files...");
        if let Err(e) = layout.snapshot_etc(active).await {
            warn!(error = %e, "etc snapshot failed, continuing");
            bus.publish_log("snapshot", &format!("snapshot failed: {e}"));
        }
    }

    bus.publish_phase("bootstrap", 15, "Running bootstrap...");
    if let Err(e) = std::fs::create_dir_all(layout.slot_dir(target_slot)) {
        return failure(start, &format!("cannot create slot dir: {e}"));
    }

    let bootstrap = active_slot
        .map(|slot| layout.slot_dir(slot).join("bootstrap").join("mcapp.sh"))
        .filter(|path| path.exists());
    let Some(bootstrap) = bootstrap else {
        bus.publish_log("bootstrap", "No local bootstrap found");
        return failure(start, "bootstrap_missing");
    };

    match run_bootstrap_streaming(&bootstrap, dev_mode, bus).await {
        Ok(true) => {}
        Ok(false) => {
            bus.publish_phase("failed", 100, "Bootstrap failed");
            return json!({
                "status": "failed",
                "reason": "bootstrap_error",
                "duration_s": start.elapsed().as_secs(),
            });
        }
        Err(e) => return failure(start, &e.to_string()),
    }

    bus.publish_phase("activate", 80, &format!("Activating slot-{target_slot}..."));
    let version = layout
        .slot_version(target_slot)
        .unwrap_or_else(|| "unknown".to_string());
    let _ = layout.write_meta(&super::slots::SlotMeta {
        slot: target_slot,
        version: Some(version.clone()),
        status: "active".to_string(),
        deployed_at: Some(chrono::Utc::now().to_rfc3339()),
    });
    if let Err(e) = layout.swap_symlink(target_slot) {
        return failure(start, &format!("symlink swap failed: {e}"));
    }

    bus.publish_phase("health_check", 85, "Running health checks...");
    if run_health_checks(bus).await {
        bus.publish_phase("complete", 100, "Update successful");
        return json!({
            "status": "success",
            "version": version,
            "slot": target_slot,
            "duration_s": start.elapsed().as_secs(),
        });
    }

    bus.publish_phase("rollback", 90, "Health checks failed, rolling back...");
    if let Some(previous) = active_slot {
        do_rollback(layout, previous, bus).await;
        return json!({
            "status": "rolled_back",
            "reason": "health_check_failed",
            "restored_version": layout.read_meta(previous).version,
            "duration_s": start.elapsed().as_secs(),
        });
    }

    json!({
        "status": "failed",
        "reason": "health_check_failed_no_rollback_target",
        "duration_s": start.elapsed().as_secs(),
    })
}

/// Manual rollback to the most recent non-active slot.
pub async fn run_rollback(state: &RunnerState) -> Value {
    let start = Instant::now();
    let bus = &state.bus;
    let layout = &state.layout;

    let active = layout.active_slot();
    let Some(target) = layout.rollback_slot() else {
        return json!({
            "status": "failed",
            "reason": "no_rollback_target",
            "duration_s": 0,
        });
    };

    bus.publish_phase(
        "rollback",
        10,
        &format!("Rolling back slot-{active:?} → slot-{target}..."),
    );

    if let Some(active) = active {
        if let Err(e) = layout.snapshot_etc(active).await {
            warn!(error = %e, "pre-rollback snapshot failed");
        }
    }

    do_rollback(layout, target, bus).await;

    bus.publish_phase("health_check", 80, "Verifying rollback...");
    let health_ok = run_health_checks(bus).await;

    json!({
        "status": if health_ok { "success" } else { "warning" },
        "version": layout.read_meta(target).version,
        "slot": target,
        "health_ok": health_ok,
        "duration_s": start.elapsed().as_secs(),
    })
}

/// Swap to the target slot, restore its config snapshot, restart services.
async fn do_rollback(layout: &SlotLayout, target: u32, bus: &EventBus) {
    bus.publish_log("rollback", &format!("Swapping to slot-{target}"));
    if let Err(e) = layout.swap_symlink(target) {
        error!(error = %e, "rollback symlink swap failed");
        bus.publish_log("rollback", &format!("symlink swap failed: {e}"));
        return;
    }

    match layout.restore_etc(target).await {
        Ok(true) => bus.publish_log("rollback", "Restored /etc config snapshot"),
        Ok(false) => {}
        Err(e) => bus.publish_log("rollback", &format!("etc restore failed: {e}")),
    }

    bus.publish_log("rollback", "Restarting services...");
    let _ = tokio::process::Command::new("systemctl")
        .arg("daemon-reload")
        .status()
        .await;
    for service in ["lighttpd", "mcapp"] {
        let _ = tokio::process::Command::new("systemctl")
            .args(["restart", service])
            .status()
            .await;
        bus.publish_log("rollback", &format!("Restarted {service}"));
    }
}

/// Run the bootstrap script, streaming each stdout line as a `log` event.
async fn run_bootstrap_streaming(
    bootstrap: &std::path::Path,
    dev_mode: bool,
    bus: &EventBus,
) -> GatewayResult<bool> {
    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg(bootstrap).arg("--skip");
    if dev_mode {
        cmd.arg("--dev");
    }
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    info!(script = %bootstrap.display(), dev_mode, "running bootstrap");
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().expect("stdout piped");
    let mut lines = BufReader::new(stdout).lines();

    let deadline = Instant::now() + BOOTSTRAP_TIMEOUT;
    while let Some(line) = lines.next_line().await? {
        bus.publish_log("bootstrap", &strip_ansi(&line));
        if Instant::now() > deadline {
            let _ = child.kill().await;
            bus.publish_log("bootstrap", "TIMEOUT: Bootstrap exceeded 15 minutes");
            return Ok(false);
        }
    }

    let status = child.wait().await?;
    Ok(status.success())
}

/// Drop ANSI color sequences from bootstrap output.
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_strip_ansi_sequences() {
        assert_eq!(strip_ansi("\u{1b}[32mOK\u{1b}[0m done"), "OK done");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_should_replay_history_to_new_subscribers() {
        let bus = EventBus::new();
        bus.publish_phase("prepare", 5, "starting");
        bus.publish_log("bootstrap", "line one");

        let (history, _rx) = bus.subscribe();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].0, "phase");
        assert_eq!(history[1].1["line"], "line one");
    }

    #[tokio::test]
    async fn test_should_fail_rollback_without_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = SlotLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let state = RunnerState {
            bus: EventBus::new(),
            layout,
            mode: "rollback".to_string(),
            result: Mutex::new(None),
        };

        let result = run_rollback(&state).await;
        assert_eq!(result["status"], "failed");
        assert_eq!(result["reason"], "no_rollback_target");
    }
}

fn failure(start: Instant, reason: &str) -> Value {
    json!({
        "status": "failed",
        "reason": reason,
        "duration_s": start.elapsed().as_secs(),
    })
}
