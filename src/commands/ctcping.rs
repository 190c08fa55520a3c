//! Ping test state machine (`!ctcping`).
//!
//! For each of K pings the engine sends a padded payload, records the send
//! time by sequence, waits for the node's echo (our own text coming back
//! with a trailing `{NNN`, which yields the ACK id), and then for the
//! target's ACK (`:ackNNN`). Per-ping timeout is 30 s, the whole test times
//! out after 5 minutes. Completion is guarded so duplicate ACKs can never
//! produce a second summary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info};

use super::registry::ParsedCommand;
use super::CommandEngine;
use crate::domain;
use crate::error::GatewayResult;
use crate::message::{MeshMessage, OutboundMessage};
use crate::router::{RouterEvent, Topic};

/// Per-ping ACK timeout.
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-test ceiling.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(300);
/// Gap between consecutive pings.
const PING_GAP: Duration = Duration::from_secs(20);
/// Payload bounds, bytes.
const PAYLOAD_RANGE: (usize, usize) = (25, 140);
/// Repeat bounds.
const REPEAT_RANGE: (u32, u32) = (1, 5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Running,
    Completing,
    Completed,
    Timeout,
    Error,
}

/// A single in-flight ping, keyed by its 3-digit echo id.
#[derive(Debug, Clone)]
pub struct ActivePing {
    pub target: String,
    pub requester: String,
    pub sequence: String,
    pub sent_at: Instant,
    pub test_id: Option<String>,
    pub ack_processed: bool,
}

#[derive(Debug, Clone)]
pub struct PingResult {
    pub sequence: String,
    pub rtt: Option<Duration>,
}

/// One running test; test id = target + start time.
#[derive(Debug)]
pub struct PingTest {
    pub target: String,
    pub requester: String,
    pub total_pings: u32,
    pub payload_size: usize,
    pub results: Vec<PingResult>,
    pub completed: u32,
    pub timeouts: u32,
    pub status: TestStatus,
    pub send_times: HashMap<String, Instant>,
    pub completed_sequences: HashSet<String>,
}

/// All ping state, engine-private.
#[derive(Debug, Default)]
pub struct PingState {
    pub active: HashMap<String, ActivePing>,
    pub tests: HashMap<String, PingTest>,
    completions: HashSet<String>,
}

impl PingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.tests.clear();
        self.completions.clear();
    }

    fn running_test_for_target(&self, target: &str) -> Option<String> {
        self.tests
            .iter()
            .find(|(_, t)| t.target == target && t.status == TestStatus::Running)
            .map(|(id, _)| id.clone())
    }

    /// Marks the test as completing exactly once.
    fn claim_completion(&mut self, test_id: &str) -> bool {
        self.completions.insert(test_id.to_string())
    }
}

impl CommandEngine {
    /// `!ctcping call:X payload:N repeat:K` — start a ping test.
    pub(crate) async fn handle_ctcping(
        &self,
        parsed: &ParsedCommand,
        requester: &str,
    ) -> GatewayResult<String> {
        let target = parsed.arg("call").unwrap_or("").to_uppercase();
        if target.is_empty() {
            return Ok("❌ Target callsign required (call:TARGET)".to_string());
        }
        if !domain::is_strict_callsign(&target) {
            return Ok("❌ Invalid target callsign format".to_string());
        }
        if target == self.my_callsign {
            return Ok("❌ Cannot ping yourself".to_string());
        }
        if self.is_callsign_banned(&target) {
            return Ok(format!("❌ Target {target} is blocked"));
        }

        let payload_size: usize = match parsed.arg("payload").unwrap_or("25").parse() {
            Ok(n) if (PAYLOAD_RANGE.0..=PAYLOAD_RANGE.1).contains(&n) => n,
            Ok(_) => return Ok("❌ Payload size must be between 25 and 140 bytes".to_string()),
            Err(_) => return Ok("❌ Invalid payload size".to_string()),
        };
        let repeat: u32 = match parsed.arg("repeat").unwrap_or("1").parse() {
            Ok(n) if (REPEAT_RANGE.0..=REPEAT_RANGE.1).contains(&n) => n,
            Ok(_) => return Ok("❌ Repeat count must be between 1 and 5 pings".to_string()),
            Err(_) => return Ok("❌ Invalid repeat count".to_string()),
        };

        let engine = self.strong();
        let target_clone = target.clone();
        let requester = requester.to_string();
        tokio::spawn(async move {
            engine
                .run_ping_test(target_clone, payload_size, repeat, requester)
                .await;
        });

        Ok(format!(
            "🏓 Ping test to {target} started: {repeat} ping(s) with {payload_size} bytes payload..."
        ))
    }

    async fn run_ping_test(
        self: Arc<Self>,
        target: String,
        payload_size: usize,
        repeat: u32,
        requester: String,
    ) {
        let test_id = format!("{target}_{}", chrono::Utc::now().timestamp());
        {
            let mut pings = self.pings.lock().expect("ping state poisoned");
            pings.tests.insert(
                test_id.clone(),
                PingTest {
                    target: target.clone(),
                    requester: requester.clone(),
                    total_pings: repeat,
                    payload_size,
                    results: Vec::new(),
                    completed: 0,
                    timeouts: 0,
                    status: TestStatus::Running,
                    send_times: HashMap::new(),
                    completed_sequences: HashSet::new(),
                },
            );
        }
        info!(%test_id, target = %target, repeat, "ping test started");

        for sequence in 1..=repeat {
            {
                let pings = self.pings.lock().expect("ping state poisoned");
                match pings.tests.get(&test_id) {
                    Some(t) if t.status == TestStatus::Running => {}
                    _ => break,
                }
            }

            let seq_key = format!("{sequence}/{repeat}");
            let base = format!("Ping test {seq_key} to measure roundtrip");
            let message = pad_payload(&base, payload_size);

            {
                let mut pings = self.pings.lock().expect("ping state poisoned");
                if let Some(test) = pings.tests.get_mut(&test_id) {
                    test.send_times.insert(seq_key.clone(), Instant::now());
                }
            }

            let mut out = OutboundMessage::new(&target, &message, "ctcping");
            out.src = Some(self.my_callsign.clone());
            self.router
                .publish("ctcping", Topic::UdpMessage, RouterEvent::Outbound(out))
                .await;
            debug!(%test_id, seq = %seq_key, "ping sent, waiting for echo and ACK");

            if sequence < repeat {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(PING_GAP) => {}
                }
            }
        }

        // Monitor drives timeout-based completion.
        let engine = self.clone();
        let monitor_id = test_id.clone();
        tokio::spawn(async move { engine.monitor_test_completion(monitor_id).await });
    }

    /// Echo handling: our own outbound text reappearing with `{NNN` means
    /// the radio accepted it; the three digits are the ACK id to watch for.
    pub(crate) async fn handle_echo(&self, mesh: &MeshMessage) {
        let src = mesh.src_callsign().to_uppercase();
        if src != self.my_callsign {
            return;
        }
        let Some(echo_id) = mesh.echo_id().map(str::to_string) else {
            return;
        };
        let original = mesh.msg[..mesh.msg.len() - 4].to_string();
        if !is_ping_text(&original) {
            return;
        }

        let dst = mesh.dst.to_uppercase();
        let sequence = extract_sequence(&original).unwrap_or_default();

        let spawn_timeout = {
            let mut pings = self.pings.lock().expect("ping state poisoned");
            if pings.active.contains_key(&echo_id) {
                debug!(%echo_id, "echo already tracked, ignoring duplicate");
                false
            } else {
                let test_id = pings.running_test_for_target(&dst);
                let sent_at = test_id
                    .as_ref()
                    .and_then(|id| pings.tests.get(id))
                    .and_then(|t| t.send_times.get(&sequence).copied())
                    .unwrap_or_else(Instant::now);
                pings.active.insert(
                    echo_id.clone(),
                    ActivePing {
                        target: dst.clone(),
                        requester: src.clone(),
                        sequence,
                        sent_at,
                        test_id,
                        ack_processed: false,
                    },
                );
                true
            }
        };

        if spawn_timeout {
            debug!(%echo_id, target = %dst, "echo tracked");
            let engine = self.strong();
            tokio::spawn(async move { engine.ping_timeout_task(echo_id).await });
        }
    }

    /// ACK handling with idempotent completion.
    pub(crate) async fn handle_ack(&self, mesh: &MeshMessage) {
        let src = mesh.src_callsign().to_uppercase();
        let dst = mesh.dst.to_uppercase();
        let Some(ack_id) = mesh.ack_tail().map(str::to_string) else {
            return;
        };

        // Everything decided under the lock; messages sent after release.
        enum AckOutcome {
            Ignore,
            Result { requester: String, text: String, target: String, complete: Option<String> },
        }

        let outcome = {
            let mut pings = self.pings.lock().expect("ping state poisoned");
            let Some(ping) = pings.active.get(&ack_id).cloned() else {
                debug!(%ack_id, %src, "ACK without matching ping");
                return;
            };

            if ping.ack_processed {
                AckOutcome::Ignore
            } else if src != ping.target || dst != self.my_callsign {
                debug!(%ack_id, %src, expected = %ping.target, "ACK verification failed");
                AckOutcome::Ignore
            } else {
                pings
                    .active
                    .get_mut(&ack_id)
                    .expect("checked above")
                    .ack_processed = true;
                let rtt = ping.sent_at.elapsed();

                let mut outcome = AckOutcome::Ignore;
                if let Some(test_id) = &ping.test_id {
                    if let Some(test) = pings.tests.get_mut(test_id) {
                        if test.status == TestStatus::Running {
                            if !ping.sequence.is_empty()
                                && test.completed_sequences.contains(&ping.sequence)
                            {
                                debug!(seq = %ping.sequence, "sequence already completed, duplicate ACK dropped");
                            } else {
                                if !ping.sequence.is_empty() {
                                    test.completed_sequences.insert(ping.sequence.clone());
                                }
                                test.results.push(PingResult {
                                    sequence: ping.sequence.clone(),
                                    rtt: Some(rtt),
                                });
                                test.completed += 1;

                                let done =
                                    test.completed + test.timeouts >= test.total_pings;
                                let complete = if done && pings.claim_completion(test_id) {
                                    Some(test_id.clone())
                                } else {
                                    None
                                };
                                outcome = AckOutcome::Result {
                                    requester: ping.requester.clone(),
                                    text: format!(
                                        "🏓 Ping {} to {}: RTT = {:.1}ms",
                                        ping.sequence,
                                        ping.target,
                                        rtt.as_secs_f64() * 1000.0
                                    ),
                                    target: ping.target.clone(),
                                    complete,
                                };
                            }
                        } else {
                            debug!(%test_id, "ACK for test no longer running");
                        }
                    }
                }
                pings.active.remove(&ack_id);
                outcome
            }
        };

        if let AckOutcome::Result { requester, text, target, complete } = outcome {
            self.send_ping_result(&requester, &text, &target).await;
            if let Some(test_id) = complete {
                self.complete_test(&test_id, None).await;
            }
        }
    }

    async fn ping_timeout_task(self: Arc<Self>, echo_id: String) {
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(PING_TIMEOUT) => {}
        }

        let outcome = {
            let mut pings = self.pings.lock().expect("ping state poisoned");
            let Some(ping) = pings.active.remove(&echo_id) else {
                return;
            };
            if ping.ack_processed {
                return;
            }

            let mut notify = None;
            if let Some(test_id) = &ping.test_id {
                if let Some(test) = pings.tests.get_mut(test_id) {
                    if test.status == TestStatus::Running {
                        test.results.push(PingResult {
                            sequence: ping.sequence.clone(),
                            rtt: None,
                        });
                        test.timeouts += 1;
                        let done = test.completed + test.timeouts >= test.total_pings;
                        let complete = if done && pings.claim_completion(test_id) {
                            Some(test_id.clone())
                        } else {
                            None
                        };
                        notify = Some((
                            ping.requester.clone(),
                            format!(
                                "🏓 Ping {} to {}: timeout (no ACK after 30s)",
                                ping.sequence, ping.target
                            ),
                            ping.target.clone(),
                            complete,
                        ));
                    }
                }
            }
            notify
        };

        if let Some((requester, text, target, complete)) = outcome {
            self.send_ping_result(&requester, &text, &target).await;
            if let Some(test_id) = complete {
                self.complete_test(&test_id, None).await;
            }
        }
    }

    async fn monitor_test_completion(self: Arc<Self>, test_id: String) {
        let started = Instant::now();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            let state = {
                let mut pings = self.pings.lock().expect("ping state poisoned");
                let Some(test) = pings.tests.get(&test_id) else {
                    return; // Completed and cleaned up elsewhere.
                };
                if test.status != TestStatus::Running {
                    return;
                }
                if test.completed + test.timeouts >= test.total_pings {
                    if pings.claim_completion(&test_id) {
                        Some(None)
                    } else {
                        return;
                    }
                } else if started.elapsed() >= TEST_TIMEOUT {
                    if pings.claim_completion(&test_id) {
                        Some(Some("Test timeout after 5 minutes".to_string()))
                    } else {
                        return;
                    }
                } else {
                    None
                }
            };

            if let Some(error_msg) = state {
                self.complete_test(&test_id, error_msg.as_deref()).await;
                return;
            }
        }
    }

    /// Finish a test: set the terminal status, emit the summary exactly
    /// once, drop the record.
    async fn complete_test(&self, test_id: &str, error_msg: Option<&str>) {
        let summary = {
            let mut pings = self.pings.lock().expect("ping state poisoned");
            let Some(mut test) = pings.tests.remove(test_id) else {
                return;
            };
            test.status = if error_msg.is_some() {
                TestStatus::Timeout
            } else {
                TestStatus::Completed
            };

            let text = match error_msg {
                Some(err) => format!("🏓 {err}"),
                None => render_summary(&test),
            };
            (test.requester.clone(), text, test.target.clone())
        };

        let (requester, text, target) = summary;
        self.send_ping_result(&requester, &text, &target).await;
        info!(test_id, "ping test summary sent");
    }

    /// Deliver a ping result line: to the UI when the requester is the
    /// operator, over the mesh otherwise.
    async fn send_ping_result(&self, requester: &str, text: &str, target: &str) {
        if requester == self.my_callsign {
            let now = chrono::Utc::now().timestamp_millis();
            let payload = json!({
                "src": self.my_callsign,
                "dst": if target.is_empty() { requester } else { target },
                "msg": text,
                "msg_id": now,
                "src_type": "node",
                "type": "msg",
                "timestamp": now,
            });
            self.router
                .publish("ctcping", Topic::WebsocketMessage, RouterEvent::Status(payload))
                .await;
        } else {
            let out = OutboundMessage::new(requester, text, "ctcping_result");
            self.router
                .publish("ctcping", Topic::UdpMessage, RouterEvent::Outbound(out))
                .await;
        }
    }
}

/// Pad or trim the ping body to exactly the requested payload size.
fn pad_payload(base: &str, payload_size: usize) -> String {
    if base.len() > payload_size {
        base.chars().take(payload_size).collect()
    } else {
        let mut s = base.to_string();
        s.push_str(&".".repeat(payload_size - base.len()));
        s
    }
}

/// A ping body has the sequence marker and a measurement word.
fn is_ping_text(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    let has_sequence = extract_sequence(&lower).is_some();
    let has_measurement =
        lower.contains("mea") || lower.contains("measure") || lower.contains("roundtrip");
    has_sequence && has_measurement
}

/// Pull `i/K` out of a `ping test i/K` body.
fn extract_sequence(msg: &str) -> Option<String> {
    let lower = msg.to_lowercase();
    let idx = lower.find("ping test ")?;
    let rest = &lower[idx + "ping test ".len()..];
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '/')
        .collect();
    let (a, b) = token.split_once('/')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let b_digits: String = b.chars().take_while(char::is_ascii_digit).collect();
    if b_digits.is_empty() {
        return None;
    }
    Some(format!("{a}/{b_digits}"))
}

/// Render the final summary with loss percentage and RTT min/avg/max.
fn render_summary(test: &PingTest) -> String {
    let loss_percent = (f64::from(test.timeouts) / f64::from(test.total_pings) * 100.0) as u32;
    let rtts: Vec<f64> = test
        .results
        .iter()
        .filter_map(|r| r.rtt)
        .map(|d| d.as_secs_f64() * 1000.0)
        .collect();

    if rtts.is_empty() {
        format!(
            "🏓 Ping summary to {}: {loss_percent}% packet loss ({}/{}), {}B payload",
            test.target, test.completed, test.total_pings, test.payload_size
        )
    } else {
        let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        format!(
            "🏓 Ping summary to {}: {}/{} replies, {loss_percent}% loss, {}B payload. \
             RTT min/avg/max = {min:.1}/{avg:.1}/{max:.1}ms",
            test.target, test.completed, test.total_pings, test.payload_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::registry::parse_command;
    use crate::commands::test_util::engine_fixture;
    use crate::message::MessageKind;

    fn echo_msg(src: &str, dst: &str, body: &str, echo: &str) -> MeshMessage {
        MeshMessage::new(
            src,
            dst,
            &format!("{body}{{{echo}"),
            MessageKind::Msg,
            "lora",
        )
    }

    #[test]
    fn test_should_pad_and_trim_payload_to_requested_size() {
        assert_eq!(pad_payload("short", 25).len(), 25);
        let long = "x".repeat(200);
        assert_eq!(pad_payload(&long, 140).len(), 140);
    }

    #[test]
    fn test_should_recognize_ping_bodies() {
        assert!(is_ping_text("Ping test 1/3 to measure roundtrip........"));
        assert!(!is_ping_text("Ping test started: 3 pings"));
        assert!(!is_ping_text("hello 1/3"));
        assert_eq!(
            extract_sequence("ping test 2/5 to measure roundtrip"),
            Some("2/5".to_string())
        );
    }

    #[tokio::test]
    async fn test_should_validate_ctcping_arguments() {
        let (engine, _router, _dir) = engine_fixture().await;

        let no_call = parse_command("!ctcping").unwrap();
        assert!(engine
            .handle_ctcping(&no_call, "DK5EN-1")
            .await
            .unwrap()
            .contains("Target callsign required"));

        let self_ping = parse_command("!ctcping call:DK5EN-1").unwrap();
        assert!(engine
            .handle_ctcping(&self_ping, "DK5EN-1")
            .await
            .unwrap()
            .contains("Cannot ping yourself"));

        let bad_payload = parse_command("!ctcping call:OE5HWN-12 payload:999").unwrap();
        assert!(engine
            .handle_ctcping(&bad_payload, "DK5EN-1")
            .await
            .unwrap()
            .contains("between 25 and 140"));

        let bad_repeat = parse_command("!ctcping call:OE5HWN-12 repeat:9").unwrap();
        assert!(engine
            .handle_ctcping(&bad_repeat, "DK5EN-1")
            .await
            .unwrap()
            .contains("between 1 and 5"));
    }

    #[tokio::test]
    async fn test_should_track_echo_and_complete_on_ack_exactly_once() {
        let (engine, _router, _dir) = engine_fixture().await;

        // Seed a running test as run_ping_test would.
        {
            let mut pings = engine.pings.lock().unwrap();
            let mut send_times = HashMap::new();
            send_times.insert("1/1".to_string(), Instant::now());
            pings.tests.insert(
                "OE5HWN-12_1".to_string(),
                PingTest {
                    target: "OE5HWN-12".into(),
                    requester: "DK5EN-1".into(),
                    total_pings: 1,
                    payload_size: 40,
                    results: Vec::new(),
                    completed: 0,
                    timeouts: 0,
                    status: TestStatus::Running,
                    send_times,
                    completed_sequences: HashSet::new(),
                },
            );
        }

        // Echo of our own outbound ping.
        let echo = echo_msg(
            "DK5EN-1",
            "OE5HWN-12",
            "Ping test 1/1 to measure roundtrip....",
            "829",
        );
        engine.handle_echo(&echo).await;
        assert!(engine.pings.lock().unwrap().active.contains_key("829"));

        // ACK from the target.
        let ack = MeshMessage::new("OE5HWN-12", "DK5EN-1", "reply :ack829", MessageKind::Msg, "lora");
        engine.handle_ack(&ack).await;

        {
            let pings = engine.pings.lock().unwrap();
            assert!(!pings.active.contains_key("829"), "ping consumed");
            assert!(
                !pings.tests.contains_key("OE5HWN-12_1"),
                "test completed and removed"
            );
        }

        // A duplicate ACK is a no-op.
        engine.handle_ack(&ack).await;
    }

    #[tokio::test]
    async fn test_should_ignore_ack_from_wrong_station() {
        let (engine, _router, _dir) = engine_fixture().await;
        {
            let mut pings = engine.pings.lock().unwrap();
            pings.active.insert(
                "300".to_string(),
                ActivePing {
                    target: "OE5HWN-12".into(),
                    requester: "DK5EN-1".into(),
                    sequence: "1/1".into(),
                    sent_at: Instant::now(),
                    test_id: None,
                    ack_processed: false,
                },
            );
        }

        let wrong = MeshMessage::new("DL1XYZ-1", "DK5EN-1", "x :ack300", MessageKind::Msg, "lora");
        engine.handle_ack(&wrong).await;
        assert!(
            engine.pings.lock().unwrap().active.contains_key("300"),
            "unverified ACK must not consume the ping"
        );
    }

    #[tokio::test]
    async fn test_should_ignore_echo_from_other_stations() {
        let (engine, _router, _dir) = engine_fixture().await;
        let foreign = echo_msg(
            "OE5HWN-12",
            "DK5EN-1",
            "Ping test 1/1 to measure roundtrip",
            "111",
        );
        engine.handle_echo(&foreign).await;
        assert!(engine.pings.lock().unwrap().active.is_empty());
    }

    #[tokio::test]
    async fn test_should_ignore_duplicate_echo() {
        let (engine, _router, _dir) = engine_fixture().await;
        let echo = echo_msg(
            "DK5EN-1",
            "OE5HWN-12",
            "Ping test 1/2 to measure roundtrip",
            "500",
        );
        engine.handle_echo(&echo).await;
        engine.handle_echo(&echo).await;
        assert_eq!(engine.pings.lock().unwrap().active.len(), 1);
    }
}
