//! Command engine.
//!
//! Subscribes to `mesh_message` and `ble_notification` and handles every
//! payload starting with `!`: dedup, reception decision, abuse protection,
//! throttling, parsing, execution, and the chunked response path. Ping
//! echoes and ACKs are intercepted before command handling because they
//! drive the ctcping state machine.

pub mod beacon;
pub mod ctcping;
pub mod dedup;
pub mod handlers;
pub mod registry;
pub mod response;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{self, base_callsign};
use crate::error::GatewayResult;
use crate::message::{MeshMessage, MessageNormalizer};
use crate::router::{MessageRouter, RoutedMessage, RouterEvent, Subscriber};
use crate::storage::StorageEngine;
use crate::weather::WeatherService;
use self::beacon::BeaconState;
use self::ctcping::PingState;
use self::dedup::DedupState;
use self::registry::{CommandId, ParsedCommand};

/// How a response finds its way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Direct,
    Group,
}

/// The command engine. Constructed once, shared as `Arc`.
pub struct CommandEngine {
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) storage: Arc<StorageEngine>,
    pub(crate) weather: Arc<WeatherService>,
    pub(crate) my_callsign: String,
    admin_base: String,
    pub(crate) user_info: String,
    group_responses: AtomicBool,
    pub(crate) blocked_callsigns: Mutex<BTreeSet<String>>,
    pub(crate) dedup: Mutex<DedupState>,
    pub(crate) pings: Mutex<PingState>,
    pub(crate) beacons: tokio::sync::Mutex<BeaconState>,
    pub(crate) shutdown: CancellationToken,
    normalizer: MessageNormalizer,
    self_ref: Weak<CommandEngine>,
}

impl CommandEngine {
    /// Build the engine and subscribe it to the command-bearing topics.
    pub fn new(
        router: Arc<MessageRouter>,
        storage: Arc<StorageEngine>,
        weather: Arc<WeatherService>,
        normalizer: MessageNormalizer,
        user_info: String,
    ) -> Arc<Self> {
        let my_callsign = normalizer.my_callsign().to_string();
        let admin_base = base_callsign(&my_callsign).to_string();

        let engine = Arc::new_cyclic(|weak| Self {
            router,
            storage,
            weather,
            my_callsign,
            admin_base,
            user_info,
            group_responses: AtomicBool::new(false),
            blocked_callsigns: Mutex::new(BTreeSet::new()),
            dedup: Mutex::new(DedupState::new()),
            pings: Mutex::new(PingState::new()),
            beacons: tokio::sync::Mutex::new(BeaconState::new()),
            shutdown: CancellationToken::new(),
            normalizer,
            self_ref: weak.clone(),
        });
        info!(
            commands = registry::COMMAND_COUNT,
            callsign = %engine.my_callsign,
            "command engine initialized"
        );
        engine
    }

    pub(crate) fn strong(&self) -> Arc<CommandEngine> {
        self.self_ref
            .upgrade()
            .expect("engine outlives its own tasks")
    }

    /// Admin check: same base callsign as the operator, any SSID.
    pub fn is_admin(&self, callsign: &str) -> bool {
        !callsign.is_empty() && base_callsign(callsign).eq_ignore_ascii_case(&self.admin_base)
    }

    pub fn group_responses_enabled(&self) -> bool {
        self.group_responses.load(Ordering::SeqCst)
    }

    pub fn set_group_responses(&self, enabled: bool) {
        self.group_responses.store(enabled, Ordering::SeqCst);
    }

    /// Whether a source callsign is on the kick-ban list.
    pub fn is_callsign_banned(&self, callsign: &str) -> bool {
        self.blocked_callsigns
            .lock()
            .expect("blocklist poisoned")
            .contains(callsign)
    }

    /// Record a failed command attempt toward the abuse tally.
    pub fn note_failed_attempt(&self, src: &str) {
        self.dedup
            .lock()
            .expect("dedup poisoned")
            .track_failed_attempt(src);
    }

    /// Whether a sender is currently blocked by the abuse tally.
    pub fn is_sender_blocked(&self, src: &str) -> bool {
        self.dedup.lock().expect("dedup poisoned").is_user_blocked(src)
    }

    /// Cancel beacons and drop ping state; bounded by the caller.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.beacons.lock().await.cancel_all().await;
        self.pings.lock().expect("ping state poisoned").clear();
        info!("command engine stopped");
    }

    // ── Inbound flow ────────────────────────────────────────────

    async fn handle_mesh(&self, mesh: &MeshMessage) {
        if mesh.msg.is_empty() {
            return;
        }

        // Echoes and ACKs feed the ping state machine and stop here.
        if mesh.echo_id().is_some() {
            self.handle_echo(mesh).await;
            return;
        }
        if mesh.ack_tail().is_some() {
            self.handle_ack(mesh).await;
            return;
        }

        if !mesh.msg.starts_with('!') {
            return;
        }

        let msg_id = mesh.msg_id.clone();
        if let Some(id) = &msg_id {
            if self.dedup.lock().expect("dedup poisoned").is_duplicate(id) {
                debug!(msg_id = %id, "duplicate command msg_id, ignored silently");
                return;
            }
        }

        // The router normalized outbound traffic already; inbound frames
        // are normalized here again so the decision logic sees one shape.
        let src = mesh.src_callsign().to_uppercase();
        let dst = mesh.dst.trim().to_uppercase();
        let msg = strip_echo_suffix(mesh.msg.trim()).to_uppercase();

        let Some(target_type) = self.should_execute(&src, &dst, &msg) else {
            debug!(%src, %dst, "command execution denied");
            return;
        };

        let response_target = match target_type {
            TargetType::Direct => {
                if src == self.my_callsign {
                    dst.clone()
                } else {
                    src.clone()
                }
            }
            TargetType::Group => dst.clone(),
        };

        // Abuse block: one courtesy reply, then silence.
        let notify = {
            let mut dedup = self.dedup.lock().expect("dedup poisoned");
            if dedup.is_user_blocked(&src) {
                dedup.should_notify_block(&src)
            } else {
                None
            }
        };
        if let Some(notify_block) = notify {
            if notify_block {
                self.send_response(
                    "🚫 Temporarily in timeout due to repeated invalid commands",
                    &response_target,
                    &mesh.src_type,
                )
                .await;
            }
            return;
        }

        let content_key = dedup::content_key(&src, &dst, &msg);
        let throttled = {
            let mut dedup = self.dedup.lock().expect("dedup poisoned");
            dedup.throttle_window_hit(&content_key)
        };
        if let Some(window) = throttled {
            debug!(%src, "command throttled");
            self.send_response(
                &format!("⏳ Command throttled. Same command allowed once per {window}"),
                &response_target,
                &mesh.src_type,
            )
            .await;
            return;
        }

        let Some(parsed) = registry::parse_command(&msg) else {
            // Unknown commands are discarded without a reply and without an
            // abuse strike; the mesh is full of other nodes' commands.
            if let Some(id) = &msg_id {
                self.dedup.lock().expect("dedup poisoned").mark_processed(id);
            }
            debug!(%src, %msg, "unknown command discarded");
            return;
        };

        let result = self.execute(&parsed, &src).await;

        if let Some(id) = &msg_id {
            self.dedup.lock().expect("dedup poisoned").mark_processed(id);
        }

        match result {
            Ok(reply) => {
                self.dedup
                    .lock()
                    .expect("dedup poisoned")
                    .mark_content(&content_key, parsed.id);
                self.send_response(&reply, &response_target, &mesh.src_type).await;
            }
            Err(e) => {
                warn!(%src, command = ?parsed.id, error = %e, "command failed");
                self.dedup
                    .lock()
                    .expect("dedup poisoned")
                    .track_failed_attempt(&src);
                let text = e.to_string();
                let reply = if text.to_lowercase().contains("timeout") {
                    "❌ Command timeout. Try again later".to_string()
                } else if text.to_lowercase().contains("weather") {
                    "❌ Weather service temporarily unavailable".to_string()
                } else {
                    format!("❌ Command failed: {}", truncate(&text, 50))
                };
                self.send_response(&reply, &response_target, &mesh.src_type).await;
            }
        }
    }

    /// Reception decision: who may trigger execution, and where the answer
    /// goes. `None` means no execution.
    pub fn should_execute(&self, src: &str, dst: &str, msg: &str) -> Option<TargetType> {
        // Broadcast destinations only execute for our own commands.
        if matches!(dst, "*" | "ALL" | "") {
            return (src == self.my_callsign).then_some(TargetType::Group);
        }

        let target = self.normalizer.extract_target_callsign(msg);

        if src == self.my_callsign {
            // Own traffic: execute unless the target names someone else.
            return match target {
                Some(t) if t != self.my_callsign => None,
                _ => {
                    if domain::is_group(dst) {
                        Some(TargetType::Group)
                    } else {
                        Some(TargetType::Direct)
                    }
                }
            };
        }

        // Direct message to us.
        if dst == self.my_callsign {
            return match target {
                Some(t) if t != self.my_callsign => None,
                _ => Some(TargetType::Direct),
            };
        }

        // Group traffic requires us as explicit target, plus permission.
        if domain::is_group(dst) {
            if target.as_deref() != Some(self.my_callsign.as_str()) {
                return None;
            }
            let allowed = self.group_responses_enabled() || self.is_admin(src);
            return allowed.then_some(TargetType::Group);
        }

        None
    }

    async fn execute(&self, parsed: &ParsedCommand, requester: &str) -> GatewayResult<String> {
        match parsed.id {
            CommandId::Search => self.handle_search(parsed, requester).await,
            CommandId::Stats => self.handle_stats(parsed).await,
            CommandId::Mheard => self.handle_mheard(parsed).await,
            CommandId::Pos => self.handle_position(parsed).await,
            CommandId::Dice => Ok(self.handle_dice(requester)),
            CommandId::Time => Ok(self.handle_time()),
            CommandId::Weather => self.handle_weather().await,
            CommandId::Group => Ok(self.handle_group_control(parsed, requester)),
            CommandId::UserInfo => Ok(self.handle_userinfo()),
            CommandId::KickBan => Ok(self.handle_kickban(parsed, requester)),
            CommandId::Topic => self.handle_topic(parsed, requester).await,
            CommandId::CtcPing => self.handle_ctcping(parsed, requester).await,
            CommandId::Help => Ok(self.handle_help()),
        }
    }
}

#[async_trait]
impl Subscriber for CommandEngine {
    fn name(&self) -> &'static str {
        "command_engine"
    }

    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()> {
        if let RouterEvent::Mesh(mesh) = &msg.event {
            self.handle_mesh(mesh).await;
        }
        Ok(())
    }
}

/// Storage subscriber: persists every routed mesh record, dropping traffic
/// from kick-banned callsigns before it reaches the tables.
pub struct MeshStorageSubscriber {
    storage: Arc<StorageEngine>,
    engine: Arc<CommandEngine>,
}

impl MeshStorageSubscriber {
    pub fn new(storage: Arc<StorageEngine>, engine: Arc<CommandEngine>) -> Self {
        Self { storage, engine }
    }
}

#[async_trait]
impl Subscriber for MeshStorageSubscriber {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()> {
        if let RouterEvent::Mesh(mesh) = &msg.event {
            let src = mesh.src_callsign().to_uppercase();
            if self.engine.is_callsign_banned(&src) {
                debug!(%src, "blocked callsign, message not stored");
                return Ok(());
            }
            self.storage.store_message(mesh).await?;
        }
        Ok(())
    }
}

pub(crate) fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strip a trailing `{NNN` echo tag of any digit width.
fn strip_echo_suffix(msg: &str) -> &str {
    if let Some(idx) = msg.rfind('{') {
        let tail = &msg[idx + 1..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return &msg[..idx];
        }
    }
    msg
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::domain::Callsign;
    use crate::storage::test_util::temp_engine;
    use tempfile::TempDir;

    /// Engine over a fresh router and temp storage.
    pub async fn engine_fixture() -> (Arc<CommandEngine>, Arc<MessageRouter>, TempDir) {
        let (storage, dir) = temp_engine().await;
        let storage = Arc::new(storage);
        let router = Arc::new(MessageRouter::new());
        let normalizer = MessageNormalizer::new(Callsign::try_new("DK5EN-1").unwrap());
        router.set_normalizer(normalizer.clone());
        let weather = Arc::new(WeatherService::new("Test", None, None));
        let engine = CommandEngine::new(
            router.clone(),
            storage,
            weather,
            normalizer,
            "DK5EN-1 Test Node".to_string(),
        );
        (engine, router, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_util::engine_fixture;

    // Reception decision matrix, row by row.
    #[tokio::test]
    async fn test_should_execute_own_command_without_target() {
        let (engine, _router, _dir) = engine_fixture().await;
        assert_eq!(
            engine.should_execute("DK5EN-1", "DK5EN-1", "!WX"),
            Some(TargetType::Direct)
        );
        assert_eq!(
            engine.should_execute("DK5EN-1", "20", "!WX"),
            Some(TargetType::Group)
        );
        assert_eq!(
            engine.should_execute("DK5EN-1", "OE5HWN-12", "!TIME"),
            Some(TargetType::Direct)
        );
    }

    #[tokio::test]
    async fn test_should_not_execute_own_command_with_remote_target() {
        let (engine, _router, _dir) = engine_fixture().await;
        assert_eq!(engine.should_execute("DK5EN-1", "20", "!WX OE5HWN-12"), None);
    }

    #[tokio::test]
    async fn test_should_execute_incoming_direct_command() {
        let (engine, _router, _dir) = engine_fixture().await;
        assert_eq!(
            engine.should_execute("OE5HWN-12", "DK5EN-1", "!TIME"),
            Some(TargetType::Direct)
        );
        assert_eq!(
            engine.should_execute("OE5HWN-12", "DK5EN-1", "!TIME DK5EN-1"),
            Some(TargetType::Direct)
        );
        assert_eq!(
            engine.should_execute("OE5HWN-12", "DK5EN-1", "!TIME OE9XYZ-1"),
            None
        );
    }

    #[tokio::test]
    async fn test_should_gate_group_commands_on_mode_and_admin() {
        let (engine, _router, _dir) = engine_fixture().await;

        // Groups off, non-admin: denied even with our target.
        assert_eq!(engine.should_execute("OE5HWN-12", "20", "!TIME DK5EN-1"), None);

        // Groups on: allowed.
        engine.set_group_responses(true);
        assert_eq!(
            engine.should_execute("OE5HWN-12", "20", "!TIME DK5EN-1"),
            Some(TargetType::Group)
        );

        // Groups off again, admin SSID: allowed via override.
        engine.set_group_responses(false);
        assert_eq!(
            engine.should_execute("DK5EN-7", "20", "!TIME DK5EN-1"),
            Some(TargetType::Group)
        );
    }

    #[tokio::test]
    async fn test_should_never_execute_group_command_without_our_target() {
        let (engine, _router, _dir) = engine_fixture().await;
        engine.set_group_responses(true);
        assert_eq!(engine.should_execute("OE5HWN-12", "20", "!TIME"), None);
        assert_eq!(engine.should_execute("OE5HWN-12", "20", "!TIME OE9XYZ-1"), None);
    }

    #[tokio::test]
    async fn test_should_execute_own_broadcast_but_not_foreign() {
        let (engine, _router, _dir) = engine_fixture().await;
        assert_eq!(
            engine.should_execute("DK5EN-1", "*", "!WX"),
            Some(TargetType::Group)
        );
        assert_eq!(engine.should_execute("OE5HWN-12", "*", "!WX"), None);
    }

    #[test]
    fn test_should_truncate_on_char_boundaries() {
        assert_eq!(truncate("äöü", 2), "äö");
        assert_eq!(truncate("short", 50), "short");
    }
}
