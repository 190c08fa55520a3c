//! End-to-end scenarios through router, command engine and storage: local
//! command diversion, group-mode gating, outbound routing, and MHeard
//! beacon throttling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcapp::commands::{CommandEngine, MeshStorageSubscriber};
use mcapp::domain::Callsign;
use mcapp::message::{MeshMessage, MessageKind, MessageNormalizer, OutboundMessage};
use mcapp::router::{
    MessageRouter, MeshTransport, RoutedMessage, RouterEvent, Subscriber, Topic,
};
use mcapp::storage::StorageEngine;
use mcapp::weather::{WeatherData, WeatherService};
use mcapp::GatewayResult;

/// Captures everything handed to the UDP transport.
#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MockTransport {
    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeshTransport for MockTransport {
    async fn send_message(&self, out: &OutboundMessage) -> GatewayResult<()> {
        self.sent.lock().unwrap().push(out.clone());
        Ok(())
    }
}

/// Records broadcast payloads (the UI-facing stream).
#[derive(Default)]
struct WebsocketProbe {
    payloads: Mutex<Vec<serde_json::Value>>,
    count: AtomicUsize,
}

impl WebsocketProbe {
    fn messages(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscriber for WebsocketProbe {
    fn name(&self) -> &'static str {
        "websocket_probe"
    }
    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()> {
        if let Some(payload) = msg.event.to_client_json() {
            self.payloads.lock().unwrap().push(payload);
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct Fixture {
    router: Arc<MessageRouter>,
    engine: Arc<CommandEngine>,
    storage: Arc<StorageEngine>,
    udp: Arc<MockTransport>,
    websocket: Arc<WebsocketProbe>,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = Arc::new(
        StorageEngine::open(&dir.path().join("test.db")).await.unwrap(),
    );

    let router = Arc::new(MessageRouter::new());
    let normalizer = MessageNormalizer::new(Callsign::try_new("DK5EN-1").unwrap());
    router.set_normalizer(normalizer.clone());

    let weather = Arc::new(WeatherService::new("Teststadt", None, None));
    weather.seed_cache(WeatherData {
        temperature_c: 21.5,
        humidity_pct: 45.0,
        pressure_hpa: 1013.0,
        wind_kmh: 12.0,
        weather_code: 1,
        fetched_at: chrono::Utc::now(),
        lat: 48.2,
        lon: 12.5,
    });

    let engine = CommandEngine::new(
        router.clone(),
        storage.clone(),
        weather,
        normalizer,
        "DK5EN-1 Test Node".to_string(),
    );
    router.subscribe(Topic::MeshMessage, engine.clone());
    router.subscribe(Topic::BleNotification, engine.clone());

    let storage_sub = Arc::new(MeshStorageSubscriber::new(storage.clone(), engine.clone()));
    router.subscribe(Topic::MeshMessage, storage_sub.clone());
    router.subscribe(Topic::BleNotification, storage_sub);

    let udp = Arc::new(MockTransport::default());
    router.register_udp(udp.clone());

    let websocket = Arc::new(WebsocketProbe::default());
    router.subscribe(Topic::WebsocketMessage, websocket.clone());

    Fixture {
        router,
        engine,
        storage,
        udp,
        websocket,
        _dir: dir,
    }
}

fn outbound(src: &str, dst: &str, msg: &str) -> RouterEvent {
    let mut out = OutboundMessage::new(dst, msg, "udp");
    out.src = Some(src.to_string());
    RouterEvent::Outbound(out)
}

fn inbound(src: &str, dst: &str, msg: &str, id: u32) -> RouterEvent {
    let mut mesh = MeshMessage::new(src, dst, msg, MessageKind::Msg, "lora");
    mesh.msg_id = Some(format!("{id:08X}"));
    RouterEvent::Mesh(mesh)
}

#[tokio::test]
async fn test_should_execute_self_wx_locally_and_answer_over_websocket() {
    let f = fixture().await;

    f.router
        .publish("sse", Topic::UdpMessage, outbound("DK5EN-1", "DK5EN-1", "!WX"))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(f.udp.sent().is_empty(), "nothing may reach the mesh");

    let messages = f.websocket.messages();
    let weather_reply = messages
        .iter()
        .find(|m| m["msg"].as_str().is_some_and(|s| s.contains("Teststadt")));
    assert!(
        weather_reply.is_some(),
        "weather response must reach the websocket stream, got: {messages:?}"
    );
}

#[tokio::test]
async fn test_should_answer_group_command_over_mesh_when_groups_enabled() {
    let f = fixture().await;
    f.engine.set_group_responses(true);

    f.router
        .publish(
            "udp",
            Topic::MeshMessage,
            inbound("OE5HWN-12", "20", "!TIME DK5EN-1", 0x100),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = f.udp.sent();
    assert_eq!(sent.len(), 1, "exactly one response to the group");
    assert_eq!(sent[0].dst, "20");
    assert!(sent[0].msg.contains("Uhr"), "time response expected: {}", sent[0].msg);
}

#[tokio::test]
async fn test_should_stay_silent_for_group_command_when_groups_disabled() {
    let f = fixture().await;

    f.router
        .publish(
            "udp",
            Topic::MeshMessage,
            inbound("OE5HWN-12", "20", "!TIME DK5EN-1", 0x101),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(f.udp.sent().is_empty(), "groups off, requester not admin: silence");
}

#[tokio::test]
async fn test_should_forward_command_with_remote_target_to_mesh() {
    let f = fixture().await;

    f.router
        .publish("sse", Topic::UdpMessage, outbound("DK5EN-1", "20", "!WX OE5HWN-12"))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = f.udp.sent();
    assert_eq!(sent.len(), 1, "remote-targeted command goes out unmodified");
    assert_eq!(sent[0].msg, "!WX OE5HWN-12");
    assert_eq!(sent[0].dst, "20");
}

#[tokio::test]
async fn test_should_start_ping_test_from_explicit_local_command() {
    let f = fixture().await;

    f.router
        .publish(
            "sse",
            Topic::UdpMessage,
            outbound("DK5EN-1", "DK5EN-1", "!CTCPING TARGET:LOCAL CALL:DK5EN-99"),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let messages = f.websocket.messages();
    assert!(
        messages.iter().any(|m| m["msg"]
            .as_str()
            .is_some_and(|s| s.contains("Ping test to DK5EN-99 started"))),
        "start notice must reach the operator: {messages:?}"
    );

    // The first ping goes out to the target over UDP.
    let sent = f.udp.sent();
    assert!(
        sent.iter().any(|m| m.dst == "DK5EN-99" && m.msg.contains("Ping test 1/1")),
        "first ping must be sent to the target, got: {sent:?}"
    );
}

#[tokio::test]
async fn test_should_throttle_mheard_beacons_and_log_both_signals() {
    let f = fixture().await;
    let t0 = chrono::Utc::now().timestamp_millis();

    let mut beacon = MeshMessage::new("X-1", "*", "", MessageKind::Pos, "ble");
    beacon.timestamp = t0;
    beacon.rssi = Some(-80);
    beacon.snr = Some(5.0);
    f.router
        .publish("ble", Topic::BleNotification, RouterEvent::Mesh(beacon.clone()))
        .await;

    let mut second = beacon.clone();
    second.timestamp = t0 + 60_000;
    second.rssi = Some(-78);
    f.router
        .publish("ble", Topic::BleNotification, RouterEvent::Mesh(second))
        .await;

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(f.storage.reader())
        .await
        .unwrap();
    assert_eq!(count.0, 1, "second beacon updates in place");

    let (rssi,): (i64,) = sqlx::query_as("SELECT rssi FROM messages WHERE src = 'X-1'")
        .fetch_one(f.storage.reader())
        .await
        .unwrap();
    assert_eq!(rssi, -78, "latest rssi wins");

    let log: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_log")
        .fetch_one(f.storage.reader())
        .await
        .unwrap();
    assert_eq!(log.0, 2, "both samples land in the signal log");

    let buckets: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_buckets")
        .fetch_one(f.storage.reader())
        .await
        .unwrap();
    assert_eq!(buckets.0, 0, "same 5-minute bucket, nothing flushed yet");
}

#[tokio::test]
async fn test_should_not_store_messages_from_banned_callsigns() {
    let f = fixture().await;

    // Ban via the admin command path.
    f.router
        .publish(
            "udp",
            Topic::MeshMessage,
            inbound("DK5EN-7", "DK5EN-1", "!KB OE9XYZ-1", 0x200),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.engine.is_callsign_banned("OE9XYZ-1"));

    f.router
        .publish(
            "udp",
            Topic::MeshMessage,
            inbound("OE9XYZ-1", "20", "spam message", 0x201),
        )
        .await;

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE src = 'OE9XYZ-1'")
        .fetch_one(f.storage.reader())
        .await
        .unwrap();
    assert_eq!(count.0, 0, "banned source must not be stored");
}

#[tokio::test]
async fn test_should_block_sender_after_three_failed_commands() {
    let f = fixture().await;

    for _ in 0..3 {
        f.engine.note_failed_attempt("OE1BAD-1");
    }
    assert!(f.engine.is_sender_blocked("OE1BAD-1"));
    assert!(!f.engine.is_sender_blocked("OE5HWN-12"));

    // A blocked sender gets one courtesy reply; execution never happens.
    f.engine.set_group_responses(true);
    f.router
        .publish(
            "udp",
            Topic::MeshMessage,
            inbound("OE1BAD-1", "DK5EN-1", "!TIME", 0x300),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = f.udp.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].msg.contains("timeout due to repeated invalid commands"));

    // Second command while blocked: silence.
    f.router
        .publish(
            "udp",
            Topic::MeshMessage,
            inbound("OE1BAD-1", "DK5EN-1", "!DICE", 0x301),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.udp.sent().len(), 1, "no further replies while blocked");
}
