//! In-process message router.
//!
//! Single hub every subsystem joins. Subscribers are registered once during
//! startup and invoked serially, in registration order, for every publish;
//! a failing subscriber is logged and never prevents delivery to the rest.
//!
//! The router owns the outbound path: messages published on the
//! `udp_message` and `ble_message` topics are normalized, run through the
//! suppression oracle, and either handed to the registered transport or
//! diverted to the command handler as a synthetic inbound record.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::GatewayResult;
use crate::message::{MeshMessage, MessageNormalizer, OutboundMessage};

/// Topics carried by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Decoded inbound mesh traffic (UDP path)
    MeshMessage,
    /// Decoded inbound BLE traffic: mesh records and register dumps
    BleNotification,
    /// BLE adapter status events
    BleStatus,
    /// Outbound to the BLE transport
    BleMessage,
    /// Outbound to the UDP transport
    UdpMessage,
    /// Broadcast to all connected clients
    WebsocketMessage,
    /// Targeted to a single client
    WebsocketDirect,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::MeshMessage => "mesh_message",
            Topic::BleNotification => "ble_notification",
            Topic::BleStatus => "ble_status",
            Topic::BleMessage => "ble_message",
            Topic::UdpMessage => "udp_message",
            Topic::WebsocketMessage => "websocket_message",
            Topic::WebsocketDirect => "websocket_direct",
        }
    }
}

/// Payload of a routed event.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A decoded mesh message record
    Mesh(MeshMessage),
    /// Status or register JSON (BLE status, system messages, responses)
    Status(Value),
    /// An outbound submission
    Outbound(OutboundMessage),
    /// Payload addressed to one client
    Direct {
        client_id: String,
        data: Value,
    },
}

impl RouterEvent {
    /// JSON form broadcast to clients.
    pub fn to_client_json(&self) -> Option<Value> {
        match self {
            RouterEvent::Mesh(m) => serde_json::to_value(m).ok(),
            RouterEvent::Status(v) => Some(v.clone()),
            RouterEvent::Outbound(_) => None,
            RouterEvent::Direct { data, .. } => Some(data.clone()),
        }
    }
}

/// The envelope subscribers receive.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    /// Publisher tag (`udp`, `ble`, `sse`, `command`, `self`, ...)
    pub source: String,
    pub topic: Topic,
    pub event: RouterEvent,
    /// Milliseconds since epoch
    pub timestamp: i64,
}

/// A topic subscriber. Handlers run in registration order; errors are
/// isolated to the failing handler.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name for the dispatch log.
    fn name(&self) -> &'static str;
    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()>;
}

/// Outbound transport handle (UDP adapter or BLE client bridge).
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn send_message(&self, out: &OutboundMessage) -> GatewayResult<()>;
}

/// Last GPS fix reported by the node (`TYP:G` with non-zero coordinates).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
}

/// The in-process pub/sub hub.
pub struct MessageRouter {
    subscribers: RwLock<HashMap<Topic, Vec<Arc<dyn Subscriber>>>>,
    udp: OnceLock<Arc<dyn MeshTransport>>,
    ble: OnceLock<Arc<dyn MeshTransport>>,
    normalizer: OnceLock<MessageNormalizer>,
    /// Cached GPS fix for the weather service and on-demand queries
    cached_gps: Mutex<Option<GpsFix>>,
    /// Latest BLE register dump per register type, replayed to new clients
    cached_registers: Mutex<HashMap<String, Value>>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            udp: OnceLock::new(),
            ble: OnceLock::new(),
            normalizer: OnceLock::new(),
            cached_gps: Mutex::new(None),
            cached_registers: Mutex::new(HashMap::new()),
        }
    }

    /// Install the normalizer once the operator callsign is known.
    pub fn set_normalizer(&self, normalizer: MessageNormalizer) {
        let call = normalizer.my_callsign().to_string();
        if self.normalizer.set(normalizer).is_err() {
            warn!("normalizer already installed, ignoring");
        } else {
            info!(callsign = %call, "router normalizer installed");
        }
    }

    pub fn normalizer(&self) -> Option<&MessageNormalizer> {
        self.normalizer.get()
    }

    pub fn my_callsign(&self) -> Option<&str> {
        self.normalizer.get().map(MessageNormalizer::my_callsign)
    }

    /// Register a subscriber for a topic. Registration happens only during
    /// startup; publish reads the list without mutation.
    pub fn subscribe(&self, topic: Topic, subscriber: Arc<dyn Subscriber>) {
        let name = subscriber.name();
        self.subscribers
            .write()
            .expect("subscriber registry poisoned")
            .entry(topic)
            .or_default()
            .push(subscriber);
        debug!(topic = topic.as_str(), subscriber = name, "subscribed");
    }

    /// Register the UDP transport.
    pub fn register_udp(&self, transport: Arc<dyn MeshTransport>) {
        if self.udp.set(transport).is_err() {
            warn!("UDP transport already registered");
        }
    }

    /// Register the BLE transport bridge.
    pub fn register_ble(&self, transport: Arc<dyn MeshTransport>) {
        if self.ble.set(transport).is_err() {
            warn!("BLE transport already registered");
        }
    }

    /// Publish an event. Subscribers run serially in registration order; a
    /// subscriber error is logged and does not stop delivery. Outbound
    /// topics additionally run the suppression/self-message path and reach
    /// the registered transport.
    pub async fn publish(&self, source: &str, topic: Topic, event: RouterEvent) {
        let routed = RoutedMessage {
            source: source.to_string(),
            topic,
            event,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        self.dispatch(&routed).await;

        if matches!(topic, Topic::UdpMessage | Topic::BleMessage) {
            if let RouterEvent::Outbound(out) = &routed.event {
                self.handle_outbound(topic, out.clone()).await;
            }
        }
    }

    /// Fan an event out to its topic subscribers. No outbound handling.
    async fn dispatch(&self, routed: &RoutedMessage) {
        let handlers: Vec<Arc<dyn Subscriber>> = {
            let map = self.subscribers.read().expect("subscriber registry poisoned");
            map.get(&routed.topic).cloned().unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler.on_event(routed).await {
                error!(
                    topic = routed.topic.as_str(),
                    subscriber = handler.name(),
                    error = %e,
                    "subscriber failed, continuing delivery"
                );
            }
        }
    }

    /// Outbound path: normalize, consult the suppression oracle, divert
    /// self-targeted commands and self-messages to the command handler, or
    /// hand the message to the transport.
    async fn handle_outbound(&self, topic: Topic, mut out: OutboundMessage) {
        let Some(normalizer) = self.normalizer.get() else {
            warn!("no normalizer installed, dropping outbound message");
            return;
        };

        normalizer.normalize(&mut out);

        if normalizer.should_suppress_outbound(&out) {
            let reason = normalizer.suppression_reason(&out);
            debug!(src = ?out.src, dst = %out.dst, %reason, "outbound suppressed, executing locally");
            self.route_synthetic(normalizer.synthesize(&out, transport_tag(topic)))
                .await;
            return;
        }

        // Plain self-message: deliver to the local command handler instead
        // of looping it through the radio.
        if out.dst == normalizer.my_callsign() {
            debug!(dst = %out.dst, "self-message, routing to command handler only");
            self.route_synthetic(normalizer.synthesize(&out, "udp")).await;
            return;
        }

        let transport = match topic {
            Topic::BleMessage => self.ble.get(),
            _ => self.udp.get(),
        };

        match transport {
            Some(t) => {
                if let Err(e) = t.send_message(&out).await {
                    error!(dst = %out.dst, error = %e, "transport send failed");
                    self.publish_system_error(&format!("Failed to send message: {e}"))
                        .await;
                }
            }
            None => {
                let name = if topic == Topic::BleMessage { "BLE" } else { "UDP" };
                error!(transport = name, "transport unavailable");
                self.publish_system_error(&format!("{name} transport not available"))
                    .await;
            }
        }
    }

    /// Route a synthetic mesh record to `ble_notification` subscribers as
    /// if it had arrived from the wire.
    async fn route_synthetic(&self, synthetic: MeshMessage) {
        let routed = RoutedMessage {
            source: "self".to_string(),
            topic: Topic::BleNotification,
            event: RouterEvent::Mesh(synthetic),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.dispatch(&routed).await;
    }

    /// Broadcast a system error to connected clients.
    pub async fn publish_system_error(&self, msg: &str) {
        let payload = json!({
            "src_type": "system",
            "type": "error",
            "msg": msg,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let routed = RoutedMessage {
            source: "system".to_string(),
            topic: Topic::WebsocketMessage,
            event: RouterEvent::Status(payload),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.dispatch(&routed).await;
    }

    /// Broadcast an informational system message to connected clients.
    pub async fn publish_system_message(&self, msg: &str) {
        let payload = json!({
            "src_type": "system",
            "type": "info",
            "msg": msg,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        self.publish("system", Topic::WebsocketMessage, RouterEvent::Status(payload))
            .await;
    }

    // ── Caches ──────────────────────────────────────────────────

    /// Cache a GPS fix (only non-zero coordinates reach this point).
    pub fn cache_gps(&self, lat: f64, lon: f64) {
        *self.cached_gps.lock().expect("gps cache poisoned") = Some(GpsFix { lat, lon });
    }

    pub fn cached_gps(&self) -> Option<GpsFix> {
        *self.cached_gps.lock().expect("gps cache poisoned")
    }

    /// Cache the latest register dump for a register type.
    pub fn cache_register(&self, typ: &str, data: Value) {
        self.cached_registers
            .lock()
            .expect("register cache poisoned")
            .insert(typ.to_string(), data);
    }

    /// All cached register dumps, for replay to new clients.
    pub fn cached_registers(&self) -> Vec<Value> {
        self.cached_registers
            .lock()
            .expect("register cache poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Drop all cached registers (device disconnected).
    pub fn clear_register_cache(&self) {
        self.cached_registers
            .lock()
            .expect("register cache poisoned")
            .clear();
        info!("BLE register cache cleared");
    }
}

fn transport_tag(topic: Topic) -> &'static str {
    match topic {
        Topic::BleMessage => "ble",
        _ => "udp",
    }
}

/// Register types cached on the router for SSE replay.
pub const CACHED_REGISTER_TYPES: &[&str] = &[
    "I", "SN", "G", "SA", "SE", "S1", "SW", "S2", "W", "AN", "IO", "TM",
];

/// Subscriber that keeps the router's register and GPS caches current.
pub struct RegisterCacheSubscriber {
    router: Arc<MessageRouter>,
}

impl RegisterCacheSubscriber {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Subscriber for RegisterCacheSubscriber {
    fn name(&self) -> &'static str {
        "register_cache"
    }

    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()> {
        if let RouterEvent::Status(data) = &msg.event {
            if let Some(typ) = data.get("TYP").and_then(Value::as_str) {
                if CACHED_REGISTER_TYPES.contains(&typ) {
                    self.router.cache_register(typ, data.clone());
                }
                if typ == "G" {
                    let lat = data.get("LAT").and_then(Value::as_f64).unwrap_or(0.0);
                    let lon = data.get("LON").and_then(Value::as_f64).unwrap_or(0.0);
                    if lat != 0.0 && lon != 0.0 {
                        self.router.cache_gps(lat, lon);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Subscriber that clears the register cache when the device disconnects.
pub struct DisconnectCacheClear {
    router: Arc<MessageRouter>,
}

impl DisconnectCacheClear {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Subscriber for DisconnectCacheClear {
    fn name(&self) -> &'static str {
        "disconnect_cache_clear"
    }

    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()> {
        if let RouterEvent::Status(data) = &msg.event {
            let cmd = data.get("command").and_then(Value::as_str).unwrap_or("");
            let result = data.get("result").and_then(Value::as_str).unwrap_or("");
            if cmd.contains("disconnect") && matches!(result, "ok" | "lost") {
                self.router.clear_register_cache();
            }
        }
        Ok(())
    }
}
