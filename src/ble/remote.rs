//! Remote BLE client: HTTP REST calls plus an SSE notification stream to
//! the local BLE service.
//!
//! BLE is inherently lossy, so every layer retries: REST calls retry once on
//! HTTP 409 (the service serializes radio access), register queries retry
//! with exponential backoff, and an unexpected disconnect walks the
//! 5/10/20/60 s reconnect ladder with a fresh session per attempt. A
//! user-requested disconnect sets a flag that cancels the ladder.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{self, BleDecoded};
use super::{BleClient, BleDevice, BleMode, BleStatus, ConnectionState};
use crate::error::{GatewayError, GatewayResult};
use crate::message::OutboundMessage;
use crate::router::{MessageRouter, MeshTransport, RouterEvent, Topic};

/// Reconnect ladder after an unexpected disconnect, seconds.
const RECONNECT_LADDER_SECS: [u64; 4] = [5, 10, 20, 60];
/// Wait after the hello handshake before issuing register queries.
const HELLO_SETTLE: Duration = Duration::from_secs(1);
/// Spacing between register queries.
const QUERY_SPACING: Duration = Duration::from_millis(800);
/// Base delay for register query retries (doubles per attempt).
const RETRY_BASE: Duration = Duration::from_millis(500);
/// Attempts per register query.
const QUERY_ATTEMPTS: u32 = 3;
/// Retry delay after an HTTP 409 from the service.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(1500);
/// Connect window including the service's internal retries.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Remote BLE client.
pub struct RemoteBleClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    router: Arc<MessageRouter>,
    status: Mutex<BleStatus>,
    running: AtomicBool,
    /// Set by a user-requested disconnect; cancels the reconnect ladder.
    user_disconnect: AtomicBool,
    reconnect_step: AtomicUsize,
    shutdown: CancellationToken,
    stream_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RemoteBleClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        router: Arc<MessageRouter>,
    ) -> GatewayResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
            router,
            status: Mutex::new(BleStatus::disconnected(BleMode::Remote)),
            running: AtomicBool::new(false),
            user_disconnect: AtomicBool::new(false),
            reconnect_step: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            stream_task: AsyncMutex::new(None),
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.lock().expect("status poisoned").state = state;
    }

    /// One REST call to the service. A single 409 retry with a short delay;
    /// persistent busy surfaces as [`GatewayError::BleBusy`].
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        timeout: Option<Duration>,
    ) -> GatewayResult<Value> {
        for attempt in 0..2 {
            let mut req = self.http.request(method.clone(), self.url(path));
            if let Some(key) = &self.api_key {
                req = req.header("X-API-Key", key);
            }
            if let Some(body) = &body {
                req = req.json(body);
            }
            if let Some(t) = timeout {
                req = req.timeout(t);
            }

            let resp = req.send().await?;
            let status = resp.status();

            if status.as_u16() == 409 {
                if attempt == 0 {
                    info!(path, "BLE service busy (409), retrying once");
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                    continue;
                }
                return Err(GatewayError::BleBusy);
            }

            let data: Value = resp.json().await.unwrap_or_else(|_| json!({}));
            if status.is_client_error() || status.is_server_error() {
                let detail = data
                    .get("detail")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(GatewayError::Validation(format!(
                    "BLE service error ({status}): {detail}"
                )));
            }
            return Ok(data);
        }
        Err(GatewayError::BleBusy)
    }

    async fn publish_status(&self, command: &str, result: &str, msg: &str) {
        let payload = json!({
            "src_type": "BLE",
            "TYP": "blueZ",
            "command": command,
            "result": result,
            "msg": msg,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        self.router
            .publish("ble", Topic::BleStatus, RouterEvent::Status(payload))
            .await;
    }

    /// Send one A0 command with exponential backoff.
    async fn send_command_with_retry(&self, cmd: &str) -> bool {
        for attempt in 0..QUERY_ATTEMPTS {
            match self.send_command(cmd).await {
                Ok(true) => {
                    if attempt > 0 {
                        info!(cmd, attempt = attempt + 1, "command succeeded after retry");
                    }
                    return true;
                }
                Ok(false) | Err(_) if attempt + 1 < QUERY_ATTEMPTS => {
                    let delay = RETRY_BASE * 2u32.pow(attempt);
                    warn!(cmd, attempt = attempt + 1, ?delay, "command failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(false) => return false,
                Err(e) => {
                    error!(cmd, error = %e, "command failed after retries");
                    return false;
                }
            }
        }
        false
    }

    /// Post-connect sequence: let the hello handshake settle, sync the node
    /// clock, then query the registers the node does not auto-send
    /// (`--io`, `--tel`).
    pub async fn after_connect(&self, wait_for_hello: bool) {
        if wait_for_hello {
            debug!("waiting for hello handshake to settle");
            tokio::time::sleep(HELLO_SETTLE).await;
            if let Err(e) = self.set_command("--settime").await {
                warn!(error = %e, "time sync failed (non-critical)");
            } else {
                info!("device time synchronized after connection");
            }
        }

        for cmd in ["--io", "--tel"] {
            if !self.send_command_with_retry(cmd).await {
                warn!(cmd, "register query failed (non-critical)");
            }
            tokio::time::sleep(QUERY_SPACING).await;
        }
        debug!("register queries complete (IO + TM)");
    }

    // ── Notification stream ─────────────────────────────────────

    /// SSE notification loop. Runs until shutdown; reconnects with the
    /// ladder when the stream drops and the user did not disconnect.
    async fn notification_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled() {
            match self.stream_once().await {
                Ok(()) => {
                    // Server closed the stream; treat like a drop.
                    self.reconnect_step.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    if self.user_disconnect.load(Ordering::SeqCst) {
                        info!("user disconnect set, stopping notification stream");
                        break;
                    }
                    let step = self.reconnect_step.fetch_add(1, Ordering::SeqCst);
                    let delay =
                        RECONNECT_LADDER_SECS[step.min(RECONNECT_LADDER_SECS.len() - 1)];
                    warn!(error = %e, delay_secs = delay, "notification stream dropped, reconnecting");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    }
                }
            }
        }
    }

    /// One connection to the notification stream; parses SSE events off the
    /// byte stream.
    async fn stream_once(&self) -> GatewayResult<()> {
        let mut req = self.http.get(self.url("/api/ble/notifications"));
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        // No total timeout: the stream is long-lived, pings keep it warm.
        let resp = req.timeout(Duration::from_secs(86_400)).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Validation(format!(
                "notification stream refused: {}",
                resp.status()
            )));
        }
        info!("connected to BLE notification stream");
        self.reconnect_step.store(0, Ordering::SeqCst);

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            c = stream.next() => c,
        } {
            let chunk = chunk?;
            for event in parser.push(&chunk) {
                self.handle_stream_event(event).await;
            }
        }
        Ok(())
    }

    async fn handle_stream_event(&self, event: SseEvent) {
        match event.event.as_deref().unwrap_or("message") {
            "notification" => self.handle_notification(&event.data).await,
            "status" => self.handle_status_event(&event.data),
            "ping" => debug!("SSE ping received"),
            other => debug!(event = other, "ignoring unknown stream event"),
        }
    }

    /// Decode one notification and publish it on `ble_notification`.
    async fn handle_notification(&self, data: &str) {
        let parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "invalid notification JSON");
                return;
            }
        };

        let raw = match parsed.get("raw_hex").and_then(Value::as_str) {
            Some(h) => match hex::decode(h) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "notification raw_hex not decodable");
                    return;
                }
            },
            None => {
                // Pre-parsed JSON notifications pass through as-is.
                if let Some(inner) = parsed.get("parsed") {
                    self.publish_decoded_json(inner.clone(), &parsed).await;
                }
                return;
            }
        };

        let own = self.router.my_callsign().unwrap_or("").to_string();
        match protocol::decode_notification(&raw, &own) {
            Ok(BleDecoded::Mesh(mut mesh)) => {
                if let Some(ts) = parsed.get("timestamp_ms").and_then(Value::as_i64) {
                    if mesh.is_mheard_beacon() {
                        // MH entries keep the node clock; everything else
                        // uses the service receive time.
                    } else {
                        mesh.timestamp = ts;
                    }
                }
                self.router
                    .publish("ble", Topic::BleNotification, RouterEvent::Mesh(mesh))
                    .await;
            }
            Ok(BleDecoded::Register(dump)) => {
                self.router
                    .publish("ble", Topic::BleNotification, RouterEvent::Status(dump))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "undecodable BLE notification dropped");
            }
        }
    }

    async fn publish_decoded_json(&self, inner: Value, envelope: &Value) {
        let mut dump = inner;
        if let (Some(obj), Some(ts)) = (
            dump.as_object_mut(),
            envelope.get("timestamp_ms").and_then(Value::as_i64),
        ) {
            obj.insert("timestamp".into(), json!(ts));
        }
        self.router
            .publish("ble", Topic::BleNotification, RouterEvent::Status(dump))
            .await;
    }

    fn handle_status_event(&self, data: &str) {
        let status: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return,
        };
        let state_str = status.get("state").and_then(Value::as_str).unwrap_or("disconnected");
        let state = match state_str {
            "connected" => ConnectionState::Connected,
            "connecting" => ConnectionState::Connecting,
            "disconnecting" => ConnectionState::Disconnecting,
            "error" => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        };
        debug!(state = state_str, "remote status update");
        let mut guard = self.status.lock().expect("status poisoned");
        guard.state = state;
        if state == ConnectionState::Disconnected {
            guard.device_address = None;
        }
    }
}

#[async_trait]
impl BleClient for RemoteBleClient {
    async fn start(self: Arc<Self>) -> GatewayResult<()> {
        info!(url = %self.base_url, "starting remote BLE client");
        self.running.store(true, Ordering::SeqCst);

        match self
            .request(reqwest::Method::GET, "/api/ble/status", None, None)
            .await
        {
            Ok(status) => {
                info!(
                    state = status.get("state").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                    "remote service status"
                );
                if status.get("connected").and_then(Value::as_bool).unwrap_or(false) {
                    let mut guard = self.status.lock().expect("status poisoned");
                    guard.state = ConnectionState::Connected;
                    guard.device_address = status
                        .get("device_address")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
            Err(e) => {
                warn!(error = %e, "remote BLE service not ready yet, stream loop will retry");
                self.publish_status(
                    "remote connect",
                    "error",
                    &format!("Cannot reach BLE service at {}: {e}", self.base_url),
                )
                .await;
            }
        }

        // The stream loop owns reconnection from here on.
        let handle = tokio::spawn(self.clone().notification_loop());
        *self.stream_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        info!("stopping remote BLE client");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(handle) = self.stream_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn scan(&self, timeout_secs: f64, prefix: &str) -> GatewayResult<Vec<BleDevice>> {
        self.publish_status("scan BLE", "info", "Starting remote scan...")
            .await;
        let path = format!("/api/ble/devices?timeout={timeout_secs}&prefix={prefix}");
        let resp = self
            .request(reqwest::Method::GET, &path, None, Some(Duration::from_secs(20)))
            .await?;
        let devices: Vec<BleDevice> = resp
            .get("devices")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        self.publish_status(
            "scan BLE result",
            "ok",
            &format!("Found {} devices", devices.len()),
        )
        .await;
        Ok(devices)
    }

    async fn connect(&self, mac: &str) -> GatewayResult<bool> {
        if self.status().state == ConnectionState::Connecting {
            info!("connect already in progress, ignoring duplicate request");
            return Ok(false);
        }
        self.user_disconnect.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        self.publish_status("connect BLE", "info", &format!("Connecting to {mac}..."))
            .await;

        let result = self
            .request(
                reqwest::Method::POST,
                "/api/ble/connect",
                Some(json!({ "device_address": mac })),
                Some(CONNECT_TIMEOUT),
            )
            .await;

        match result {
            Ok(resp) => {
                let success = resp.get("success").and_then(Value::as_bool).unwrap_or(false);
                if success {
                    {
                        let mut guard = self.status.lock().expect("status poisoned");
                        guard.state = ConnectionState::Connected;
                        guard.device_address = Some(mac.to_string());
                        guard.error = None;
                    }
                    self.publish_status("connect BLE result", "ok", &format!("Connected to {mac}"))
                        .await;
                    self.after_connect(true).await;
                } else {
                    let message = resp
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Connection failed")
                        .to_string();
                    {
                        let mut guard = self.status.lock().expect("status poisoned");
                        guard.state = ConnectionState::Error;
                        guard.error = Some(message.clone());
                    }
                    self.publish_status("connect BLE result", "error", &message).await;
                }
                Ok(success)
            }
            Err(e) => {
                {
                    let mut guard = self.status.lock().expect("status poisoned");
                    guard.state = ConnectionState::Error;
                    guard.error = Some(e.to_string());
                }
                self.publish_status("connect BLE result", "error", &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> GatewayResult<bool> {
        self.user_disconnect.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnecting);
        self.publish_status("disconnect BLE", "info", "Disconnecting...").await;

        let result = self
            .request(reqwest::Method::POST, "/api/ble/disconnect", None, None)
            .await;

        {
            let mut guard = self.status.lock().expect("status poisoned");
            guard.state = ConnectionState::Disconnected;
            guard.device_address = None;
        }

        match result {
            Ok(resp) => {
                self.publish_status("disconnect BLE result", "ok", "Disconnected")
                    .await;
                Ok(resp.get("success").and_then(Value::as_bool).unwrap_or(true))
            }
            Err(e) => {
                self.publish_status("disconnect BLE result", "error", &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn pair(&self, mac: &str) -> GatewayResult<bool> {
        self.publish_status("pair BLE", "info", &format!("Pairing with {mac}..."))
            .await;
        let resp = self
            .request(
                reqwest::Method::POST,
                "/api/ble/pair",
                Some(json!({ "device_address": mac })),
                Some(Duration::from_secs(30)),
            )
            .await?;
        let success = resp.get("success").and_then(Value::as_bool).unwrap_or(false);
        self.publish_status(
            "pair BLE result",
            if success { "ok" } else { "error" },
            resp.get("message").and_then(Value::as_str).unwrap_or(""),
        )
        .await;
        Ok(success)
    }

    async fn unpair(&self, mac: &str) -> GatewayResult<bool> {
        self.publish_status("unpair BLE", "info", &format!("Unpairing {mac}..."))
            .await;
        let resp = self
            .request(
                reqwest::Method::POST,
                "/api/ble/unpair",
                Some(json!({ "device_address": mac })),
                None,
            )
            .await?;
        let success = resp.get("success").and_then(Value::as_bool).unwrap_or(false);
        self.publish_status(
            "unpair BLE result",
            if success { "ok" } else { "error" },
            resp.get("message").and_then(Value::as_str).unwrap_or(""),
        )
        .await;
        Ok(success)
    }

    async fn send_message(&self, msg: &str, dst: &str) -> GatewayResult<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                "/api/ble/send",
                Some(json!({ "message": msg, "group": dst })),
                None,
            )
            .await?;
        Ok(resp.get("success").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn send_command(&self, cmd: &str) -> GatewayResult<bool> {
        if !self.is_connected() {
            return Ok(false);
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                "/api/ble/send",
                Some(json!({ "command": cmd })),
                None,
            )
            .await?;
        Ok(resp.get("success").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn set_command(&self, cmd: &str) -> GatewayResult<bool> {
        if cmd == "--settime" {
            let resp = self
                .request(reqwest::Method::POST, "/api/ble/settime", None, None)
                .await?;
            return Ok(resp.get("success").and_then(Value::as_bool).unwrap_or(false));
        }
        self.send_command(cmd).await
    }

    fn status(&self) -> BleStatus {
        self.status.lock().expect("status poisoned").clone()
    }

    async fn refresh_status(&self) -> BleStatus {
        match self
            .request(reqwest::Method::GET, "/api/ble/status", None, None)
            .await
        {
            Ok(resp) => {
                let mut guard = self.status.lock().expect("status poisoned");
                if resp.get("connected").and_then(Value::as_bool).unwrap_or(false) {
                    guard.state = ConnectionState::Connected;
                    guard.device_address = resp
                        .get("device_address")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    guard.device_name = resp
                        .get("device_name")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                } else {
                    guard.state = match resp.get("state").and_then(Value::as_str) {
                        Some("connecting") => ConnectionState::Connecting,
                        Some("disconnecting") => ConnectionState::Disconnecting,
                        Some("error") => ConnectionState::Error,
                        _ => ConnectionState::Disconnected,
                    };
                    guard.device_address = None;
                }
                guard.error = resp
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                guard.clone()
            }
            Err(e) => {
                let mut guard = self.status.lock().expect("status poisoned");
                guard.error = Some(e.to_string());
                guard.clone()
            }
        }
    }
}

/// The router's outbound BLE bridge.
pub struct BleTransportBridge {
    client: Arc<dyn BleClient>,
}

impl BleTransportBridge {
    pub fn new(client: Arc<dyn BleClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MeshTransport for BleTransportBridge {
    async fn send_message(&self, out: &OutboundMessage) -> GatewayResult<()> {
        let sent = self.client.send_message(&out.msg, &out.dst).await?;
        if !sent {
            return Err(GatewayError::TransportUnavailable {
                transport: "BLE".to_string(),
            });
        }
        Ok(())
    }
}

/// One parsed SSE event.
#[derive(Debug, Default, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Minimal incremental SSE parser over a byte stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.current_data.is_empty() {
                    events.push(SseEvent {
                        event: self.current_event.take(),
                        data: self.current_data.join("\n"),
                    });
                    self.current_data.clear();
                } else {
                    self.current_event = None;
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.current_event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.current_data.push(value.trim_start().to_string());
            }
            // Comment lines (": keepalive") and ids are ignored.
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_sse_events_across_chunk_boundaries() {
        let mut parser = SseParser::default();
        let first = parser.push(b"event: notification\ndata: {\"a\"");
        assert!(first.is_empty(), "event not complete yet");

        let second = parser.push(b": 1}\n\n");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].event.as_deref(), Some("notification"));
        assert_eq!(second[0].data, "{\"a\": 1}");
    }

    #[test]
    fn test_should_ignore_keepalive_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(b": keepalive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_should_join_multi_line_data() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }
}
