//! HTTP API and Server-Sent-Events fanout.
//!
//! `GET /events` opens a per-client queue. On open the client receives, in
//! order: a `connected` frame, the smart-initial snapshot, the summary, the
//! persisted UI state (read counts, hidden destinations, blocked texts,
//! sidebar orders) and the cached BLE status plus register dumps; after
//! that it drains its queue with a 30-second idle ping. `POST /api/send` is
//! the single write endpoint.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::BleClient;
use crate::error::GatewayResult;
use crate::message::OutboundMessage;
use crate::router::{MessageRouter, RoutedMessage, RouterEvent, Subscriber, Topic};
use crate::storage::ui_state::SidebarState;
use crate::storage::StorageEngine;
use crate::update;
use crate::weather::WeatherService;

/// Idle ping interval on the event stream.
const SSE_PING: Duration = Duration::from_secs(30);
/// Per-client queue depth; slow clients drop events beyond it.
const CLIENT_QUEUE: usize = 256;
/// Update-check cache lifetime.
const UPDATE_CHECK_CACHE: Duration = Duration::from_secs(300);

/// Shared state behind every handler.
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub storage: Arc<StorageEngine>,
    pub weather: Arc<WeatherService>,
    pub ble: Arc<dyn BleClient>,
    clients: DashMap<String, mpsc::Sender<Value>>,
    started_at: Instant,
    update_check: Mutex<Option<(Instant, Value)>>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(
        router: Arc<MessageRouter>,
        storage: Arc<StorageEngine>,
        weather: Arc<WeatherService>,
        ble: Arc<dyn BleClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            storage,
            weather,
            ble,
            clients: DashMap::new(),
            started_at: Instant::now(),
            update_check: Mutex::new(None),
            http: reqwest::Client::new(),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queue an event for every connected client.
    pub fn broadcast(&self, payload: &Value) {
        for entry in self.clients.iter() {
            if entry.value().try_send(payload.clone()).is_err() {
                debug!(client = entry.key().as_str(), "client queue full, event dropped");
            }
        }
    }

    fn send_direct(&self, client_id: &str, payload: &Value) {
        if let Some(sender) = self.clients.get(client_id) {
            let _ = sender.try_send(payload.clone());
        }
    }
}

/// Router subscriber fanning events out to the SSE clients.
pub struct SseFanout {
    state: Arc<AppState>,
}

impl SseFanout {
    /// Subscribe the fanout to every client-visible topic.
    pub fn register(state: Arc<AppState>) {
        let fanout = Arc::new(Self { state: state.clone() });
        for topic in [
            Topic::MeshMessage,
            Topic::WebsocketMessage,
            Topic::BleNotification,
            Topic::BleStatus,
            Topic::WebsocketDirect,
        ] {
            state.router.subscribe(topic, fanout.clone());
        }
    }
}

#[async_trait]
impl Subscriber for SseFanout {
    fn name(&self) -> &'static str {
        "sse_fanout"
    }

    async fn on_event(&self, msg: &RoutedMessage) -> GatewayResult<()> {
        match &msg.event {
            RouterEvent::Direct { client_id, data } => {
                self.state.send_direct(client_id, data);
            }
            event => {
                if let Some(payload) = event.to_client_json() {
                    self.state.broadcast(&payload);
                }
            }
        }
        Ok(())
    }
}

/// Body of `POST /api/send`.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "type", default = "default_send_type")]
    pub kind: String,
    pub src: Option<String>,
    #[serde(default = "default_dst")]
    pub dst: String,
    #[serde(default)]
    pub msg: String,
    #[serde(rename = "MAC")]
    pub mac: Option<String>,
    #[serde(rename = "BLE_Pin")]
    pub ble_pin: Option<String>,
    pub before: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_send_type() -> String {
    "msg".to_string()
}
fn default_dst() -> String {
    "*".to_string()
}
fn default_limit() -> i64 {
    20
}

/// Build the axum application.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", get(events))
        .route("/api/send", post(api_send))
        .route("/api/status", get(api_status))
        .route("/health", get(health))
        .route("/api/read_counts", get(get_read_counts).post(post_read_counts))
        .route(
            "/api/hidden_destinations",
            get(get_hidden_destinations).post(post_hidden_destinations),
        )
        .route("/api/blocked_texts", get(get_blocked_texts).post(post_blocked_texts))
        .route("/api/mheard/sidebar", get(get_mheard_sidebar).post(post_mheard_sidebar))
        .route("/api/wx/sidebar", get(get_wx_sidebar).post(post_wx_sidebar))
        .route("/api/mheard/stats", get(get_mheard_stats))
        .route("/api/weather", get(api_weather))
        .route("/api/telemetry", get(api_telemetry))
        .route("/api/telemetry/yearly", get(api_telemetry_yearly))
        .route("/api/timezone", get(api_timezone))
        .route("/api/time", get(api_time))
        .route("/api/update/check", get(update_check))
        .route("/api/update/start", post(update_start))
        .route("/api/update/rollback", post(update_rollback))
        .route("/api/update/slots", get(update_slots))
        .with_state(state)
}

/// Serve until cancelled.
pub async fn serve(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let app = create_app(state);
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "SSE server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("SSE server stopped");
    Ok(())
}

// ── /events ─────────────────────────────────────────────────────

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let client_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let (tx, rx) = mpsc::channel::<Value>(CLIENT_QUEUE);
    state.clients.insert(client_id.clone(), tx);
    info!(client = %client_id, "SSE client connected");

    let initial = initial_events(&state, &client_id).await;

    struct StreamState {
        state: Arc<AppState>,
        client_id: String,
        rx: mpsc::Receiver<Value>,
        initial: std::vec::IntoIter<Value>,
    }

    impl Drop for StreamState {
        fn drop(&mut self) {
            self.state.clients.remove(&self.client_id);
            info!(client = %self.client_id, "SSE client disconnected");
        }
    }

    let stream_state = StreamState {
        state,
        client_id,
        rx,
        initial: initial.into_iter(),
    };

    let stream = futures::stream::unfold(stream_state, |mut s| async move {
        if let Some(event) = s.initial.next() {
            return Some((Ok(sse_event(&event)), s));
        }
        match tokio::time::timeout(SSE_PING, s.rx.recv()).await {
            Ok(Some(payload)) => Some((Ok(sse_event(&payload)), s)),
            Ok(None) => None,
            Err(_) => {
                let ping = json!({
                    "type": "ping",
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                });
                Some((Ok(sse_event(&ping)), s))
            }
        }
    });

    Sse::new(stream)
}

fn sse_event(payload: &Value) -> Event {
    Event::default().data(payload.to_string())
}

/// The ordered initial payload for a new client.
async fn initial_events(state: &Arc<AppState>, client_id: &str) -> Vec<Value> {
    let mut events = vec![json!({
        "type": "connected",
        "client_id": client_id,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })];

    match state.storage.smart_initial().await {
        Ok(data) => events.push(json!({"type": "response", "msg": "smart_initial", "data": data})),
        Err(e) => warn!(error = %e, "smart_initial failed for new client"),
    }
    if let Ok(summary) = state.storage.summary().await {
        events.push(json!({"type": "response", "msg": "summary", "data": summary}));
    }
    if let Ok(read_counts) = state.storage.read_counts().await {
        if !read_counts.is_empty() {
            events.push(json!({"type": "response", "msg": "read_counts", "data": read_counts}));
        }
    }
    if let Ok(hidden) = state.storage.hidden_destinations().await {
        if !hidden.is_empty() {
            events.push(json!({"type": "response", "msg": "hidden_destinations", "data": hidden}));
        }
    }
    if let Ok(blocked) = state.storage.blocked_texts().await {
        if !blocked.is_empty() {
            events.push(json!({"type": "response", "msg": "blocked_texts", "data": blocked}));
        }
    }
    if let Ok(sidebar) = state.storage.sidebar("mheard").await {
        events.push(json!({"type": "response", "msg": "mheard_sidebar", "data": sidebar}));
    }
    if let Ok(sidebar) = state.storage.sidebar("wx").await {
        events.push(json!({"type": "response", "msg": "wx_sidebar", "data": sidebar}));
    }

    // Current BLE status plus the cached register dumps so the client does
    // not have to re-query the device.
    let status = state.ble.refresh_status().await;
    let ble_info = if status.is_connected() {
        json!({
            "src_type": "BLE",
            "TYP": "blueZ",
            "command": "connect BLE result",
            "result": "ok",
            "msg": "BLE connection already running",
            "device_address": status.device_address,
            "device_name": status.device_name,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        })
    } else {
        json!({
            "src_type": "BLE",
            "TYP": "blueZ",
            "command": "disconnect",
            "result": "ok",
            "msg": "BLE not connected",
            "timestamp": chrono::Utc::now().timestamp_millis(),
        })
    };
    events.push(ble_info);
    if status.is_connected() {
        events.extend(state.router.cached_registers());
    }

    events
}

// ── /api/send ───────────────────────────────────────────────────

async fn api_send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    match req.kind.as_str() {
        "page_request" => {
            let page = state
                .storage
                .messages_page(&req.dst, req.src.as_deref(), req.before, req.limit)
                .await;
            match page {
                Ok((messages, has_more)) => {
                    let payload = json!({
                        "type": "response",
                        "msg": "messages_page",
                        "dst": req.dst,
                        "data": messages,
                        "has_more": has_more,
                    });
                    state.broadcast(&payload);
                    ok_response()
                }
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        "command" => match route_command(&state, &req).await {
            Ok(()) => ok_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        "BLE" => {
            let out = OutboundMessage::new(&req.dst, &req.msg, "sse");
            state
                .router
                .publish("sse", Topic::BleMessage, RouterEvent::Outbound(out))
                .await;
            ok_response()
        }
        _ => {
            let mut out = OutboundMessage::new(&req.dst, &req.msg, "sse");
            out.src = req.src.clone();
            state
                .router
                .publish("sse", Topic::UdpMessage, RouterEvent::Outbound(out))
                .await;
            ok_response()
        }
    }
}

/// UI command strings: BLE management plus raw `--` device commands.
async fn route_command(state: &Arc<AppState>, req: &SendMessageRequest) -> GatewayResult<()> {
    let command = req.msg.as_str();
    debug!(command, "routing UI command");
    match command {
        "smart_initial" | "send message dump" | "send pos dump" => {
            let data = state.storage.smart_initial().await?;
            state.broadcast(&json!({"type": "response", "msg": "smart_initial", "data": data}));
            let summary = state.storage.summary().await?;
            state.broadcast(&json!({"type": "response", "msg": "summary", "data": summary}));
        }
        "summary" => {
            let summary = state.storage.summary().await?;
            state.broadcast(&json!({"type": "response", "msg": "summary", "data": summary}));
        }
        "mheard dump" => {
            let stats = state.storage.mheard_stats_weekly().await?;
            state.broadcast(&json!({"type": "response", "msg": "mheard stats", "data": stats}));
        }
        "scan BLE" => {
            let devices = state.ble.scan(5.0, "MC-").await.unwrap_or_default();
            let ts = chrono::Utc::now().timestamp_millis();
            let (known, unknown): (Vec<_>, Vec<_>) =
                devices.into_iter().partition(|d| d.known);
            state
                .router
                .publish(
                    "ble",
                    Topic::BleStatus,
                    RouterEvent::Status(json!({
                        "src_type": "BLE", "TYP": "blueZknown",
                        "devices": known, "timestamp": ts,
                    })),
                )
                .await;
            state
                .router
                .publish(
                    "ble",
                    Topic::BleStatus,
                    RouterEvent::Status(json!({
                        "src_type": "BLE", "TYP": "blueZunKnown",
                        "devices": unknown, "timestamp": ts,
                    })),
                )
                .await;
        }
        "connect BLE" => {
            let Some(mac) = req.mac.clone() else {
                return Err(crate::error::GatewayError::Validation("MAC required".into()));
            };
            if !state.ble.is_connected() {
                state.ble.connect(&mac).await?;
            }
        }
        "disconnect BLE" => {
            state.ble.disconnect().await?;
        }
        "pair BLE" => {
            let Some(mac) = req.mac.clone() else {
                return Err(crate::error::GatewayError::Validation("MAC required".into()));
            };
            state.ble.pair(&mac).await?;
        }
        "unpair BLE" => {
            let Some(mac) = req.mac.clone() else {
                return Err(crate::error::GatewayError::Validation("MAC required".into()));
            };
            state.ble.unpair(&mac).await?;
        }
        "BLE info" => {
            let status = state.ble.refresh_status().await;
            let payload = serde_json::to_value(&status)?;
            state
                .router
                .publish("ble", Topic::BleStatus, RouterEvent::Status(payload))
                .await;
        }
        "resolve-ip" => {
            let Some(hostname) = req.mac.clone() else {
                return Err(crate::error::GatewayError::Validation("hostname required".into()));
            };
            let (result, msg) = match tokio::net::lookup_host((hostname.as_str(), 0)).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => ("ok", addr.ip().to_string()),
                    None => ("error", format!("no address for {hostname}")),
                },
                Err(e) => ("error", e.to_string()),
            };
            state
                .router
                .publish(
                    "ble",
                    Topic::BleStatus,
                    RouterEvent::Status(json!({
                        "src_type": "BLE", "TYP": "blueZ",
                        "command": "resolve-ip", "result": result, "msg": msg,
                        "timestamp": chrono::Utc::now().timestamp_millis(),
                    })),
                )
                .await;
        }
        cmd if cmd.starts_with("--set") || cmd.starts_with("--sym") => {
            state.ble.set_command(cmd).await?;
        }
        cmd if cmd.starts_with("--") => {
            state.ble.send_command(cmd).await?;
        }
        other => {
            warn!(command = other, "unknown UI command");
            state
                .router
                .publish_system_error(&format!("Unknown command: {other}"))
                .await;
        }
    }
    Ok(())
}

// ── Operational endpoints ───────────────────────────────────────

async fn api_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.client_count(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

// ── UI state endpoints ──────────────────────────────────────────

async fn get_read_counts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.read_counts().await {
        Ok(counts) => Json(json!(counts)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn post_read_counts(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(dst) = body.get("dst").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing dst or count").into_response();
    };
    let Some(count) = body.get("count").and_then(Value::as_i64) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing dst or count").into_response();
    };
    match state.storage.set_read_count(dst, count).await {
        Ok(()) => ok_response().into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn get_hidden_destinations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.hidden_destinations().await {
        Ok(hidden) => Json(json!(hidden)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn post_hidden_destinations(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    // Bulk replace: {destinations: [...]}; single toggle: {dst, hidden}.
    if let Some(all) = body.get("destinations").and_then(Value::as_array) {
        let dsts: Vec<String> = all
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        return match state.storage.set_hidden_destinations(&dsts).await {
            Ok(()) => ok_response().into_response(),
            Err(e) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response()
            }
        };
    }
    let Some(dst) = body.get("dst").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing dst").into_response();
    };
    let hidden = body.get("hidden").and_then(Value::as_bool).unwrap_or(true);
    match state.storage.update_hidden_destination(dst, hidden).await {
        Ok(()) => ok_response().into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn get_blocked_texts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.blocked_texts().await {
        Ok(blocked) => Json(json!(blocked)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn post_blocked_texts(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if let Some(all) = body.get("texts").and_then(Value::as_array) {
        let texts: Vec<String> = all
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        return match state.storage.set_blocked_texts(&texts).await {
            Ok(()) => ok_response().into_response(),
            Err(e) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response()
            }
        };
    }
    let Some(text) = body.get("text").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing text").into_response();
    };
    let blocked = body.get("blocked").and_then(Value::as_bool).unwrap_or(true);
    match state.storage.update_blocked_text(text, blocked).await {
        Ok(()) => ok_response().into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn get_mheard_sidebar(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sidebar_get(&state, "mheard").await
}

async fn post_mheard_sidebar(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    sidebar_post(&state, "mheard", &body).await
}

async fn get_wx_sidebar(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sidebar_get(&state, "wx").await
}

async fn post_wx_sidebar(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    sidebar_post(&state, "wx", &body).await
}

async fn sidebar_get(state: &Arc<AppState>, kind: &str) -> axum::response::Response {
    match state.storage.sidebar(kind).await {
        Ok(sidebar) => Json(json!(sidebar)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn sidebar_post(state: &Arc<AppState>, kind: &str, body: &Value) -> axum::response::Response {
    let to_list = |key: &str| -> Vec<String> {
        body.get(key)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };
    let sidebar = SidebarState {
        order: to_list("order"),
        hidden: to_list("hidden"),
    };
    match state.storage.set_sidebar(kind, &sidebar).await {
        Ok(()) => ok_response().into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

// ── Derived data endpoints ──────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    range: Option<String>,
}

async fn get_mheard_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let result = match query.range.as_deref() {
        Some("yearly") => state.storage.mheard_stats_yearly().await,
        Some("monthly") => state.storage.mheard_stats_monthly().await,
        _ => state.storage.mheard_stats_weekly().await,
    };
    match result {
        Ok(stats) => Json(json!(stats)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn api_weather(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Without a GPS fix: fall back to the router cache, or trigger an
    // on-demand position query toward the node.
    if !state.weather.has_location() {
        if let Some(gps) = state.router.cached_gps() {
            state.weather.update_location(gps.lat, gps.lon);
        } else {
            if state.ble.is_connected() {
                let _ = state.ble.send_command("--pos").await;
            }
            return Json(json!({
                "error": "Waiting for GPS fix from device...",
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }))
            .into_response();
        }
    }

    match state.weather.get_weather().await {
        Ok(data) => Json(state.weather.to_api_json(&data)).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TelemetryQuery {
    #[serde(default = "default_tele_hours")]
    hours: i64,
}

fn default_tele_hours() -> i64 {
    48
}

async fn api_telemetry(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TelemetryQuery>,
) -> impl IntoResponse {
    match state.storage.telemetry_chart_data(query.hours.min(744)).await {
        Ok(data) => Json(json!(data)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn api_telemetry_yearly(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.telemetry_chart_data_bucketed().await {
        Ok(data) => Json(json!(data)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TimezoneQuery {
    lat: f64,
    lon: f64,
}

/// Longitude-derived solar offset; the UI only labels chart axes with it.
async fn api_timezone(Query(query): Query<TimezoneQuery>) -> impl IntoResponse {
    if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lon) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid coordinates").into_response();
    }
    let offset = (query.lon / 15.0).round() as i32;
    let name = if offset >= 0 {
        format!("UTC+{offset}")
    } else {
        format!("UTC{offset}")
    };
    Json(json!({
        "timezone": name,
        "abbreviation": name,
        "utc_offset": offset,
    }))
    .into_response()
}

async fn api_time() -> Json<Value> {
    let now = chrono::Local::now();
    Json(json!({
        "server_time_ms": now.timestamp_millis(),
        "timezone": now.format("%Z").to_string(),
    }))
}

// ── Update endpoints ────────────────────────────────────────────

async fn update_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    {
        let cache = state.update_check.lock().expect("update cache poisoned");
        if let Some((at, cached)) = cache.as_ref() {
            if at.elapsed() < UPDATE_CHECK_CACHE {
                return Json(cached.clone()).into_response();
            }
        }
    }

    let installed = update::slots::installed_version();
    let available = fetch_latest_release(&state.http).await.unwrap_or_else(|| "unknown".to_string());
    let result = json!({
        "installed": installed,
        "available": available,
        "update_available": available != "unknown"
            && installed != "not_installed"
            && available.trim_start_matches('v') != installed.trim_start_matches('v'),
    });

    *state.update_check.lock().expect("update cache poisoned") =
        Some((Instant::now(), result.clone()));
    Json(result).into_response()
}

async fn fetch_latest_release(http: &reqwest::Client) -> Option<String> {
    let resp: Value = http
        .get("https://api.github.com/repos/DK5EN/McApp/releases/latest")
        .header("User-Agent", "McApp")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    resp.get("tag_name").and_then(Value::as_str).map(str::to_string)
}

async fn update_start(
    State(state): State<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let dev = body
        .as_ref()
        .and_then(|Json(b)| b.get("dev"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    launch_runner(&state, "update", dev).await
}

async fn update_rollback(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    launch_runner(&state, "rollback", false).await
}

async fn launch_runner(_state: &Arc<AppState>, mode: &str, dev: bool) -> axum::response::Response {
    // Port busy means a runner is already active.
    if tokio::time::timeout(
        Duration::from_secs(1),
        tokio::net::TcpStream::connect(("127.0.0.1", update::RUNNER_PORT)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
    {
        return error_response(StatusCode::CONFLICT, "Update already in progress").into_response();
    }

    match update::spawn_runner(mode, dev).await {
        Ok(()) => Json(json!({
            "status": "launched",
            "mode": mode,
            "stream_url": format!("http://localhost:{}/stream", update::RUNNER_PORT),
            "status_url": format!("http://localhost:{}/status", update::RUNNER_PORT),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

async fn update_slots() -> impl IntoResponse {
    Json(update::slots::slot_overview())
}

// ── Helpers ─────────────────────────────────────────────────────

fn ok_response() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "message": "Message queued for delivery"})),
    )
}

fn error_response(status: StatusCode, detail: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"detail": detail})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::DisabledBleClient;
    use crate::domain::Callsign;
    use crate::message::MessageNormalizer;
    use crate::storage::test_util::temp_engine;

    async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let (storage, dir) = temp_engine().await;
        let router = Arc::new(MessageRouter::new());
        router.set_normalizer(MessageNormalizer::new(
            Callsign::try_new("DK5EN-1").unwrap(),
        ));
        let weather = Arc::new(WeatherService::new("Test", None, None));
        let state = AppState::new(router, Arc::new(storage), weather, Arc::new(DisabledBleClient));
        (state, dir)
    }

    async fn spawn_server(state: Arc<AppState>) -> (String, CancellationToken) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_app(state);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });
        (format!("http://{addr}"), token)
    }

    #[tokio::test]
    async fn test_should_answer_health_and_status() {
        let (state, _dir) = test_state().await;
        let (base, token) = spawn_server(state).await;

        let client = reqwest::Client::new();
        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");

        let status: Value = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "ok");
        assert_eq!(status["clients"], 0);

        token.cancel();
    }

    #[tokio::test]
    async fn test_should_round_trip_ui_state_endpoints() {
        let (state, _dir) = test_state().await;
        let (base, token) = spawn_server(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/read_counts"))
            .json(&json!({"dst": "20", "count": 7}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let counts: Value = client
            .get(format!("{base}/api/read_counts"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(counts["20"], 7);

        // Missing fields: 400.
        let resp = client
            .post(format!("{base}/api/read_counts"))
            .json(&json!({"dst": "20"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{base}/api/mheard/sidebar"))
            .json(&json!({"order": ["OE5HWN-12"], "hidden": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let sidebar: Value = client
            .get(format!("{base}/api/mheard/sidebar"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sidebar["order"][0], "OE5HWN-12");

        token.cancel();
    }

    #[tokio::test]
    async fn test_should_compute_solar_timezone_offset() {
        let (state, _dir) = test_state().await;
        let (base, token) = spawn_server(state).await;
        let client = reqwest::Client::new();

        let tz: Value = client
            .get(format!("{base}/api/timezone?lat=48.2&lon=12.5"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tz["utc_offset"], 1);

        let resp = client
            .get(format!("{base}/api/timezone?lat=999&lon=0"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        token.cancel();
    }

    #[tokio::test]
    async fn test_should_publish_default_send_as_udp_message() {
        let (state, _dir) = test_state().await;

        // A suppressed self-command must land with ble_notification
        // subscribers (local execution) rather than going to the wire.
        use crate::router::{RoutedMessage, Subscriber};
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Probe(AtomicUsize);
        #[async_trait]
        impl Subscriber for Probe {
            fn name(&self) -> &'static str {
                "probe"
            }
            async fn on_event(&self, _msg: &RoutedMessage) -> GatewayResult<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let probe = Arc::new(Probe(AtomicUsize::new(0)));
        state.router.subscribe(Topic::BleNotification, probe.clone());

        let (base, token) = spawn_server(state).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/api/send"))
            .json(&json!({"type": "msg", "src": "DK5EN-1", "dst": "DK5EN-1", "msg": "!TIME"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // Allow the publish to run.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);

        token.cancel();
    }

    #[tokio::test]
    async fn test_should_stream_initial_snapshot_to_new_client() {
        let (state, _dir) = test_state().await;
        let (base, token) = spawn_server(state.clone()).await;

        let resp = reqwest::Client::new()
            .get(format!("{base}/events"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // Read the first chunk: must contain the connected frame followed
        // by the smart_initial response.
        let mut stream = resp.bytes_stream();
        use futures::StreamExt;
        let mut collected = String::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(2), stream.next()).await
        {
            collected.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if collected.contains("smart_initial") {
                break;
            }
        }
        assert!(collected.contains("\"type\":\"connected\""));
        assert!(collected.contains("smart_initial"));
        assert_eq!(state.client_count(), 1);

        drop(stream);
        token.cancel();
    }
}
