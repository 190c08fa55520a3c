//! Gateway configuration.
//!
//! Values come from compiled defaults overridden by environment variables;
//! the recognized variables match the deployment's service units
//! (`MCAPP_ENV`, `MCAPP_BLE_MODE`, `MCAPP_BLE_URL`, `MCAPP_BLE_API_KEY`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ble::BleMode;

/// Default SQLite database location.
pub const DEFAULT_DB_PATH: &str = "/var/lib/mcapp/messages.db";
/// Default SSE bind.
pub const DEFAULT_SSE_HOST: &str = "0.0.0.0";
pub const DEFAULT_SSE_PORT: u16 = 2981;
/// Default local BLE service URL.
pub const DEFAULT_BLE_URL: &str = "http://127.0.0.1:8081";

/// Message retention defaults, hours.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Chat messages (`msg`), 30 days
    pub prune_hours_msg: u32,
    /// Position rows (`pos`), 8 days
    pub prune_hours_pos: u32,
    /// ACK-like internal rows, 8 days
    pub prune_hours_ack: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            prune_hours_msg: 30 * 24,
            prune_hours_pos: 8 * 24,
            prune_hours_ack: 8 * 24,
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Operator callsign, e.g. `DK5EN-1`
    pub call_sign: String,
    /// Station name shown in weather responses
    pub station_name: String,
    /// Operator info text for `!userinfo`
    pub user_info_text: Option<String>,
    /// Radio host for outbound UDP
    pub udp_target: String,
    pub sse_host: String,
    pub sse_port: u16,
    pub ble_mode: BleMode,
    pub ble_url: String,
    pub ble_api_key: Option<String>,
    pub db_path: PathBuf,
    pub retention: RetentionConfig,
    /// Source callsigns dropped at the storage boundary
    pub block_list: Vec<String>,
    /// Development environment flag (`MCAPP_ENV=dev`)
    pub dev: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_sign: "DK0XXX".to_string(),
            station_name: String::new(),
            user_info_text: None,
            udp_target: "127.0.0.1".to_string(),
            sse_host: DEFAULT_SSE_HOST.to_string(),
            sse_port: DEFAULT_SSE_PORT,
            ble_mode: BleMode::Remote,
            ble_url: DEFAULT_BLE_URL.to_string(),
            ble_api_key: None,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            retention: RetentionConfig::default(),
            block_list: vec!["response".to_string()],
            dev: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, then environment overrides.
    pub fn load() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Apply the recognized environment variables on top of current values.
    pub fn apply_env(&mut self) {
        self.dev = std::env::var("MCAPP_ENV").map(|v| v == "dev").unwrap_or(false);
        if let Ok(call) = std::env::var("MCAPP_CALLSIGN") {
            if !call.trim().is_empty() {
                self.call_sign = call.trim().to_uppercase();
            }
        }
        if let Ok(target) = std::env::var("MCAPP_UDP_TARGET") {
            if !target.trim().is_empty() {
                self.udp_target = target.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("MCAPP_BLE_MODE") {
            if let Ok(parsed) = mode.parse() {
                self.ble_mode = parsed;
            } else {
                tracing::warn!(%mode, "invalid BLE mode, keeping default");
            }
        }
        if let Ok(url) = std::env::var("MCAPP_BLE_URL") {
            if !url.trim().is_empty() {
                self.ble_url = url.trim().to_string();
            }
        }
        // MCAPP_BLE_API_KEY wins; BLE_SERVICE_API_KEY is the shared name
        // the local BLE service units export.
        for var in ["MCAPP_BLE_API_KEY", "BLE_SERVICE_API_KEY"] {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    self.ble_api_key = Some(key);
                    break;
                }
            }
        }
        if let Ok(path) = std::env::var("MCAPP_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = PathBuf::from(path.trim());
            }
        }
    }

    /// Base callsign without SSID; the admin identity.
    pub fn admin_base(&self) -> String {
        crate::domain::base_callsign(&self.call_sign).to_string()
    }

    /// Operator info text with the fallback used when nothing is configured.
    pub fn user_info(&self) -> String {
        self.user_info_text.clone().unwrap_or_else(|| {
            format!("{} Node | No additional info configured", self.call_sign)
        })
    }
}

/// Render an hour count as `DDd HHh` for startup logging.
pub fn hours_to_dd_hh(hours: u32) -> String {
    format!("{}d {:02}h", hours / 24, hours % 24)
}
