//! BLE adapter.
//!
//! Two implementations satisfy the same contract: a local adapter speaking
//! D-Bus/BlueZ (deployed as a separate service) and the remote adapter the
//! gateway uses to talk to it over HTTP + SSE. This crate ships the remote
//! adapter and a disabled stub; the local service is external and specified
//! only by its wire contract.

pub mod protocol;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

/// BLE operation mode selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BleMode {
    Remote,
    Disabled,
}

impl std::str::FromStr for BleMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remote" => Ok(BleMode::Remote),
            "disabled" => Ok(BleMode::Disabled),
            other => Err(format!("invalid BLE mode '{other}'")),
        }
    }
}

/// BLE connection state machine.
///
/// `Error` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Snapshot of the adapter's connection status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub mode: BleMode,
}

impl BleStatus {
    pub fn disconnected(mode: BleMode) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device_address: None,
            device_name: None,
            error: None,
            mode,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// A discovered BLE device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleDevice {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub rssi: i32,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub known: bool,
}

/// The BLE client contract used by the router and the HTTP layer.
#[async_trait]
pub trait BleClient: Send + Sync {
    /// Start background work (status poll, notification stream).
    async fn start(self: Arc<Self>) -> GatewayResult<()>;
    /// Stop background work and drop the session.
    async fn stop(&self);
    /// Scan for nearby devices.
    async fn scan(&self, timeout_secs: f64, prefix: &str) -> GatewayResult<Vec<BleDevice>>;
    /// Connect to a device by MAC address.
    async fn connect(&self, mac: &str) -> GatewayResult<bool>;
    /// Disconnect; sets the user-disconnect flag that cancels reconnects.
    async fn disconnect(&self) -> GatewayResult<bool>;
    async fn pair(&self, mac: &str) -> GatewayResult<bool>;
    async fn unpair(&self, mac: &str) -> GatewayResult<bool>;
    /// Send a chat message to a destination group/callsign.
    async fn send_message(&self, msg: &str, dst: &str) -> GatewayResult<bool>;
    /// Send an `--` A0 command (`--pos`, `--io`, ...).
    async fn send_command(&self, cmd: &str) -> GatewayResult<bool>;
    /// Send a set command (`--settime`, `--setCALL`, ...).
    async fn set_command(&self, cmd: &str) -> GatewayResult<bool>;
    /// Current status from the adapter's cache.
    fn status(&self) -> BleStatus;
    /// Refresh status from the remote service.
    async fn refresh_status(&self) -> BleStatus;
    fn is_connected(&self) -> bool {
        self.status().is_connected()
    }
}

/// No-op stub used when BLE is disabled by configuration.
pub struct DisabledBleClient;

#[async_trait]
impl BleClient for DisabledBleClient {
    async fn start(self: Arc<Self>) -> GatewayResult<()> {
        Ok(())
    }
    async fn stop(&self) {}
    async fn scan(&self, _timeout_secs: f64, _prefix: &str) -> GatewayResult<Vec<BleDevice>> {
        Ok(Vec::new())
    }
    async fn connect(&self, _mac: &str) -> GatewayResult<bool> {
        Ok(false)
    }
    async fn disconnect(&self) -> GatewayResult<bool> {
        Ok(true)
    }
    async fn pair(&self, _mac: &str) -> GatewayResult<bool> {
        Ok(false)
    }
    async fn unpair(&self, _mac: &str) -> GatewayResult<bool> {
        Ok(false)
    }
    async fn send_message(&self, _msg: &str, _dst: &str) -> GatewayResult<bool> {
        Ok(false)
    }
    async fn send_command(&self, _cmd: &str) -> GatewayResult<bool> {
        Ok(false)
    }
    async fn set_command(&self, _cmd: &str) -> GatewayResult<bool> {
        Ok(false)
    }
    fn status(&self) -> BleStatus {
        BleStatus::disconnected(BleMode::Disabled)
    }
    async fn refresh_status(&self) -> BleStatus {
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_ble_modes_case_insensitively() {
        assert_eq!("REMOTE".parse::<BleMode>().unwrap(), BleMode::Remote);
        assert_eq!("disabled".parse::<BleMode>().unwrap(), BleMode::Disabled);
        assert!("local".parse::<BleMode>().is_err());
    }

    #[test]
    fn test_should_serialize_connection_state_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
    }
}
