//! Canonical message records and the outbound normalizer.
//!
//! Every inbound packet, whatever the transport, is decoded into a
//! [`MeshMessage`]; every UI submission becomes an [`OutboundMessage`] that
//! passes through the [`MessageNormalizer`] before it can reach a radio.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{self, Callsign, Destination};

/// Trailing echo tag: `{NNN` with exactly three digits at end of message.
static ECHO_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\d{3})$").expect("static pattern"));

/// Inline ACK tail: whitespace plus `:ackNNN` at end of message.
static ACK_TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+:ack(\d{3})$").expect("static pattern"));

/// Message classification on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Chat text
    Msg,
    /// Position beacon (including MHeard samples)
    Pos,
    /// Binary ACK frame
    Ack,
    /// APRS `T#` telemetry
    Tele,
}

impl MessageKind {
    /// Table value used by the storage layer.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Msg => "msg",
            MessageKind::Pos => "pos",
            MessageKind::Ack => "ack",
            MessageKind::Tele => "tele",
        }
    }
}

/// Position fields carried by `pos` records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Altitude in metres; adapters convert feet at ingress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aprs_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aprs_symbol_group: Option<String>,
    /// Battery percentage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batt: Option<i32>,
}

/// Telemetry readings carried by `tele` records (and some weather-station
/// position beacons).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReadings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tele_seq: Option<u32>,
    /// Temperature, °C
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp1: Option<f64>,
    /// Relative humidity, %
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hum: Option<f64>,
    /// Station pressure, hPa
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qfe: Option<f64>,
    /// Sea-level pressure, hPa
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qnh: Option<f64>,
    /// CO2, ppm
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2: Option<i64>,
}

impl TelemetryReadings {
    /// True when every sensor reading is absent or zero.
    pub fn is_all_zero(&self) -> bool {
        self.temp1.unwrap_or(0.0) == 0.0
            && self.hum.unwrap_or(0.0) == 0.0
            && self.qfe.unwrap_or(0.0) == 0.0
            && self.qnh.unwrap_or(0.0) == 0.0
            && self.co2.unwrap_or(0) == 0
    }
}

/// The canonical decoded message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMessage {
    /// 32-bit message id rendered as `%08X`; absent for beacon-style packets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub src: String,
    pub dst: String,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Milliseconds since epoch
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    /// Source transport tag: `ble`, `lora`, `node`
    pub src_type: String,
    /// Decoder that produced the record (`msg`, `pos`, `ack`, `tele`,
    /// `mh`, `generic_ble`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformer: Option<String>,
    /// Relay path (comma separated), excluding the originating station
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora_mod: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hop: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_info: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_sub: Option<String>,
    /// Original message id acknowledged by an ACK frame, `%08X`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
    #[serde(flatten)]
    pub position: Option<PositionReport>,
    #[serde(flatten)]
    pub telemetry: Option<TelemetryReadings>,
}

impl MeshMessage {
    /// Minimal record used by synthetic and test messages.
    pub fn new(src: &str, dst: &str, msg: &str, kind: MessageKind, src_type: &str) -> Self {
        Self {
            msg_id: None,
            src: src.to_string(),
            dst: dst.to_string(),
            msg: msg.to_string(),
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            rssi: None,
            snr: None,
            src_type: src_type.to_string(),
            transformer: None,
            via: None,
            hw_id: None,
            lora_mod: None,
            max_hop: None,
            mesh_info: None,
            firmware: None,
            fw_sub: None,
            ack_id: None,
            position: None,
            telemetry: None,
        }
    }

    /// Callsign part of `src` (the radio appends the relay path after a
    /// comma).
    pub fn src_callsign(&self) -> &str {
        self.src.split(',').next().unwrap_or(&self.src).trim()
    }

    /// Trailing `{NNN` echo tag, if present.
    pub fn echo_id(&self) -> Option<&str> {
        ECHO_TAG_RE
            .captures(&self.msg)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Inline `:ackNNN` tail, if present.
    pub fn ack_tail(&self) -> Option<&str> {
        ACK_TAIL_RE
            .captures(&self.msg)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// True for MHeard beacons: position sample from BLE with no message id.
    pub fn is_mheard_beacon(&self) -> bool {
        self.kind == MessageKind::Pos && self.msg_id.is_none() && self.src_type == "ble"
    }
}

/// A message submitted for transmission (UI, command engine, beacons).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub dst: String,
    pub msg: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: MessageKind,
    #[serde(default)]
    pub src_type: String,
}

fn default_kind() -> MessageKind {
    MessageKind::Msg
}

impl OutboundMessage {
    pub fn new(dst: &str, msg: &str, src_type: &str) -> Self {
        Self {
            src: None,
            dst: dst.to_string(),
            msg: msg.to_string(),
            kind: MessageKind::Msg,
            src_type: src_type.to_string(),
        }
    }
}

/// Why the suppression oracle decided the way it did; surfaces in debug logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressReason {
    NotOurMessage,
    NotACommand,
    InvalidDestination,
    NoTarget,
    TargetIsUs,
    RemoteTarget(String),
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressReason::NotOurMessage => write!(f, "not our message"),
            SuppressReason::NotACommand => write!(f, "not a command"),
            SuppressReason::InvalidDestination => write!(f, "invalid destination"),
            SuppressReason::NoTarget => write!(f, "no target, local execution"),
            SuppressReason::TargetIsUs => write!(f, "target is us, local execution"),
            SuppressReason::RemoteTarget(t) => write!(f, "target is {t}, send to mesh"),
        }
    }
}

/// Normalization and the suppression oracle for outbound traffic.
///
/// Carries the operator's own callsign; everything it touches is uppercased
/// at the boundary so downstream comparisons are exact.
#[derive(Debug, Clone)]
pub struct MessageNormalizer {
    my_callsign: Callsign,
}

impl MessageNormalizer {
    pub fn new(my_callsign: Callsign) -> Self {
        Self { my_callsign }
    }

    pub fn my_callsign(&self) -> &str {
        self.my_callsign.as_ref()
    }

    /// Normalize an outbound message in place: trim and uppercase source
    /// (up to the first comma, the radio appends the relay path there) and
    /// destination; uppercase the text only when it is a command.
    pub fn normalize(&self, out: &mut OutboundMessage) {
        if let Some(src) = &out.src {
            let head = src.split(',').next().unwrap_or(src);
            out.src = Some(head.trim().to_uppercase());
        }
        out.dst = out.dst.trim().to_uppercase();
        let msg = out.msg.trim();
        out.msg = if msg.starts_with('!') {
            msg.to_uppercase()
        } else {
            msg.to_string()
        };
        if out.src.as_deref().unwrap_or("").is_empty() {
            out.src = Some(self.my_callsign().to_string());
        }
    }

    /// Extract the target callsign from a command message.
    ///
    /// An explicit `TARGET:X` argument wins wherever it appears; `LOCAL` or
    /// empty means explicit-local. Otherwise arguments are scanned right to
    /// left, skipping `key:value` tokens, and the first callsign-shaped
    /// token is the target. `GROUP`, `KB` and `TOPIC` never carry targets.
    pub fn extract_target_callsign(&self, msg: &str) -> Option<String> {
        if !msg.starts_with('!') {
            return None;
        }
        let upper = msg.trim().to_uppercase();
        let parts: Vec<&str> = upper.split_whitespace().collect();
        if parts.len() < 2 {
            return None;
        }

        let command = &parts[0][1..];
        if matches!(command, "GROUP" | "KB" | "TOPIC") {
            return None;
        }

        for part in &parts[1..] {
            if let Some(potential) = part.strip_prefix("TARGET:") {
                if potential.is_empty() || potential == "LOCAL" {
                    return None;
                }
                if domain::is_target_callsign(potential) {
                    return Some(potential.to_string());
                }
                return None;
            }
        }

        for part in parts[1..].iter().rev() {
            if part.contains(':') {
                continue;
            }
            if domain::is_target_callsign(part) {
                return Some((*part).to_string());
            }
        }

        None
    }

    /// The suppression oracle: should this outbound message be diverted to
    /// local command execution instead of being sent to the radio?
    ///
    /// Assumes the message has already been normalized.
    pub fn should_suppress_outbound(&self, out: &OutboundMessage) -> bool {
        matches!(
            self.suppression_reason(out),
            SuppressReason::InvalidDestination
                | SuppressReason::NoTarget
                | SuppressReason::TargetIsUs
        )
    }

    /// Full decision with reason, applied in documented rule order.
    pub fn suppression_reason(&self, out: &OutboundMessage) -> SuppressReason {
        let src = out.src.as_deref().unwrap_or("");
        if src != self.my_callsign() {
            return SuppressReason::NotOurMessage;
        }
        if !out.msg.starts_with('!') {
            return SuppressReason::NotACommand;
        }
        if !Destination::classify(&out.dst).is_valid() {
            return SuppressReason::InvalidDestination;
        }
        match self.extract_target_callsign(&out.msg) {
            None => SuppressReason::NoTarget,
            Some(target) if target == self.my_callsign() => SuppressReason::TargetIsUs,
            Some(target) => SuppressReason::RemoteTarget(target),
        }
    }

    /// Build the synthetic mesh record the router hands to command-handler
    /// subscribers when a message is suppressed or self-targeted.
    pub fn synthesize(&self, out: &OutboundMessage, src_type: &str) -> MeshMessage {
        let now = chrono::Utc::now();
        let mut mesh = MeshMessage::new(
            out.src.as_deref().unwrap_or_else(|| self.my_callsign()),
            &out.dst,
            &out.msg,
            MessageKind::Msg,
            src_type,
        );
        mesh.msg_id = Some(format!("{:08X}", now.timestamp() as u32));
        mesh.timestamp = now.timestamp() * 1000;
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> MessageNormalizer {
        MessageNormalizer::new(Callsign::try_new("DK5EN-1").unwrap())
    }

    fn outbound(src: &str, dst: &str, msg: &str) -> OutboundMessage {
        let mut out = OutboundMessage::new(dst, msg, "udp");
        out.src = Some(src.to_string());
        let n = normalizer();
        n.normalize(&mut out);
        out
    }

    #[test]
    fn test_should_uppercase_commands_but_preserve_plain_text() {
        let n = normalizer();
        let mut cmd = OutboundMessage::new("20", "!wx call:dk5en-1", "udp");
        n.normalize(&mut cmd);
        assert_eq!(cmd.msg, "!WX CALL:DK5EN-1");

        let mut plain = OutboundMessage::new("20", "Hello World", "udp");
        n.normalize(&mut plain);
        assert_eq!(plain.msg, "Hello World");
    }

    #[test]
    fn test_should_trim_relay_path_from_source_when_normalizing() {
        let n = normalizer();
        let mut out = OutboundMessage::new("20", "hi", "udp");
        out.src = Some("dk5en-1,DB0ABC-12".to_string());
        n.normalize(&mut out);
        assert_eq!(out.src.as_deref(), Some("DK5EN-1"));
    }

    #[test]
    fn test_should_extract_explicit_target_anywhere_in_arguments() {
        let n = normalizer();
        assert_eq!(
            n.extract_target_callsign("!CTCPING CALL:DK5EN-99 TARGET:OE5HWN-12"),
            Some("OE5HWN-12".to_string())
        );
        assert_eq!(n.extract_target_callsign("!WX TARGET:LOCAL"), None);
        assert_eq!(n.extract_target_callsign("!WX TARGET:"), None);
    }

    #[test]
    fn test_should_scan_positionals_right_to_left_skipping_key_values() {
        let n = normalizer();
        assert_eq!(
            n.extract_target_callsign("!TIME DK5EN-1"),
            Some("DK5EN-1".to_string())
        );
        // key:value tokens are skipped even when they look callsign-ish
        assert_eq!(
            n.extract_target_callsign("!SEARCH CALL:OE1ABC DK5EN-1"),
            Some("DK5EN-1".to_string())
        );
        assert_eq!(n.extract_target_callsign("!MHEARD 5"), None);
    }

    #[test]
    fn test_should_never_extract_target_for_group_kb_topic() {
        let n = normalizer();
        assert_eq!(n.extract_target_callsign("!GROUP ON1XYZ-1"), None);
        assert_eq!(n.extract_target_callsign("!KB DK5EN-2"), None);
        assert_eq!(n.extract_target_callsign("!TOPIC 20 DK5EN-2"), None);
    }

    // Suppression table from the router's documented scenarios.
    #[test]
    fn test_should_suppress_group_command_without_target() {
        let n = normalizer();
        assert!(n.should_suppress_outbound(&outbound("DK5EN-1", "20", "!WX")));
    }

    #[test]
    fn test_should_forward_group_command_with_remote_target() {
        let n = normalizer();
        assert!(!n.should_suppress_outbound(&outbound("DK5EN-1", "20", "!WX OE5HWN-12")));
    }

    #[test]
    fn test_should_suppress_group_command_with_own_target() {
        let n = normalizer();
        assert!(n.should_suppress_outbound(&outbound("DK5EN-1", "20", "!WX DK5EN-1")));
    }

    #[test]
    fn test_should_suppress_direct_command_without_target() {
        let n = normalizer();
        assert!(n.should_suppress_outbound(&outbound("DK5EN-1", "OE5HWN-12", "!TIME")));
    }

    #[test]
    fn test_should_forward_direct_command_with_partner_target() {
        let n = normalizer();
        assert!(!n.should_suppress_outbound(&outbound(
            "DK5EN-1",
            "OE5HWN-12",
            "!TIME OE5HWN-12"
        )));
    }

    #[test]
    fn test_should_suppress_invalid_destinations() {
        let n = normalizer();
        assert!(n.should_suppress_outbound(&outbound("DK5EN-1", "*", "!WX")));
        assert!(n.should_suppress_outbound(&outbound("DK5EN-1", "ALL", "!WX")));
    }

    #[test]
    fn test_should_never_suppress_foreign_messages() {
        let n = normalizer();
        assert!(!n.should_suppress_outbound(&outbound("OE5HWN-12", "20", "!WX")));
    }

    #[test]
    fn test_should_never_suppress_plain_text() {
        let n = normalizer();
        assert!(!n.should_suppress_outbound(&outbound("DK5EN-1", "20", "hello")));
    }

    #[test]
    fn test_should_detect_echo_and_ack_tails() {
        let echo = MeshMessage::new("DK5EN-1", "20", "Ping test 1/3 to measure roundtrip{829", MessageKind::Msg, "lora");
        assert_eq!(echo.echo_id(), Some("829"));

        let ack = MeshMessage::new("OE5HWN-12", "DK5EN-1", "ok :ack829", MessageKind::Msg, "lora");
        assert_eq!(ack.ack_tail(), Some("829"));

        let plain = MeshMessage::new("DK5EN-1", "20", "hello", MessageKind::Msg, "lora");
        assert_eq!(plain.echo_id(), None);
        assert_eq!(plain.ack_tail(), None);
    }

    #[test]
    fn test_should_split_relay_path_from_source_callsign() {
        let msg = MeshMessage::new("DO7TW-1,DB0FHR-12", "20", "hi", MessageKind::Msg, "lora");
        assert_eq!(msg.src_callsign(), "DO7TW-1");
    }
}
