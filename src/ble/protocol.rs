//! BLE notification decoding.
//!
//! Payloads beginning with `D{` are JSON register dumps; payloads beginning
//! with `@` are binary mesh messages in the same framing as the UDP path.
//! The `SE`/`S1` and `SW`/`S2` register pairs arrive ~200 ms apart without
//! correlation; each is published independently and merging is left to
//! consumers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::message::{MeshMessage, MessageKind, TelemetryReadings};
use crate::wire;

/// Register dump types emitted by the node.
pub const REGISTER_TYPES: &[&str] = &[
    "MH", "I", "SN", "G", "SA", "W", "IO", "TM", "AN", "SE", "SW", "S1", "S2", "CONFFIN",
];

static APRS_POSITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^!(\d{2})(\d{2}\.\d{2})([NS])([/\\])(\d{3})(\d{2}\.\d{2})([EW])([ -~]?)")
        .expect("static pattern")
});

static APRS_ALT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/A=(\d{6})").expect("static pattern"));
static APRS_BATT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/B=(\d{3})").expect("static pattern"));
static APRS_TELE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^T#(\d+),([\d.]+),([\d.]+),([\d.]+),([\d.]+),([\d.]+),(\d+)")
        .expect("static pattern")
});

static APRS_TEMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/T=([\d.]+)").expect("static pattern"));
static APRS_HUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/H=([\d.]+)").expect("static pattern"));
static APRS_QFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/P=([\d.]+)").expect("static pattern"));
static APRS_QNH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/Q=([\d.]+)").expect("static pattern"));

/// Parsed APRS position report.
#[derive(Debug, Clone, PartialEq)]
pub struct AprsPosition {
    pub lat: f64,
    pub lon: f64,
    /// Metres; the wire carries feet
    pub alt: Option<i32>,
    pub symbol: String,
    pub symbol_group: String,
    pub battery: Option<i32>,
    /// Inline weather fields some stations append
    pub weather: Option<TelemetryReadings>,
}

/// Parse the APRS position format `!DDMM.mmN/DDDMM.mmE<sym>` with optional
/// altitude (`/A=001526`, feet), battery (`/B=085`) and weather fields.
pub fn parse_aprs_position(message: &str) -> Option<AprsPosition> {
    let caps = APRS_POSITION_RE.captures(message)?;

    let lat_deg: f64 = caps[1].parse().ok()?;
    let lat_min: f64 = caps[2].parse().ok()?;
    let lon_deg: f64 = caps[5].parse().ok()?;
    let lon_min: f64 = caps[6].parse().ok()?;

    let mut lat = lat_deg + lat_min / 60.0;
    let mut lon = lon_deg + lon_min / 60.0;
    if &caps[3] == "S" {
        lat = -lat;
    }
    if &caps[7] == "W" {
        lon = -lon;
    }

    let symbol = if caps[8].is_empty() {
        "?".to_string()
    } else {
        caps[8].to_string()
    };

    // Altitude arrives in feet; stored in metres everywhere.
    let alt = APRS_ALT_RE
        .captures(message)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|feet| (feet * 0.3048).round() as i32);

    let battery = APRS_BATT_RE
        .captures(message)
        .and_then(|c| c[1].parse::<i32>().ok());

    let temp1 = APRS_TEMP_RE.captures(message).and_then(|c| c[1].parse().ok());
    let hum = APRS_HUM_RE.captures(message).and_then(|c| c[1].parse().ok());
    let qfe = APRS_QFE_RE.captures(message).and_then(|c| c[1].parse().ok());
    let qnh = APRS_QNH_RE.captures(message).and_then(|c| c[1].parse().ok());
    let weather = if temp1.is_some() || hum.is_some() || qfe.is_some() || qnh.is_some() {
        Some(TelemetryReadings {
            tele_seq: None,
            temp1,
            hum,
            qfe,
            qnh,
            co2: None,
        })
    } else {
        None
    };

    Some(AprsPosition {
        lat: (lat * 10_000.0).round() / 10_000.0,
        lon: (lon * 10_000.0).round() / 10_000.0,
        alt,
        symbol,
        symbol_group: caps[4].to_string(),
        battery,
        weather,
    })
}

/// Parse APRS `T#` telemetry: `T#seq,v1,v2,v3,v4,v5,bits` with the MeshCom
/// channel convention v1=qfe, v2=temp, v3=hum, v4=qnh, v5=co2.
pub fn parse_aprs_telemetry(message: &str) -> Option<TelemetryReadings> {
    let caps = APRS_TELE_RE.captures(message)?;
    let co2: f64 = caps[6].parse().unwrap_or(0.0);
    Some(TelemetryReadings {
        tele_seq: caps[1].parse().ok(),
        qfe: caps[2].parse().ok(),
        temp1: caps[3].parse().ok(),
        hum: caps[4].parse().ok(),
        qnh: caps[5].parse().ok(),
        co2: if co2 > 0.0 { Some(co2 as i64) } else { None },
    })
}

/// Split a relay path (`"DO7TW-1,DB0FHR-12,DK5EN-99>"`) into the
/// originating callsign and the via chain, with the own callsign removed.
pub fn split_path(path: &str, own_callsign: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('>').trim();
    let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
    let filtered: Vec<&str> = if own_callsign.is_empty() {
        parts.clone()
    } else {
        parts
            .iter()
            .copied()
            .filter(|p| !p.eq_ignore_ascii_case(own_callsign))
            .collect()
    };
    let src = filtered
        .first()
        .or_else(|| parts.first())
        .copied()
        .unwrap_or("")
        .to_string();
    let via = if filtered.len() > 1 {
        filtered.join(",")
    } else {
        String::new()
    };
    (src, via)
}

/// A decoded BLE notification.
#[derive(Debug, Clone)]
pub enum BleDecoded {
    /// A mesh record (chat, position, ACK, telemetry, MHeard beacon)
    Mesh(MeshMessage),
    /// A register dump or config response, keyed by `TYP`
    Register(Value),
}

/// Decode one raw BLE notification payload.
///
/// `D{…}` is a JSON register dump; `@…` is a binary mesh frame. Anything
/// else is rejected.
pub fn decode_notification(raw: &[u8], own_callsign: &str) -> GatewayResult<BleDecoded> {
    if raw.starts_with(b"D{") {
        let dump = decode_json_register(raw)?;
        return dispatch_register(dump, own_callsign)
            .ok_or_else(|| GatewayError::decode("unknown register type", raw));
    }
    if raw.starts_with(b"@") {
        let frame = wire::decode(raw)?;
        let mut mesh = crate::udp::frame_to_message(frame, own_callsign)
            .ok_or_else(|| GatewayError::decode("unroutable frame", raw))?;
        mesh.src_type = "ble".to_string();
        return Ok(BleDecoded::Mesh(mesh));
    }
    Err(GatewayError::decode("unknown BLE payload format", raw))
}

/// Decode a `D{…}` JSON register dump: strip the leading `D`, trailing NULs,
/// parse the remainder.
pub fn decode_json_register(raw: &[u8]) -> GatewayResult<Value> {
    let trimmed: &[u8] = {
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        &raw[1..end]
    };
    let text = std::str::from_utf8(trimmed)
        .map_err(|e| GatewayError::decode(format!("register dump not UTF-8: {e}"), raw))?;
    serde_json::from_str(text)
        .map_err(|e| GatewayError::decode(format!("register dump not JSON: {e}"), raw))
}

/// Route a register dump: `MH` entries become MHeard position samples, the
/// known register types stay JSON events, anything else is dropped.
fn dispatch_register(dump: Value, _own_callsign: &str) -> Option<BleDecoded> {
    let typ = dump.get("TYP").and_then(Value::as_str).unwrap_or("");
    if typ == "MH" {
        return Some(BleDecoded::Mesh(mheard_to_message(&dump)));
    }
    if REGISTER_TYPES.contains(&typ) {
        return Some(BleDecoded::Register(dump));
    }
    tracing::warn!(typ, "register type not recognized, dropped");
    None
}

/// An `MH` register entry: a bare signal sample for a heard station.
fn mheard_to_message(dump: &Value) -> MeshMessage {
    let call = dump.get("CALL").and_then(Value::as_str).unwrap_or("");
    let timestamp = node_timestamp(dump).unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let mut mesh = MeshMessage::new(call, "*", "", MessageKind::Pos, "ble");
    mesh.transformer = Some("mh".to_string());
    mesh.timestamp = timestamp;
    mesh.rssi = dump
        .get("RSSI")
        .and_then(Value::as_i64)
        .map(|v| v as i32);
    mesh.snr = dump.get("SNR").and_then(Value::as_f64);
    mesh.hw_id = dump.get("HW").and_then(Value::as_u64).map(|v| v as u8);
    mesh.lora_mod = dump.get("MOD").and_then(Value::as_u64).map(|v| v as u8);
    mesh.mesh_info = dump.get("MESH").and_then(Value::as_u64).map(|v| v as u8);
    mesh
}

/// MH entries carry the node clock as `DATE` + `TIME` strings.
fn node_timestamp(dump: &Value) -> Option<i64> {
    let date = dump.get("DATE").and_then(Value::as_str)?;
    let time = dump.get("TIME").and_then(Value::as_str)?;
    let naive = chrono::NaiveDateTime::parse_from_str(
        &format!("{date} {time}"),
        "%Y-%m-%d %H:%M:%S",
    )
    .ok()?;
    Some(naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_aprs_position_with_altitude_in_metres() {
        let pos = parse_aprs_position("!4812.34N/01234.56E#/A=001526/B=085").unwrap();
        assert!((pos.lat - 48.2057).abs() < 0.001);
        assert!((pos.lon - 12.576).abs() < 0.001);
        // 1526 ft ≈ 465 m
        assert_eq!(pos.alt, Some(465));
        assert_eq!(pos.battery, Some(85));
        assert_eq!(pos.symbol, "#");
        assert_eq!(pos.symbol_group, "/");
    }

    #[test]
    fn test_should_negate_southern_and_western_coordinates() {
        let pos = parse_aprs_position("!3354.00S\\07112.00W-").unwrap();
        assert!(pos.lat < 0.0);
        assert!(pos.lon < 0.0);
        assert_eq!(pos.symbol_group, "\\");
    }

    #[test]
    fn test_should_extract_weather_fields_from_position_beacons() {
        let pos = parse_aprs_position("!4812.34N/01234.56E_/P=940.3/T=22.6/H=42.1/Q=956.9").unwrap();
        let wx = pos.weather.unwrap();
        assert_eq!(wx.qfe, Some(940.3));
        assert_eq!(wx.temp1, Some(22.6));
        assert_eq!(wx.hum, Some(42.1));
        assert_eq!(wx.qnh, Some(956.9));
    }

    #[test]
    fn test_should_reject_non_position_text() {
        assert!(parse_aprs_position("hello world").is_none());
    }

    #[test]
    fn test_should_parse_t_hash_telemetry_dropping_zero_co2() {
        let tele = parse_aprs_telemetry("T#012,940.3,22.6,42.1,956.9,0.0,00000000").unwrap();
        assert_eq!(tele.tele_seq, Some(12));
        assert_eq!(tele.qfe, Some(940.3));
        assert_eq!(tele.co2, None, "zero CO2 channel must be dropped");

        let with_co2 = parse_aprs_telemetry("T#013,940.3,22.6,42.1,956.9,450,00000000").unwrap();
        assert_eq!(with_co2.co2, Some(450));
    }

    #[test]
    fn test_should_strip_own_callsign_when_splitting_path() {
        let (src, via) = split_path("DO7TW-1,DB0FHR-12,DK5EN-99>", "DK5EN-99");
        assert_eq!(src, "DO7TW-1");
        assert_eq!(via, "DO7TW-1,DB0FHR-12");

        let (src, via) = split_path("DL8DD-7,DK5EN-99>", "DK5EN-99");
        assert_eq!(src, "DL8DD-7");
        assert_eq!(via, "");
    }

    #[test]
    fn test_should_decode_json_register_dump() {
        let raw = b"D{\"TYP\":\"I\",\"CALL\":\"DK5EN-1\",\"HW\":9}\x00\x00";
        match decode_notification(raw, "DK5EN-1").unwrap() {
            BleDecoded::Register(v) => {
                assert_eq!(v["TYP"], "I");
                assert_eq!(v["CALL"], "DK5EN-1");
            }
            other => panic!("expected register, got {other:?}"),
        }
    }

    #[test]
    fn test_should_decode_mh_entry_as_mheard_beacon() {
        let raw = br#"D{"TYP":"MH","CALL":"OE5HWN-12","DATE":"2025-06-01","TIME":"10:15:00","RSSI":-80,"SNR":6.5,"HW":9,"MOD":1}"#;
        match decode_notification(raw, "DK5EN-1").unwrap() {
            BleDecoded::Mesh(m) => {
                assert!(m.is_mheard_beacon());
                assert_eq!(m.transformer.as_deref(), Some("mh"));
                assert_eq!(m.src, "OE5HWN-12");
                assert_eq!(m.rssi, Some(-80));
                assert_eq!(m.snr, Some(6.5));
                assert_eq!(m.kind, MessageKind::Pos);
                assert!(m.msg_id.is_none());
            }
            other => panic!("expected mesh, got {other:?}"),
        }
    }

    #[test]
    fn test_should_tag_binary_notifications_as_ble_transport() {
        let frame = crate::wire::encode_text(&crate::wire::OutboundFrame {
            msg_id: 7,
            max_hop: 5,
            mesh_info: 0,
            src: "OE5HWN-12".to_string(),
            dst: "20".to_string(),
            message: "hi".to_string(),
            hw_id: 0,
            lora_mod: 0,
            fw: 0,
            time_ms: 0,
        });
        match decode_notification(&frame, "DK5EN-1").unwrap() {
            BleDecoded::Mesh(m) => {
                assert_eq!(m.src_type, "ble");
                assert_eq!(m.src, "OE5HWN-12");
            }
            other => panic!("expected mesh, got {other:?}"),
        }
    }

    #[test]
    fn test_should_reject_unknown_notification_formats() {
        assert!(decode_notification(b"garbage", "DK5EN-1").is_err());
    }
}
