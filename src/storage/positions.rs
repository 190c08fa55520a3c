//! Station position upserts and the positions snapshot.
//!
//! One row per callsign. Upsert policy: newer beacons overwrite location
//! fields, non-empty firmware/symbol values never give way to empty ones,
//! the shortest observed relay path wins ties, and last-seen is monotonic
//! non-decreasing.

use serde_json::{json, Value};
use sqlx::Row;
use tracing::debug;

use super::StorageEngine;
use crate::error::GatewayResult;
use crate::message::{MeshMessage, TelemetryReadings};

impl StorageEngine {
    /// Upsert one position beacon or MHeard report.
    pub async fn upsert_station_position(
        &self,
        mesh: &MeshMessage,
        callsign: &str,
    ) -> GatewayResult<()> {
        if callsign.is_empty() {
            return Ok(());
        }

        let pos = mesh.position.as_ref();
        let has_coords = pos.is_some_and(|p| {
            p.lat.unwrap_or(0.0) != 0.0 && p.lon.unwrap_or(0.0) != 0.0
        });
        let has_signal = mesh.rssi.is_some() || mesh.snr.is_some();
        if !has_coords && !has_signal {
            return Ok(());
        }

        let existing = sqlx::query(
            "SELECT shortest_path, observed_paths, last_seen FROM station_positions WHERE callsign = ?",
        )
        .bind(callsign)
        .fetch_optional(self.reader())
        .await?;

        let incoming_path = mesh.via.clone().unwrap_or_default();
        let (shortest_path, observed_paths, last_seen_floor) = match &existing {
            Some(row) => {
                let current: Option<String> = row.get("shortest_path");
                let observed: String = row.get("observed_paths");
                let last_seen: i64 = row.get("last_seen");

                let mut paths: Vec<String> =
                    serde_json::from_str(&observed).unwrap_or_default();
                if !incoming_path.is_empty() && !paths.contains(&incoming_path) {
                    paths.push(incoming_path.clone());
                }

                // Shortest path wins; a direct reception (empty path) beats
                // any relay chain.
                let shortest = match current {
                    Some(cur) if path_len(&cur) <= path_len(&incoming_path) => cur,
                    _ => incoming_path.clone(),
                };
                (shortest, paths, last_seen)
            }
            None => {
                let paths = if incoming_path.is_empty() {
                    Vec::new()
                } else {
                    vec![incoming_path.clone()]
                };
                (incoming_path.clone(), paths, 0)
            }
        };

        let last_seen = mesh.timestamp.max(last_seen_floor);
        let observed_json = serde_json::to_string(&observed_paths)?;

        // COALESCE keeps previous non-null values where the beacon omits a
        // field; NULLIF('') keeps empty strings from clobbering real data.
        sqlx::query(
            "INSERT INTO station_positions \
             (callsign, lat, lon, alt, aprs_symbol, aprs_symbol_group, battery, \
              hw_id, firmware, shortest_path, observed_paths, rssi, snr, \
              position_timestamp, signal_timestamp, last_seen) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(callsign) DO UPDATE SET \
               lat = COALESCE(excluded.lat, lat), \
               lon = COALESCE(excluded.lon, lon), \
               alt = COALESCE(excluded.alt, alt), \
               aprs_symbol = COALESCE(NULLIF(excluded.aprs_symbol, ''), aprs_symbol), \
               aprs_symbol_group = COALESCE(NULLIF(excluded.aprs_symbol_group, ''), aprs_symbol_group), \
               battery = COALESCE(excluded.battery, battery), \
               hw_id = COALESCE(excluded.hw_id, hw_id), \
               firmware = COALESCE(NULLIF(excluded.firmware, ''), firmware), \
               shortest_path = excluded.shortest_path, \
               observed_paths = excluded.observed_paths, \
               rssi = COALESCE(excluded.rssi, rssi), \
               snr = COALESCE(excluded.snr, snr), \
               position_timestamp = COALESCE(excluded.position_timestamp, position_timestamp), \
               signal_timestamp = COALESCE(excluded.signal_timestamp, signal_timestamp), \
               last_seen = MAX(last_seen, excluded.last_seen)",
        )
        .bind(callsign)
        .bind(pos.and_then(|p| p.lat).filter(|&v| v != 0.0))
        .bind(pos.and_then(|p| p.lon).filter(|&v| v != 0.0))
        .bind(pos.and_then(|p| p.alt))
        .bind(pos.and_then(|p| p.aprs_symbol.clone()).unwrap_or_default())
        .bind(pos.and_then(|p| p.aprs_symbol_group.clone()).unwrap_or_default())
        .bind(pos.and_then(|p| p.batt))
        .bind(mesh.hw_id)
        .bind(mesh.firmware.clone().unwrap_or_default())
        .bind(&shortest_path)
        .bind(&observed_json)
        .bind(mesh.rssi)
        .bind(mesh.snr)
        .bind(if has_coords { Some(mesh.timestamp) } else { None })
        .bind(if has_signal { Some(mesh.timestamp) } else { None })
        .bind(last_seen)
        .execute(self.writer())
        .await?;

        debug!(callsign, "station position upserted");
        Ok(())
    }

    /// Update the latest telemetry mirror on the station row.
    pub async fn update_station_telemetry(
        &self,
        callsign: &str,
        timestamp: i64,
    ) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE station_positions SET last_seen = MAX(last_seen, ?) WHERE callsign = ?",
        )
        .bind(timestamp)
        .bind(callsign)
        .execute(self.writer())
        .await?;
        Ok(())
    }

    /// Full station snapshot for the initial client payload, with the
    /// latest telemetry readings merged in.
    pub async fn station_positions_snapshot(&self) -> GatewayResult<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT p.callsign, p.lat, p.lon, p.alt, p.aprs_symbol, p.aprs_symbol_group, \
                    p.battery, p.hw_id, p.firmware, p.shortest_path, p.rssi, p.snr, \
                    p.position_timestamp, p.last_seen, \
                    t.temp1, t.hum, t.qfe, t.qnh, t.co2 \
             FROM station_positions p \
             LEFT JOIN (SELECT callsign, temp1, hum, qfe, qnh, co2, \
                               MAX(timestamp) AS ts FROM telemetry GROUP BY callsign) t \
               ON t.callsign = p.callsign \
             ORDER BY p.last_seen DESC",
        )
        .fetch_all(self.reader())
        .await?;

        let snapshot = rows
            .iter()
            .map(|row| {
                let mut v = json!({
                    "src": row.get::<String, _>("callsign"),
                    "type": "pos",
                    "src_type": "node",
                    "lat": row.get::<Option<f64>, _>("lat"),
                    "lon": row.get::<Option<f64>, _>("lon"),
                    "alt": row.get::<Option<i64>, _>("alt"),
                    "aprs_symbol": row.get::<Option<String>, _>("aprs_symbol"),
                    "aprs_symbol_group": row.get::<Option<String>, _>("aprs_symbol_group"),
                    "batt": row.get::<Option<i64>, _>("battery"),
                    "hw_id": row.get::<Option<i64>, _>("hw_id"),
                    "firmware": row.get::<Option<String>, _>("firmware"),
                    "via": row.get::<Option<String>, _>("shortest_path"),
                    "rssi": row.get::<Option<i64>, _>("rssi"),
                    "snr": row.get::<Option<f64>, _>("snr"),
                    "timestamp": row.get::<Option<i64>, _>("position_timestamp"),
                    "last_seen": row.get::<i64, _>("last_seen"),
                });
                let tele = TelemetryReadings {
                    tele_seq: None,
                    temp1: row.get::<Option<f64>, _>("temp1"),
                    hum: row.get::<Option<f64>, _>("hum"),
                    qfe: row.get::<Option<f64>, _>("qfe"),
                    qnh: row.get::<Option<f64>, _>("qnh"),
                    co2: row.get::<Option<i64>, _>("co2"),
                };
                if !tele.is_all_zero() {
                    if let (Value::Object(map), Ok(Value::Object(tmap))) =
                        (&mut v, serde_json::to_value(&tele))
                    {
                        for (k, val) in tmap {
                            map.insert(k, val);
                        }
                    }
                }
                v
            })
            .collect();
        Ok(snapshot)
    }

    /// Latest stored position for one callsign (base-callsign match).
    pub async fn latest_position(
        &self,
        callsign: &str,
    ) -> GatewayResult<Option<(f64, f64, i64)>> {
        let row: Option<(Option<f64>, Option<f64>, Option<i64>)> = sqlx::query_as(
            "SELECT lat, lon, position_timestamp FROM station_positions \
             WHERE callsign = ? OR callsign LIKE ? ORDER BY last_seen DESC LIMIT 1",
        )
        .bind(callsign)
        .bind(format!("{callsign}-%"))
        .fetch_optional(self.reader())
        .await?;
        Ok(row.and_then(|(lat, lon, ts)| match (lat, lon) {
            (Some(lat), Some(lon)) => Some((lat, lon, ts.unwrap_or(0))),
            _ => None,
        }))
    }
}

/// Relay chain length; the empty path (direct reception) is shortest.
fn path_len(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split(',').count()
    }
}
