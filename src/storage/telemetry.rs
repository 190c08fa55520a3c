//! Telemetry table and chart read paths.
//!
//! Append-only, with a 60-second duplicate window where the row with
//! non-zero sensor values wins. All-zero readings never reach the table.

use serde_json::{json, Value};
use tracing::debug;

use super::StorageEngine;
use crate::error::GatewayResult;
use crate::message::TelemetryReadings;
use crate::storage::messages::TELEMETRY_DEDUP_MS;

impl StorageEngine {
    /// Insert one telemetry reading, applying the duplicate policy.
    pub async fn insert_telemetry(
        &self,
        callsign: &str,
        timestamp: i64,
        tele: &TelemetryReadings,
    ) -> GatewayResult<()> {
        if tele.is_all_zero() {
            debug!(callsign, "all-zero telemetry dropped");
            return Ok(());
        }

        let recent: Option<(i64, f64)> = sqlx::query_as(
            "SELECT id, COALESCE(ABS(temp1), 0) + COALESCE(ABS(hum), 0) + \
                    COALESCE(ABS(qfe), 0) + COALESCE(ABS(qnh), 0) + COALESCE(ABS(co2), 0) \
             FROM telemetry WHERE callsign = ? AND timestamp > ? \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(callsign)
        .bind(timestamp - TELEMETRY_DEDUP_MS)
        .fetch_optional(self.reader())
        .await?;

        if let Some((existing_id, existing_magnitude)) = recent {
            if existing_magnitude > 0.0 {
                debug!(callsign, "telemetry duplicate within window, existing non-zero row wins");
                return Ok(());
            }
            // Existing row is all-zero; the non-zero newcomer replaces it.
            sqlx::query("DELETE FROM telemetry WHERE id = ?")
                .bind(existing_id)
                .execute(self.writer())
                .await?;
        }

        sqlx::query(
            "INSERT INTO telemetry (callsign, timestamp, tele_seq, temp1, hum, qfe, qnh, co2) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(callsign)
        .bind(timestamp)
        .bind(tele.tele_seq)
        .bind(tele.temp1)
        .bind(tele.hum)
        .bind(tele.qfe)
        .bind(tele.qnh)
        .bind(tele.co2)
        .execute(self.writer())
        .await?;

        self.update_station_telemetry(callsign, timestamp).await?;
        Ok(())
    }

    /// Raw telemetry series for the WX charts.
    pub async fn telemetry_chart_data(&self, hours: i64) -> GatewayResult<Vec<Value>> {
        let cutoff = chrono::Utc::now().timestamp_millis() - hours * 3_600_000;
        let rows: Vec<(String, i64, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<i64>)> =
            sqlx::query_as(
                "SELECT callsign, timestamp, temp1, hum, qfe, qnh, co2 \
                 FROM telemetry WHERE timestamp >= ? ORDER BY timestamp",
            )
            .bind(cutoff)
            .fetch_all(self.reader())
            .await?;

        Ok(rows
            .into_iter()
            .map(|(callsign, timestamp, temp1, hum, qfe, qnh, co2)| {
                json!({
                    "callsign": callsign,
                    "timestamp": timestamp,
                    "temp1": temp1,
                    "hum": hum,
                    "qfe": qfe,
                    "qnh": qnh,
                    "co2": co2,
                })
            })
            .collect())
    }

    /// Yearly chart series: 4-hour averages to keep the payload bounded.
    pub async fn telemetry_chart_data_bucketed(&self) -> GatewayResult<Vec<Value>> {
        let cutoff = chrono::Utc::now().timestamp_millis() - 365 * 24 * 3_600_000i64;
        let rows: Vec<(String, i64, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>)> =
            sqlx::query_as(
                "SELECT callsign, \
                        timestamp / 14400000 * 14400000 AS bucket, \
                        AVG(temp1), AVG(hum), AVG(qfe), AVG(qnh), AVG(co2) \
                 FROM telemetry WHERE timestamp >= ? \
                 GROUP BY callsign, bucket ORDER BY bucket",
            )
            .bind(cutoff)
            .fetch_all(self.reader())
            .await?;

        Ok(rows
            .into_iter()
            .map(|(callsign, bucket, temp1, hum, qfe, qnh, co2)| {
                json!({
                    "callsign": callsign,
                    "timestamp": bucket,
                    "temp1": temp1,
                    "hum": hum,
                    "qfe": qfe,
                    "qnh": qnh,
                    "co2": co2.map(|v| v.round() as i64),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_engine;

    fn readings(temp: f64) -> TelemetryReadings {
        TelemetryReadings {
            tele_seq: Some(1),
            temp1: Some(temp),
            hum: Some(45.0),
            qfe: Some(940.0),
            qnh: Some(957.0),
            co2: None,
        }
    }

    async fn count(engine: &StorageEngine) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM telemetry")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_should_drop_all_zero_readings() {
        let (engine, _dir) = temp_engine().await;
        let zero = TelemetryReadings::default();
        engine
            .insert_telemetry("DK5EN-12", 1_700_000_000_000, &zero)
            .await
            .unwrap();
        assert_eq!(count(&engine).await, 0);
    }

    #[tokio::test]
    async fn test_should_keep_non_zero_row_when_duplicate_arrives() {
        let (engine, _dir) = temp_engine().await;
        let t0 = 1_700_000_000_000i64;
        engine.insert_telemetry("DK5EN-12", t0, &readings(22.6)).await.unwrap();
        engine
            .insert_telemetry("DK5EN-12", t0 + 30_000, &readings(99.0))
            .await
            .unwrap();

        assert_eq!(count(&engine).await, 1, "duplicate within 60s is dropped");
        let (temp,): (f64,) = sqlx::query_as("SELECT temp1 FROM telemetry")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(temp, 22.6, "first non-zero row wins");
    }

    #[tokio::test]
    async fn test_should_insert_again_outside_duplicate_window() {
        let (engine, _dir) = temp_engine().await;
        let t0 = 1_700_000_000_000i64;
        engine.insert_telemetry("DK5EN-12", t0, &readings(22.6)).await.unwrap();
        engine
            .insert_telemetry("DK5EN-12", t0 + TELEMETRY_DEDUP_MS + 1, &readings(23.0))
            .await
            .unwrap();
        assert_eq!(count(&engine).await, 2);
    }
}
