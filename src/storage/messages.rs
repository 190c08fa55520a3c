//! Message write path and the message read queries.
//!
//! The write path applies, in order: the drop filters, ACK folding into
//! `send_success`, inline-ACK folding into `acked`, echo-id extraction,
//! conversation keying, the MHeard update-in-place throttle, the 20-minute
//! msg-id dedup window, and only then the insert. Side tables (signal log,
//! station positions, telemetry) are fed from the same call.

use serde_json::{json, Value};
use sqlx::Row;
use tracing::{debug, info};

use super::StorageEngine;
use crate::domain::conversation_key;
use crate::error::GatewayResult;
use crate::message::{MeshMessage, MessageKind};

/// MHeard beacons from the same callsign within this window update the
/// existing row instead of inserting a new one.
pub const MHEARD_THROTTLE_MS: i64 = 2 * 60 * 1000;
/// Duplicate msg-id rejection window.
pub const MSG_ID_DEDUP_MS: i64 = 20 * 60 * 1000;
/// Telemetry duplicate window: within it, the row with non-zero readings wins.
pub const TELEMETRY_DEDUP_MS: i64 = 60 * 1000;

/// Number of messages per conversation in the smart-initial snapshot.
pub const SMART_INITIAL_PER_CONVERSATION: i64 = 20;
/// ACK-bearing rows included in the snapshot.
pub const SMART_INITIAL_ACK_WINDOW: i64 = 200;

impl StorageEngine {
    /// Store one decoded message, feeding the side tables as applicable.
    pub async fn store_message(&self, mesh: &MeshMessage) -> GatewayResult<()> {
        if should_filter(mesh) {
            return Ok(());
        }

        let callsign = mesh.src_callsign().to_string();
        let raw_json = serde_json::to_string(mesh)?;

        if mesh.kind == MessageKind::Tele {
            return self.store_telemetry(mesh, &callsign).await;
        }

        if mesh.kind == MessageKind::Ack {
            // ACKs fold into the original row; no ack row is inserted.
            let target = mesh.ack_id.as_deref().or(mesh.msg_id.as_deref());
            if let Some(acked_id) = target {
                let updated = sqlx::query(
                    "UPDATE messages SET send_success = 1 WHERE id = \
                     (SELECT id FROM messages WHERE msg_id = ? ORDER BY timestamp DESC LIMIT 1)",
                )
                .bind(acked_id)
                .execute(self.writer())
                .await?
                .rows_affected();
                debug!(acked_id, updated, "ACK folded into send_success");
            }
            return Ok(());
        }

        // Inline `:ackNNN` confirms delivery of the message that echoed
        // with the same three-digit id.
        if let Some(ack_tail) = mesh.ack_tail() {
            let updated = sqlx::query(
                "UPDATE messages SET acked = 1 WHERE id = \
                 (SELECT id FROM messages WHERE echo_id = ? ORDER BY timestamp DESC LIMIT 1)",
            )
            .bind(ack_tail)
            .execute(self.writer())
            .await?
            .rows_affected();
            debug!(ack_tail, updated, "inline ACK folded into acked flag");
        }

        let echo_id = if mesh.kind == MessageKind::Msg {
            mesh.echo_id().map(str::to_string)
        } else {
            None
        };
        let conv_key = conversation_key(&callsign, &mesh.dst);

        if mesh.is_mheard_beacon() {
            if self.update_throttled_mheard(mesh, &callsign, &raw_json).await? {
                self.feed_side_tables(mesh, &callsign).await?;
                return Ok(());
            }
        }

        if let Some(msg_id) = &mesh.msg_id {
            if self.is_duplicate_msg_id(msg_id, mesh.timestamp).await? {
                debug!(%msg_id, "duplicate msg_id within window, dropped");
                return Ok(());
            }
        }

        sqlx::query(
            "INSERT INTO messages \
             (msg_id, src, dst, msg, type, timestamp, rssi, snr, src_type, via, \
              echo_id, conversation_key, raw_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&mesh.msg_id)
        .bind(&callsign)
        .bind(&mesh.dst)
        .bind(&mesh.msg)
        .bind(mesh.kind.as_str())
        .bind(mesh.timestamp)
        .bind(mesh.rssi)
        .bind(mesh.snr)
        .bind(&mesh.src_type)
        .bind(&mesh.via)
        .bind(&echo_id)
        .bind(&conv_key)
        .execute(self.writer())
        .await?;

        self.feed_side_tables(mesh, &callsign).await?;
        Ok(())
    }

    async fn feed_side_tables(&self, mesh: &MeshMessage, callsign: &str) -> GatewayResult<()> {
        if mesh.is_mheard_beacon() {
            if let (Some(rssi), Some(snr)) = (mesh.rssi, mesh.snr) {
                self.record_signal(callsign, mesh.timestamp, rssi, snr).await?;
            }
        }
        if mesh.kind == MessageKind::Pos {
            self.upsert_station_position(mesh, callsign).await?;
        }
        Ok(())
    }

    /// Update-in-place for MHeard beacon spam. Returns true when an
    /// existing row inside the throttle window was refreshed.
    async fn update_throttled_mheard(
        &self,
        mesh: &MeshMessage,
        callsign: &str,
        raw_json: &str,
    ) -> GatewayResult<bool> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM messages \
             WHERE src = ? AND src_type = 'ble' AND type = 'pos' AND msg_id IS NULL \
               AND timestamp > ? \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(callsign)
        .bind(mesh.timestamp - MHEARD_THROTTLE_MS)
        .fetch_optional(self.reader())
        .await?;

        let Some((id,)) = existing else {
            return Ok(false);
        };

        sqlx::query("UPDATE messages SET rssi = ?, snr = ?, timestamp = ?, raw_json = ? WHERE id = ?")
            .bind(mesh.rssi)
            .bind(mesh.snr)
            .bind(mesh.timestamp)
            .bind(raw_json)
            .bind(id)
            .execute(self.writer())
            .await?;
        Ok(true)
    }

    async fn is_duplicate_msg_id(&self, msg_id: &str, timestamp: i64) -> GatewayResult<bool> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM messages WHERE msg_id = ? AND timestamp > ? LIMIT 1",
        )
        .bind(msg_id)
        .bind(timestamp - MSG_ID_DEDUP_MS)
        .fetch_optional(self.reader())
        .await?;
        Ok(existing.is_some())
    }

    async fn store_telemetry(&self, mesh: &MeshMessage, callsign: &str) -> GatewayResult<()> {
        let Some(tele) = &mesh.telemetry else {
            return Ok(());
        };
        self.insert_telemetry(callsign, mesh.timestamp, tele).await
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Smart-initial snapshot: last N messages per conversation key, the
    /// station-positions snapshot, and the recent ACK-bearing rows, in one
    /// read pass.
    ///
    /// Partitioning by conversation key (not destination) keeps both
    /// directions of a DM in one thread.
    pub async fn smart_initial(&self) -> GatewayResult<Value> {
        let message_rows = sqlx::query(
            "SELECT raw_json FROM ( \
               SELECT raw_json, timestamp, \
                      ROW_NUMBER() OVER (PARTITION BY conversation_key ORDER BY timestamp DESC) AS rn \
               FROM messages \
               WHERE type = 'msg' AND msg NOT LIKE '%:ack%' \
             ) WHERE rn <= ? ORDER BY timestamp ASC",
        )
        .bind(SMART_INITIAL_PER_CONVERSATION)
        .fetch_all(self.reader())
        .await?;

        let messages: Vec<Value> = message_rows
            .iter()
            .filter_map(|row| serde_json::from_str(&row.get::<String, _>("raw_json")).ok())
            .collect();

        let positions = self.station_positions_snapshot().await?;

        let ack_rows = sqlx::query(
            "SELECT raw_json FROM messages \
             WHERE type = 'msg' AND (msg LIKE '%:ack%' OR acked = 1 OR send_success = 1) \
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(SMART_INITIAL_ACK_WINDOW)
        .fetch_all(self.reader())
        .await?;
        let acks: Vec<Value> = ack_rows
            .iter()
            .filter_map(|row| serde_json::from_str(&row.get::<String, _>("raw_json")).ok())
            .collect();

        info!(
            msgs = messages.len(),
            pos = positions.len(),
            acks = acks.len(),
            "smart_initial snapshot built"
        );
        Ok(json!({
            "messages": messages,
            "positions": positions,
            "acks": acks,
        }))
    }

    /// Message count per conversation key, ACK rows excluded.
    pub async fn summary(&self) -> GatewayResult<Value> {
        let rows: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT conversation_key, COUNT(*) FROM messages \
             WHERE type = 'msg' AND msg NOT LIKE '%:ack%' \
             GROUP BY conversation_key",
        )
        .fetch_all(self.reader())
        .await?;

        let mut summary = serde_json::Map::new();
        for (key, count) in rows {
            if let Some(key) = key {
                summary.insert(key, json!(count));
            }
        }
        Ok(Value::Object(summary))
    }

    /// Cursor-paginated history for one conversation.
    ///
    /// For direct messages the caller supplies its own callsign via `src`
    /// and the page is keyed on the symmetric conversation key; groups are
    /// keyed on `dst` directly.
    pub async fn messages_page(
        &self,
        dst: &str,
        src: Option<&str>,
        before: Option<i64>,
        limit: i64,
    ) -> GatewayResult<(Vec<Value>, bool)> {
        let limit = limit.clamp(1, 100);
        let before = before.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let key = if crate::domain::is_group(dst) || dst == "*" {
            dst.to_string()
        } else {
            conversation_key(src.unwrap_or(""), dst)
        };

        let rows = if dst == "*" {
            sqlx::query(
                "SELECT raw_json FROM messages \
                 WHERE type = 'msg' AND msg NOT LIKE '%:ack%' AND timestamp < ? \
                 ORDER BY timestamp DESC LIMIT ?",
            )
            .bind(before)
            .bind(limit + 1)
            .fetch_all(self.reader())
            .await?
        } else {
            sqlx::query(
                "SELECT raw_json FROM messages \
                 WHERE type = 'msg' AND msg NOT LIKE '%:ack%' \
                   AND conversation_key = ? AND timestamp < ? \
                 ORDER BY timestamp DESC LIMIT ?",
            )
            .bind(&key)
            .bind(before)
            .bind(limit + 1)
            .fetch_all(self.reader())
            .await?
        };

        let has_more = rows.len() as i64 > limit;
        let mut messages: Vec<Value> = rows
            .iter()
            .take(limit as usize)
            .filter_map(|row| serde_json::from_str(&row.get::<String, _>("raw_json")).ok())
            .collect();
        messages.reverse();
        Ok((messages, has_more))
    }

    /// Message/position counts and active stations for `!stats`.
    pub async fn stats(&self, hours: i64) -> GatewayResult<(i64, i64, i64)> {
        let cutoff = chrono::Utc::now().timestamp_millis() - hours * 3_600_000;
        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT \
               COALESCE(SUM(CASE WHEN type = 'msg' THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN type = 'pos' THEN 1 ELSE 0 END), 0), \
               COUNT(DISTINCT CASE WHEN type = 'msg' THEN src END) \
             FROM messages WHERE timestamp >= ?",
        )
        .bind(cutoff)
        .fetch_one(self.reader())
        .await?;
        Ok(row)
    }

    /// Per-callsign activity rows for `!search`.
    pub async fn search_activity(
        &self,
        days: i64,
    ) -> GatewayResult<Vec<(String, String, String, i64)>> {
        let cutoff = chrono::Utc::now().timestamp_millis() - days * 86_400_000;
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT src, dst, type, timestamp FROM messages \
             WHERE timestamp >= ? AND type IN ('msg', 'pos') \
             ORDER BY timestamp DESC",
        )
        .bind(cutoff)
        .fetch_all(self.reader())
        .await?;
        Ok(rows)
    }

    /// Recently heard stations for `!mheard`: per-callsign counts and last
    /// timestamps over the recent window.
    pub async fn mheard_stations(
        &self,
    ) -> GatewayResult<Vec<(String, i64, i64, i64, i64)>> {
        let rows: Vec<(String, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT src, \
                    COALESCE(SUM(CASE WHEN type = 'msg' THEN 1 ELSE 0 END), 0) AS msg_count, \
                    COALESCE(MAX(CASE WHEN type = 'msg' THEN timestamp END), 0) AS last_msg, \
                    COALESCE(SUM(CASE WHEN type = 'pos' THEN 1 ELSE 0 END), 0) AS pos_count, \
                    COALESCE(MAX(CASE WHEN type = 'pos' THEN timestamp END), 0) AS last_pos \
             FROM (SELECT src, type, timestamp FROM messages \
                   WHERE type IN ('msg', 'pos') AND src != '' \
                   ORDER BY timestamp DESC LIMIT 4000) \
             GROUP BY src",
        )
        .fetch_all(self.reader())
        .await?;
        Ok(rows)
    }
}

/// Drop filters applied before anything touches the tables.
fn should_filter(mesh: &MeshMessage) -> bool {
    mesh.msg.starts_with("{CET}")
        || mesh.src_type == "BLE"
        || mesh.src_type == "TEST"
        || mesh.transformer.as_deref() == Some("generic_ble")
        || mesh.src == "response"
        || mesh.msg == "-- invalid character --"
        || mesh.msg.contains("No core dump")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_engine;

    fn mesh(src: &str, dst: &str, msg: &str) -> MeshMessage {
        MeshMessage::new(src, dst, msg, MessageKind::Msg, "lora")
    }

    async fn count(engine: &StorageEngine) -> i64 {
        engine.message_count().await.unwrap()
    }

    #[tokio::test]
    async fn test_should_reject_duplicate_msg_ids_within_window() {
        let (engine, _dir) = temp_engine().await;
        let mut m = mesh("OE5HWN-12", "20", "hello");
        m.msg_id = Some("0000002A".into());

        engine.store_message(&m).await.unwrap();
        engine.store_message(&m).await.unwrap();
        assert_eq!(count(&engine).await, 1);

        // Outside the window the same id inserts again.
        let mut later = m.clone();
        later.timestamp += MSG_ID_DEDUP_MS + 1000;
        engine.store_message(&later).await.unwrap();
        assert_eq!(count(&engine).await, 2);
    }

    #[tokio::test]
    async fn test_should_update_mheard_beacon_in_place_within_throttle() {
        let (engine, _dir) = temp_engine().await;
        let t0 = chrono::Utc::now().timestamp_millis();

        let mut first = MeshMessage::new("X-1", "*", "", MessageKind::Pos, "ble");
        first.timestamp = t0;
        first.rssi = Some(-80);
        first.snr = Some(5.0);
        engine.store_message(&first).await.unwrap();

        let mut second = first.clone();
        second.timestamp = t0 + 60_000;
        second.rssi = Some(-75);
        engine.store_message(&second).await.unwrap();

        assert_eq!(count(&engine).await, 1, "second beacon updates in place");
        let (rssi,): (i64,) = sqlx::query_as("SELECT rssi FROM messages WHERE src = 'X-1'")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(rssi, -75, "latest rssi wins");

        // Both samples reach the signal log.
        let (log_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_log")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(log_count, 2);
    }

    #[tokio::test]
    async fn test_should_insert_new_row_after_throttle_window() {
        let (engine, _dir) = temp_engine().await;
        let t0 = chrono::Utc::now().timestamp_millis();

        let mut first = MeshMessage::new("X-1", "*", "", MessageKind::Pos, "ble");
        first.timestamp = t0;
        first.rssi = Some(-80);
        first.snr = Some(5.0);
        engine.store_message(&first).await.unwrap();

        let mut later = first.clone();
        later.timestamp = t0 + MHEARD_THROTTLE_MS + 1000;
        engine.store_message(&later).await.unwrap();

        assert_eq!(count(&engine).await, 2);
    }

    #[tokio::test]
    async fn test_should_fold_ack_frames_into_send_success() {
        let (engine, _dir) = temp_engine().await;
        let mut m = mesh("DK5EN-1", "OE5HWN-12", "are you there?");
        m.msg_id = Some("00000101".into());
        engine.store_message(&m).await.unwrap();

        let mut ack = MeshMessage::new("", "", "", MessageKind::Ack, "lora");
        ack.msg_id = Some("00000FFF".into());
        ack.ack_id = Some("00000101".into());
        engine.store_message(&ack).await.unwrap();

        assert_eq!(count(&engine).await, 1, "no ack row inserted");
        let (flag,): (i64,) =
            sqlx::query_as("SELECT send_success FROM messages WHERE msg_id = '00000101'")
                .fetch_one(engine.reader())
                .await
                .unwrap();
        assert_eq!(flag, 1);
    }

    #[tokio::test]
    async fn test_should_fold_inline_ack_by_echo_id() {
        let (engine, _dir) = temp_engine().await;
        let mut sent = mesh("DK5EN-1", "OE5HWN-12", "ping please{829");
        sent.msg_id = Some("00000201".into());
        engine.store_message(&sent).await.unwrap();

        let mut reply = mesh("OE5HWN-12", "DK5EN-1", "got it :ack829");
        reply.msg_id = Some("00000202".into());
        engine.store_message(&reply).await.unwrap();

        let (acked,): (i64,) =
            sqlx::query_as("SELECT acked FROM messages WHERE echo_id = '829'")
                .fetch_one(engine.reader())
                .await
                .unwrap();
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn test_should_apply_drop_filters() {
        let (engine, _dir) = temp_engine().await;
        engine.store_message(&mesh("X-1", "20", "{CET}12:00")).await.unwrap();
        engine.store_message(&mesh("response", "20", "hi")).await.unwrap();
        engine
            .store_message(&mesh("X-1", "20", "-- invalid character --"))
            .await
            .unwrap();
        let mut ble = mesh("X-1", "20", "config");
        ble.src_type = "BLE".into();
        engine.store_message(&ble).await.unwrap();
        let mut register = mesh("X-1", "20", "register dump");
        register.transformer = Some("generic_ble".into());
        engine.store_message(&register).await.unwrap();

        assert_eq!(count(&engine).await, 0);
    }

    #[tokio::test]
    async fn test_should_key_dm_pages_on_symmetric_conversation() {
        let (engine, _dir) = temp_engine().await;
        let mut a = mesh("DK5EN-1", "OE5HWN-12", "hello there");
        a.msg_id = Some("00000301".into());
        let mut b = mesh("OE5HWN-12", "DK5EN-1", "hello back");
        b.msg_id = Some("00000302".into());
        b.timestamp = a.timestamp + 1000;
        engine.store_message(&a).await.unwrap();
        engine.store_message(&b).await.unwrap();

        // Page queried from either side returns both directions.
        let (page, has_more) = engine
            .messages_page("OE5HWN-12", Some("DK5EN-1"), None, 20)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(!has_more);

        let (page_b, _) = engine
            .messages_page("DK5EN-1", Some("OE5HWN-12"), None, 20)
            .await
            .unwrap();
        assert_eq!(page_b.len(), 2);
    }

    #[tokio::test]
    async fn test_should_report_has_more_when_page_overflows() {
        let (engine, _dir) = temp_engine().await;
        let t0 = chrono::Utc::now().timestamp_millis();
        for i in 0..5 {
            let mut m = mesh("OE5HWN-12", "20", &format!("msg {i}"));
            m.msg_id = Some(format!("{:08X}", 0x400 + i));
            m.timestamp = t0 + i;
            engine.store_message(&m).await.unwrap();
        }

        let (page, has_more) = engine.messages_page("20", None, None, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(has_more);
    }

    #[tokio::test]
    async fn test_should_preserve_timestamp_order_within_conversation() {
        let (engine, _dir) = temp_engine().await;
        let t0 = chrono::Utc::now().timestamp_millis();
        for i in 0..10 {
            let mut m = mesh("OE5HWN-12", "20", &format!("msg {i}"));
            m.msg_id = Some(format!("{:08X}", 0x500 + i));
            m.timestamp = t0 + i * 100;
            engine.store_message(&m).await.unwrap();
        }

        let (page, _) = engine.messages_page("20", None, None, 20).await.unwrap();
        let times: Vec<i64> = page.iter().map(|v| v["timestamp"].as_i64().unwrap()).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted, "read-back order is non-decreasing");
    }

    #[tokio::test]
    async fn test_should_limit_smart_initial_per_conversation() {
        let (engine, _dir) = temp_engine().await;
        let t0 = chrono::Utc::now().timestamp_millis();
        for i in 0..30 {
            let mut m = mesh("OE5HWN-12", "20", &format!("msg {i}"));
            m.msg_id = Some(format!("{:08X}", 0x600 + i));
            m.timestamp = t0 + i;
            engine.store_message(&m).await.unwrap();
        }

        let snapshot = engine.smart_initial().await.unwrap();
        let messages = snapshot["messages"].as_array().unwrap();
        assert_eq!(
            messages.len() as i64,
            SMART_INITIAL_PER_CONVERSATION,
            "one conversation contributes at most N rows"
        );
    }

    #[tokio::test]
    async fn test_should_count_summary_per_conversation_key() {
        let (engine, _dir) = temp_engine().await;
        let mut a = mesh("DK5EN-1", "OE5HWN-12", "one way");
        a.msg_id = Some("00000701".into());
        let mut b = mesh("OE5HWN-12", "DK5EN-1", "other way");
        b.msg_id = Some("00000702".into());
        let mut g = mesh("DK5EN-1", "20", "group");
        g.msg_id = Some("00000703".into());
        engine.store_message(&a).await.unwrap();
        engine.store_message(&b).await.unwrap();
        engine.store_message(&g).await.unwrap();

        let summary = engine.summary().await.unwrap();
        assert_eq!(summary["DK5EN<>OE5HWN"], 2);
        assert_eq!(summary["20"], 1);
    }
}
