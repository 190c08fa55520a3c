//! Retention: nightly pruning, hourly rollups and the size-triggered
//! pruner.
//!
//! Retention windows per table: `msg` rows 30 days, `pos` and ACK-like rows
//! 8 days, signal_log 8 days, hourly buckets and telemetry 365 days,
//! station rows 30 days of inactivity. The size pruner kicks in at 1 GB and
//! deletes oldest rows from signal_log, signal_buckets and messages, in
//! that order, until the file drops to 90% of the cap, then compacts.

use tracing::{info, warn};

use super::{StorageEngine, MAX_DB_SIZE_BYTES};
use crate::config::RetentionConfig;
use crate::error::GatewayResult;

/// Conservative row-size estimate used to turn a byte target into a DELETE
/// batch size.
const EST_ROW_BYTES: u64 = 200;

impl StorageEngine {
    /// Nightly prune pass. Returns the message count after pruning.
    pub async fn prune(
        &self,
        retention: &RetentionConfig,
        block_list: &[String],
    ) -> GatewayResult<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let cutoff_msg = now - i64::from(retention.prune_hours_msg) * 3_600_000;
        let cutoff_pos = now - i64::from(retention.prune_hours_pos) * 3_600_000;
        let cutoff_ack = now - i64::from(retention.prune_hours_ack) * 3_600_000;

        sqlx::query("DELETE FROM messages WHERE type = 'msg' AND timestamp < ?")
            .bind(cutoff_msg)
            .execute(self.writer())
            .await?;
        sqlx::query("DELETE FROM messages WHERE type = 'pos' AND timestamp < ?")
            .bind(cutoff_pos)
            .execute(self.writer())
            .await?;
        sqlx::query("DELETE FROM messages WHERE type = 'ack' AND timestamp < ?")
            .bind(cutoff_ack)
            .execute(self.writer())
            .await?;
        // Catch-all for anything else: shortest retention wins.
        sqlx::query("DELETE FROM messages WHERE type NOT IN ('msg', 'pos', 'ack') AND timestamp < ?")
            .bind(cutoff_pos.max(cutoff_ack))
            .execute(self.writer())
            .await?;

        for blocked in block_list {
            sqlx::query("DELETE FROM messages WHERE src = ?")
                .bind(blocked)
                .execute(self.writer())
                .await?;
        }

        sqlx::query(
            "DELETE FROM messages WHERE msg = '-- invalid character --' OR msg LIKE '%No core dump%'",
        )
        .execute(self.writer())
        .await?;

        // Side tables.
        let cutoff_signal = now - 8 * 24 * 3_600_000i64;
        sqlx::query("DELETE FROM signal_log WHERE timestamp < ?")
            .bind(cutoff_signal)
            .execute(self.writer())
            .await?;

        let cutoff_year_s = chrono::Utc::now().timestamp() - 365 * 24 * 3600;
        sqlx::query("DELETE FROM signal_buckets_hourly WHERE bucket_start < ?")
            .bind(cutoff_year_s)
            .execute(self.writer())
            .await?;

        let cutoff_tele = now - 365 * 24 * 3_600_000i64;
        sqlx::query("DELETE FROM telemetry WHERE timestamp < ?")
            .bind(cutoff_tele)
            .execute(self.writer())
            .await?;

        let cutoff_station = now - 30 * 24 * 3_600_000i64;
        sqlx::query("DELETE FROM station_positions WHERE last_seen < ?")
            .bind(cutoff_station)
            .execute(self.writer())
            .await?;

        // Query planner statistics after bulk deletes.
        sqlx::query("ANALYZE").execute(self.writer()).await?;

        let remaining = self.message_count().await?;
        info!(remaining, "prune complete");
        Ok(remaining)
    }

    /// Size-triggered pruner. No-op below the cap. Above it, deletes oldest
    /// rows table by table until the estimated size reaches 90% of the cap,
    /// then VACUUMs to reclaim the file space.
    pub async fn enforce_size_cap(&self) -> GatewayResult<bool> {
        let size = self.db_size_bytes().await;
        if size <= MAX_DB_SIZE_BYTES {
            return Ok(false);
        }
        warn!(
            size_mb = size / 1024 / 1024,
            cap_mb = MAX_DB_SIZE_BYTES / 1024 / 1024,
            "database over size cap, pruning oldest rows"
        );

        let target = MAX_DB_SIZE_BYTES / 10 * 9;
        let mut to_free = size - target;

        for table in ["signal_log", "signal_buckets", "messages"] {
            if to_free == 0 {
                break;
            }
            let rows = (to_free / EST_ROW_BYTES).max(1);
            let order_col = if table == "signal_buckets" {
                "bucket_start"
            } else {
                "timestamp"
            };
            let deleted = sqlx::query(&format!(
                "DELETE FROM {table} WHERE id IN \
                 (SELECT id FROM {table} ORDER BY {order_col} ASC LIMIT ?)"
            ))
            .bind(rows as i64)
            .execute(self.writer())
            .await?
            .rows_affected();

            info!(table, deleted, "size pruner removed oldest rows");
            to_free = to_free.saturating_sub(deleted * EST_ROW_BYTES);
        }

        sqlx::query("VACUUM").execute(self.writer()).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MeshMessage, MessageKind};
    use crate::storage::test_util::temp_engine;

    #[tokio::test]
    async fn test_should_prune_by_type_specific_retention() {
        let (engine, _dir) = temp_engine().await;
        let now = chrono::Utc::now().timestamp_millis();
        let retention = RetentionConfig::default();

        // Fresh msg survives; 40-day-old msg goes; 10-day-old pos goes
        // (8-day window) while a 10-day-old msg survives (30-day window).
        let rows = [
            ("A-1", MessageKind::Msg, now, "fresh"),
            ("B-1", MessageKind::Msg, now - 40 * 86_400_000, "stale msg"),
            ("C-1", MessageKind::Msg, now - 10 * 86_400_000, "oldish msg"),
            ("D-1", MessageKind::Pos, now - 10 * 86_400_000, "stale pos"),
        ];
        for (i, (src, kind, ts, text)) in rows.iter().enumerate() {
            let mut m = MeshMessage::new(src, "20", text, *kind, "lora");
            m.msg_id = Some(format!("{:08X}", 0x900 + i));
            m.timestamp = *ts;
            engine.store_message(&m).await.unwrap();
        }

        let remaining = engine.prune(&retention, &[]).await.unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn test_should_remove_blocked_sources_when_pruning() {
        let (engine, _dir) = temp_engine().await;
        let mut m = MeshMessage::new("OE0XXX-99", "20", "spam", MessageKind::Msg, "lora");
        m.msg_id = Some("00000A01".into());
        engine.store_message(&m).await.unwrap();

        let remaining = engine
            .prune(&RetentionConfig::default(), &["OE0XXX-99".to_string()])
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_should_prune_inactive_station_rows() {
        let (engine, _dir) = temp_engine().await;
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO station_positions (callsign, last_seen) VALUES ('OLD-1', ?), ('NEW-1', ?)",
        )
        .bind(now - 40 * 86_400_000i64)
        .bind(now)
        .execute(engine.writer())
        .await
        .unwrap();

        engine.prune(&RetentionConfig::default(), &[]).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM station_positions")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_should_skip_size_pruner_below_cap() {
        let (engine, _dir) = temp_engine().await;
        assert!(!engine.enforce_size_cap().await.unwrap());
    }
}
