//! Persistent UI state: read counts, hidden destinations, blocked texts
//! and the two sidebar ordering records.
//!
//! Key-value style tables with single-row upsert and bulk-replace
//! operations; bulk replace runs in one transaction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::StorageEngine;
use crate::error::GatewayResult;

/// A sidebar ordering record: ordered station list plus hidden list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidebarState {
    pub order: Vec<String>,
    pub hidden: Vec<String>,
}

impl StorageEngine {
    // ── Read counts ─────────────────────────────────────────────

    pub async fn read_counts(&self) -> GatewayResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT dst, count FROM read_counts")
            .fetch_all(self.reader())
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn set_read_count(&self, dst: &str, count: i64) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO read_counts (dst, count, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(dst) DO UPDATE SET count = excluded.count, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(dst)
        .bind(count)
        .execute(self.writer())
        .await?;
        Ok(())
    }

    // ── Hidden destinations ─────────────────────────────────────

    pub async fn hidden_destinations(&self) -> GatewayResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT dst FROM hidden_destinations ORDER BY dst")
            .fetch_all(self.reader())
            .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    /// Show or hide a single destination.
    pub async fn update_hidden_destination(&self, dst: &str, hidden: bool) -> GatewayResult<()> {
        if hidden {
            sqlx::query("INSERT OR IGNORE INTO hidden_destinations (dst) VALUES (?)")
                .bind(dst)
                .execute(self.writer())
                .await?;
        } else {
            sqlx::query("DELETE FROM hidden_destinations WHERE dst = ?")
                .bind(dst)
                .execute(self.writer())
                .await?;
        }
        Ok(())
    }

    /// Replace the whole hidden set.
    pub async fn set_hidden_destinations(&self, dsts: &[String]) -> GatewayResult<()> {
        let mut tx = self.writer().begin().await?;
        sqlx::query("DELETE FROM hidden_destinations")
            .execute(&mut *tx)
            .await?;
        for dst in dsts {
            sqlx::query("INSERT OR IGNORE INTO hidden_destinations (dst) VALUES (?)")
                .bind(dst)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ── Blocked texts ───────────────────────────────────────────

    pub async fn blocked_texts(&self) -> GatewayResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT pattern FROM blocked_texts ORDER BY pattern")
            .fetch_all(self.reader())
            .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    pub async fn update_blocked_text(&self, pattern: &str, blocked: bool) -> GatewayResult<()> {
        if blocked {
            sqlx::query("INSERT OR IGNORE INTO blocked_texts (pattern) VALUES (?)")
                .bind(pattern)
                .execute(self.writer())
                .await?;
        } else {
            sqlx::query("DELETE FROM blocked_texts WHERE pattern = ?")
                .bind(pattern)
                .execute(self.writer())
                .await?;
        }
        Ok(())
    }

    pub async fn set_blocked_texts(&self, patterns: &[String]) -> GatewayResult<()> {
        let mut tx = self.writer().begin().await?;
        sqlx::query("DELETE FROM blocked_texts").execute(&mut *tx).await?;
        for pattern in patterns {
            sqlx::query("INSERT OR IGNORE INTO blocked_texts (pattern) VALUES (?)")
                .bind(pattern)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ── Sidebar orders ──────────────────────────────────────────

    pub async fn sidebar(&self, kind: &str) -> GatewayResult<SidebarState> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT ordered, hidden FROM sidebar_orders WHERE kind = ?")
                .bind(kind)
                .fetch_optional(self.reader())
                .await?;
        Ok(match row {
            Some((ordered, hidden)) => SidebarState {
                order: serde_json::from_str(&ordered).unwrap_or_default(),
                hidden: serde_json::from_str(&hidden).unwrap_or_default(),
            },
            None => SidebarState::default(),
        })
    }

    pub async fn set_sidebar(&self, kind: &str, state: &SidebarState) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO sidebar_orders (kind, ordered, hidden, updated_at) \
             VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(kind) DO UPDATE SET ordered = excluded.ordered, \
               hidden = excluded.hidden, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(kind)
        .bind(serde_json::to_string(&state.order)?)
        .bind(serde_json::to_string(&state.hidden)?)
        .execute(self.writer())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_engine;

    #[tokio::test]
    async fn test_should_upsert_read_counts() {
        let (engine, _dir) = temp_engine().await;
        engine.set_read_count("20", 5).await.unwrap();
        engine.set_read_count("20", 9).await.unwrap();
        engine.set_read_count("DK5EN<>OE5HWN", 2).await.unwrap();

        let counts = engine.read_counts().await.unwrap();
        assert_eq!(counts.get("20"), Some(&9));
        assert_eq!(counts.len(), 2);
    }

    #[tokio::test]
    async fn test_should_toggle_and_bulk_replace_hidden_destinations() {
        let (engine, _dir) = temp_engine().await;
        engine.update_hidden_destination("262", true).await.unwrap();
        engine.update_hidden_destination("TEST", true).await.unwrap();
        engine.update_hidden_destination("262", false).await.unwrap();
        assert_eq!(engine.hidden_destinations().await.unwrap(), vec!["TEST"]);

        engine
            .set_hidden_destinations(&["1".into(), "2".into()])
            .await
            .unwrap();
        assert_eq!(engine.hidden_destinations().await.unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_should_persist_sidebar_state_per_kind() {
        let (engine, _dir) = temp_engine().await;
        let mheard = SidebarState {
            order: vec!["OE5HWN-12".into(), "DK5EN-1".into()],
            hidden: vec!["DB0ABC-12".into()],
        };
        engine.set_sidebar("mheard", &mheard).await.unwrap();
        engine
            .set_sidebar("wx", &SidebarState::default())
            .await
            .unwrap();

        assert_eq!(engine.sidebar("mheard").await.unwrap(), mheard);
        assert_eq!(engine.sidebar("wx").await.unwrap(), SidebarState::default());
        assert_eq!(engine.sidebar("missing").await.unwrap(), SidebarState::default());
    }

    #[tokio::test]
    async fn test_should_bulk_replace_blocked_texts() {
        let (engine, _dir) = temp_engine().await;
        engine.update_blocked_text("spam", true).await.unwrap();
        engine
            .set_blocked_texts(&["crypto".into(), "casino".into()])
            .await
            .unwrap();
        assert_eq!(
            engine.blocked_texts().await.unwrap(),
            vec!["casino", "crypto"]
        );
    }
}
