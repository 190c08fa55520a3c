//! Storage engine: schema-versioned SQLite store.
//!
//! Reads go through a persistent read-only pool (`query_only` pragma, WAL
//! journaling) so they never contend with the writer; writes serialize
//! through a single-connection pool, which is the dedicated-writer-worker
//! model with sqlx's pooling doing the queueing. Embedded migrations record
//! every applied step, so a crash mid-migration resumes where it left off.

pub mod messages;
pub mod positions;
pub mod retention;
pub mod signals;
pub mod telemetry;
pub mod ui_state;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use self::signals::SignalAccumulator;

/// Embedded schema migrations, versions 1 through 13.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database size cap; crossing it triggers the synchronous pruner.
pub const MAX_DB_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// The storage engine.
pub struct StorageEngine {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
    db_path: PathBuf,
    /// In-memory 5-minute signal bucket accumulator
    pub(crate) accumulator: Mutex<SignalAccumulator>,
}

impl StorageEngine {
    /// Open the database, apply pragmas and run migrations.
    ///
    /// Migration failure is fatal: the caller must exit non-zero.
    pub async fn open(db_path: &Path) -> GatewayResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let write_options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL")
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-65536");

        // Single writer: blocking disk work queues here instead of stalling
        // the cooperative scheduler.
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_options)
            .await?;

        MIGRATOR
            .run(&write_pool)
            .await
            .map_err(|e| GatewayError::Migration(e.to_string()))?;
        info!("database migrations current");

        // WAL readers never block on the writer; the pool keeps the
        // connections persistent and the pragma makes them strictly
        // read-only (plain read_only mode cannot maintain the WAL index).
        let read_options = SqliteConnectOptions::new()
            .filename(db_path)
            .pragma("journal_mode", "WAL")
            .pragma("query_only", "ON");
        let read_pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(read_options)
            .await?;

        Ok(Self {
            read_pool,
            write_pool,
            db_path: db_path.to_path_buf(),
            accumulator: Mutex::new(SignalAccumulator::new()),
        })
    }

    /// Read pool handle.
    pub fn reader(&self) -> &SqlitePool {
        &self.read_pool
    }

    /// Write pool handle (single connection).
    pub fn writer(&self) -> &SqlitePool {
        &self.write_pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Current database file size in bytes (main file plus WAL).
    pub async fn db_size_bytes(&self) -> u64 {
        let mut total = 0;
        for suffix in ["", "-wal"] {
            let path = PathBuf::from(format!("{}{}", self.db_path.display(), suffix));
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                total += meta.len();
            }
        }
        total
    }

    /// Total message row count.
    pub async fn message_count(&self) -> GatewayResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.read_pool)
            .await?;
        Ok(count.0)
    }

    /// Flush the open signal accumulators and close the pools.
    pub async fn close(&self) {
        let pending = self
            .accumulator
            .lock()
            .expect("accumulator poisoned")
            .flush_all();
        if !pending.is_empty() {
            if let Err(e) = signals::insert_buckets(&self.write_pool, &pending).await {
                warn!(error = %e, "failed to flush signal buckets on shutdown");
            }
        }
        self.read_pool.close().await;
        self.write_pool.close().await;
        info!("storage engine closed");
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use tempfile::TempDir;

    /// Fresh engine on a temp database; keeps the dir alive with the engine.
    pub async fn temp_engine() -> (StorageEngine, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let engine = StorageEngine::open(&dir.path().join("test.db"))
            .await
            .expect("open temp database");
        (engine, dir)
    }
}
