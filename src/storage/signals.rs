//! Signal log and pre-aggregated signal buckets.
//!
//! Every MHeard beacon with in-range signal values appends a raw
//! `signal_log` row and feeds the in-memory accumulator. A pending bucket
//! is flushed to `signal_buckets` when a newer bucket receives a sample for
//! the same callsign; shutdown flushes everything that is still open. A
//! nightly job rolls 5-minute buckets older than 8 days into 1-hour rows.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::StorageEngine;
use crate::error::GatewayResult;

/// Bucket width for live aggregation, seconds.
pub const BUCKET_SECONDS: i64 = 5 * 60;
/// Hourly rollup bucket width, seconds.
pub const HOURLY_BUCKET_SECONDS: i64 = 60 * 60;
/// Valid RSSI range, dBm.
pub const VALID_RSSI_RANGE: (i32, i32) = (-140, -30);
/// Valid SNR range, dB.
pub const VALID_SNR_RANGE: (f64, f64) = (-30.0, 12.0);
/// Gap marker threshold: consecutive buckets further apart than this many
/// bucket widths get a null row between them.
pub const GAP_THRESHOLD_MULTIPLIER: i64 = 6;
/// Minimum data points per callsign for the statistics output.
pub const MIN_DATAPOINTS_FOR_STATS: usize = 10;

/// A completed aggregation bucket ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalBucket {
    pub callsign: String,
    /// Bucket start, seconds since epoch
    pub bucket_start: i64,
    pub rssi_avg: f64,
    pub rssi_min: i32,
    pub rssi_max: i32,
    pub snr_avg: f64,
    pub snr_min: f64,
    pub snr_max: f64,
    pub sample_count: i64,
}

#[derive(Debug, Default)]
struct PendingBucket {
    bucket_start: i64,
    rssi: Vec<i32>,
    snr: Vec<f64>,
}

impl PendingBucket {
    fn into_bucket(self, callsign: &str) -> Option<SignalBucket> {
        if self.rssi.is_empty() {
            return None;
        }
        let n = self.rssi.len() as f64;
        Some(SignalBucket {
            callsign: callsign.to_string(),
            bucket_start: self.bucket_start,
            rssi_avg: self.rssi.iter().map(|&v| f64::from(v)).sum::<f64>() / n,
            rssi_min: *self.rssi.iter().min().expect("non-empty"),
            rssi_max: *self.rssi.iter().max().expect("non-empty"),
            snr_avg: self.snr.iter().sum::<f64>() / n,
            snr_min: self.snr.iter().cloned().fold(f64::INFINITY, f64::min),
            snr_max: self.snr.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            sample_count: self.rssi.len() as i64,
        })
    }
}

/// In-memory accumulator keyed by (callsign, 5-minute bucket start).
///
/// Eventually consistent: a bucket leaves memory only when a later bucket
/// sees a sample for the same callsign, or on [`SignalAccumulator::flush_all`].
#[derive(Debug, Default)]
pub struct SignalAccumulator {
    pending: HashMap<String, PendingBucket>,
    samples_accepted: u64,
    buckets_flushed_samples: u64,
}

impl SignalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one accepted sample. Returns a completed bucket when the sample
    /// opens a newer bucket for this callsign.
    pub fn add(
        &mut self,
        callsign: &str,
        timestamp_ms: i64,
        rssi: i32,
        snr: f64,
    ) -> Option<SignalBucket> {
        let bucket_start = timestamp_ms / 1000 / BUCKET_SECONDS * BUCKET_SECONDS;
        self.samples_accepted += 1;

        let entry = self
            .pending
            .entry(callsign.to_string())
            .or_insert_with(|| PendingBucket {
                bucket_start,
                ..Default::default()
            });

        let mut flushed = None;
        if bucket_start > entry.bucket_start {
            let done = std::mem::replace(
                entry,
                PendingBucket {
                    bucket_start,
                    ..Default::default()
                },
            );
            flushed = done.into_bucket(callsign);
            if let Some(b) = &flushed {
                self.buckets_flushed_samples += b.sample_count as u64;
            }
        } else if bucket_start < entry.bucket_start {
            // Late sample for an already-flushed window: fold it into the
            // open bucket rather than losing it.
            debug!(callsign, "late signal sample folded into open bucket");
        }

        entry.rssi.push(rssi);
        entry.snr.push(snr);
        flushed
    }

    /// Flush every open bucket (shutdown path).
    pub fn flush_all(&mut self) -> Vec<SignalBucket> {
        let pending = std::mem::take(&mut self.pending);
        let buckets: Vec<SignalBucket> = pending
            .into_iter()
            .filter_map(|(call, b)| b.into_bucket(&call))
            .collect();
        for b in &buckets {
            self.buckets_flushed_samples += b.sample_count as u64;
        }
        buckets
    }

    /// Samples currently held in open buckets.
    pub fn in_flight(&self) -> u64 {
        self.pending.values().map(|b| b.rssi.len() as u64).sum()
    }

    /// Conservation check: flushed + in-flight equals accepted.
    pub fn accounted_samples(&self) -> (u64, u64, u64) {
        (
            self.samples_accepted,
            self.buckets_flushed_samples,
            self.in_flight(),
        )
    }
}

/// Insert completed buckets.
pub async fn insert_buckets(pool: &SqlitePool, buckets: &[SignalBucket]) -> GatewayResult<()> {
    for b in buckets {
        sqlx::query(
            "INSERT INTO signal_buckets \
             (callsign, bucket_start, rssi_avg, rssi_min, rssi_max, snr_avg, snr_min, snr_max, sample_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(callsign, bucket_start) DO UPDATE SET \
               rssi_avg = (rssi_avg * sample_count + excluded.rssi_avg * excluded.sample_count) \
                          / (sample_count + excluded.sample_count), \
               snr_avg = (snr_avg * sample_count + excluded.snr_avg * excluded.sample_count) \
                         / (sample_count + excluded.sample_count), \
               rssi_min = MIN(rssi_min, excluded.rssi_min), \
               rssi_max = MAX(rssi_max, excluded.rssi_max), \
               snr_min = MIN(snr_min, excluded.snr_min), \
               snr_max = MAX(snr_max, excluded.snr_max), \
               sample_count = sample_count + excluded.sample_count",
        )
        .bind(&b.callsign)
        .bind(b.bucket_start)
        .bind(b.rssi_avg)
        .bind(b.rssi_min)
        .bind(b.rssi_max)
        .bind(b.snr_avg)
        .bind(b.snr_min)
        .bind(b.snr_max)
        .bind(b.sample_count)
        .execute(pool)
        .await?;
    }
    Ok(())
}

impl StorageEngine {
    /// Feed one MHeard signal sample: raw log row plus accumulator, with
    /// completed buckets flushed to the table.
    pub async fn record_signal(
        &self,
        callsign: &str,
        timestamp_ms: i64,
        rssi: i32,
        snr: f64,
    ) -> GatewayResult<()> {
        if !(VALID_RSSI_RANGE.0..=VALID_RSSI_RANGE.1).contains(&rssi)
            || !(VALID_SNR_RANGE.0..=VALID_SNR_RANGE.1).contains(&snr)
        {
            debug!(callsign, rssi, snr, "signal sample out of range, skipped");
            return Ok(());
        }

        sqlx::query("INSERT INTO signal_log (callsign, timestamp, rssi, snr) VALUES (?, ?, ?, ?)")
            .bind(callsign)
            .bind(timestamp_ms)
            .bind(rssi)
            .bind(snr)
            .execute(self.writer())
            .await?;

        let flushed = self
            .accumulator
            .lock()
            .expect("accumulator poisoned")
            .add(callsign, timestamp_ms, rssi, snr);
        if let Some(bucket) = flushed {
            insert_buckets(self.writer(), &[bucket]).await?;
        }
        Ok(())
    }

    /// Weekly mHeard statistics: 5-minute buckets over the last 7 days.
    pub async fn mheard_stats_weekly(&self) -> GatewayResult<Vec<Value>> {
        self.mheard_stats("signal_buckets", 7 * 24, BUCKET_SECONDS).await
    }

    /// Monthly statistics from 5-minute buckets (capped by their 8-day
    /// retention) merged with hourly rollups.
    pub async fn mheard_stats_monthly(&self) -> GatewayResult<Vec<Value>> {
        self.mheard_stats("signal_buckets_hourly", 30 * 24, HOURLY_BUCKET_SECONDS)
            .await
    }

    /// Yearly statistics from 1-hour buckets.
    pub async fn mheard_stats_yearly(&self) -> GatewayResult<Vec<Value>> {
        self.mheard_stats("signal_buckets_hourly", 365 * 24, HOURLY_BUCKET_SECONDS)
            .await
    }

    /// Pull pre-aggregated buckets for the window, group per callsign,
    /// require [`MIN_DATAPOINTS_FOR_STATS`] points, and insert a synthetic
    /// gap-marker row wherever two consecutive buckets are further apart
    /// than six bucket widths. Gap markers carry nulls and render as line
    /// breaks in the client chart.
    async fn mheard_stats(
        &self,
        table: &str,
        window_hours: i64,
        bucket_seconds: i64,
    ) -> GatewayResult<Vec<Value>> {
        let cutoff = chrono::Utc::now().timestamp() - window_hours * 3600;
        let rows: Vec<(String, i64, f64, i32, i32, f64, f64, f64, i64)> = sqlx::query_as(&format!(
            "SELECT callsign, bucket_start, rssi_avg, rssi_min, rssi_max, \
                    snr_avg, snr_min, snr_max, sample_count \
             FROM {table} WHERE bucket_start >= ? ORDER BY callsign, bucket_start"
        ))
        .bind(cutoff)
        .fetch_all(self.reader())
        .await?;

        let mut per_callsign: HashMap<String, Vec<_>> = HashMap::new();
        for row in rows {
            per_callsign.entry(row.0.clone()).or_default().push(row);
        }

        let gap_threshold = GAP_THRESHOLD_MULTIPLIER * bucket_seconds;
        let mut result = Vec::new();

        let mut callsigns: Vec<_> = per_callsign.into_iter().collect();
        callsigns.sort_by(|a, b| a.0.cmp(&b.0));

        for (callsign, mut entries) in callsigns {
            if entries.len() < MIN_DATAPOINTS_FOR_STATS {
                continue;
            }
            entries.sort_by_key(|e| e.1);

            let mut segment_id = 0;
            let mut prev_time: Option<i64> = None;

            for (_, bucket_start, rssi_avg, rssi_min, rssi_max, snr_avg, snr_min, snr_max, count) in
                entries
            {
                if let Some(prev) = prev_time {
                    if bucket_start - prev > gap_threshold {
                        result.push(json!({
                            "src_type": "STATS",
                            "timestamp": bucket_start - bucket_seconds,
                            "callsign": callsign,
                            "rssi": null,
                            "snr": null,
                            "rssi_min": null,
                            "rssi_max": null,
                            "snr_min": null,
                            "snr_max": null,
                            "count": null,
                            "segment_id": format!("{callsign}_gap_{segment_id}_to_{}", segment_id + 1),
                            "is_gap_marker": true,
                        }));
                        segment_id += 1;
                    }
                }

                result.push(json!({
                    "src_type": "STATS",
                    "timestamp": bucket_start,
                    "callsign": callsign,
                    "rssi": (rssi_avg * 100.0).round() / 100.0,
                    "snr": (snr_avg * 100.0).round() / 100.0,
                    "rssi_min": rssi_min,
                    "rssi_max": rssi_max,
                    "snr_min": (snr_min * 100.0).round() / 100.0,
                    "snr_max": (snr_max * 100.0).round() / 100.0,
                    "count": count,
                    "segment_id": format!("{callsign}_seg_{segment_id}"),
                }));

                prev_time = Some(bucket_start);
            }
        }

        info!(entries = result.len(), "mheard statistics generated");
        Ok(result)
    }

    /// Roll 5-minute buckets older than 8 days into 1-hour buckets, then
    /// delete the source rows. Runs from the nightly job.
    pub async fn aggregate_hourly_buckets(&self) -> GatewayResult<u64> {
        let cutoff = chrono::Utc::now().timestamp() - 8 * 24 * 3600;

        let mut tx = self.writer().begin().await?;
        let rolled = sqlx::query(
            "INSERT INTO signal_buckets_hourly \
             (callsign, bucket_start, rssi_avg, rssi_min, rssi_max, snr_avg, snr_min, snr_max, sample_count) \
             SELECT callsign, \
                    bucket_start / 3600 * 3600, \
                    SUM(rssi_avg * sample_count) / SUM(sample_count), \
                    MIN(rssi_min), MAX(rssi_max), \
                    SUM(snr_avg * sample_count) / SUM(sample_count), \
                    MIN(snr_min), MAX(snr_max), \
                    SUM(sample_count) \
             FROM signal_buckets WHERE bucket_start < ? \
             GROUP BY callsign, bucket_start / 3600 * 3600 \
             ON CONFLICT(callsign, bucket_start) DO NOTHING",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM signal_buckets WHERE bucket_start < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if rolled > 0 {
            info!(rolled, "5-minute buckets rolled into hourly");
        }
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_engine;

    #[test]
    fn test_should_flush_bucket_only_when_newer_bucket_arrives() {
        let mut acc = SignalAccumulator::new();
        let t0 = 1_700_000_000_000i64;

        assert!(acc.add("X-1", t0, -80, 5.0).is_none());
        assert!(acc.add("X-1", t0 + 60_000, -82, 5.5).is_none());

        // Next bucket (5 minutes later) flushes the previous one.
        let flushed = acc.add("X-1", t0 + 301_000, -90, 4.0).expect("flush");
        assert_eq!(flushed.sample_count, 2);
        assert_eq!(flushed.rssi_min, -82);
        assert_eq!(flushed.rssi_max, -80);
        assert!((flushed.rssi_avg - -81.0).abs() < 0.001);
    }

    #[test]
    fn test_should_conserve_samples_across_flushes() {
        let mut acc = SignalAccumulator::new();
        let t0 = 1_700_000_000_000i64;
        for i in 0..20 {
            acc.add("A-1", t0 + i * 90_000, -80 - (i % 5) as i32, 5.0);
            acc.add("B-2", t0 + i * 45_000, -90, 3.0);
        }
        let _rest = acc.flush_all();
        let (accepted, flushed, in_flight) = acc.accounted_samples();
        assert_eq!(accepted, 40);
        assert_eq!(flushed + in_flight, accepted);
        assert_eq!(in_flight, 0, "flush_all leaves nothing behind");
    }

    #[test]
    fn test_should_keep_separate_buckets_per_callsign() {
        let mut acc = SignalAccumulator::new();
        let t0 = 1_700_000_000_000i64;
        acc.add("A-1", t0, -80, 5.0);
        // A newer bucket for B must not flush A's bucket.
        assert!(acc.add("B-2", t0 + 600_000, -85, 2.0).is_none());
        assert_eq!(acc.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_should_skip_out_of_range_samples() {
        let (engine, _dir) = temp_engine().await;
        engine.record_signal("X-1", 1_700_000_000_000, -20, 5.0).await.unwrap();
        engine.record_signal("X-1", 1_700_000_000_000, -80, 40.0).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_log")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_should_append_signal_log_and_flush_buckets() {
        let (engine, _dir) = temp_engine().await;
        let t0 = chrono::Utc::now().timestamp_millis() - 3_600_000;

        engine.record_signal("X-1", t0, -80, 5.0).await.unwrap();
        engine.record_signal("X-1", t0 + 60_000, -84, 6.0).await.unwrap();
        engine.record_signal("X-1", t0 + 400_000, -90, 2.0).await.unwrap();

        let log_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_log")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(log_count.0, 3);

        let buckets: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_buckets")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(buckets.0, 1, "first bucket flushed by the newer sample");
    }

    #[tokio::test]
    async fn test_should_insert_gap_markers_between_distant_buckets() {
        let (engine, _dir) = temp_engine().await;
        let now = chrono::Utc::now().timestamp();
        let base = now / BUCKET_SECONDS * BUCKET_SECONDS - 24 * 3600;

        // 10 consecutive buckets, then a 2-hour hole, then 2 more.
        let mut buckets = Vec::new();
        for i in 0..10 {
            buckets.push(SignalBucket {
                callsign: "X-1".into(),
                bucket_start: base + i * BUCKET_SECONDS,
                rssi_avg: -80.0,
                rssi_min: -85,
                rssi_max: -75,
                snr_avg: 5.0,
                snr_min: 4.0,
                snr_max: 6.0,
                sample_count: 3,
            });
        }
        for i in 0..2 {
            buckets.push(SignalBucket {
                callsign: "X-1".into(),
                bucket_start: base + (10 + i) * BUCKET_SECONDS + 7200,
                rssi_avg: -82.0,
                rssi_min: -85,
                rssi_max: -80,
                snr_avg: 5.0,
                snr_min: 4.0,
                snr_max: 6.0,
                sample_count: 2,
            });
        }
        insert_buckets(engine.writer(), &buckets).await.unwrap();

        let stats = engine.mheard_stats_weekly().await.unwrap();
        let gaps: Vec<_> = stats
            .iter()
            .filter(|v| v["is_gap_marker"].as_bool() == Some(true))
            .collect();
        assert_eq!(gaps.len(), 1, "exactly one gap across the 2-hour hole");

        let points = stats.len() - gaps.len();
        assert_eq!(points, 12);
    }

    #[tokio::test]
    async fn test_should_drop_callsigns_below_minimum_datapoints() {
        let (engine, _dir) = temp_engine().await;
        let now = chrono::Utc::now().timestamp();
        let base = now / BUCKET_SECONDS * BUCKET_SECONDS - 24 * 3600;

        let buckets: Vec<SignalBucket> = (0..5)
            .map(|i| SignalBucket {
                callsign: "FEW-1".into(),
                bucket_start: base + i * BUCKET_SECONDS,
                rssi_avg: -80.0,
                rssi_min: -85,
                rssi_max: -75,
                snr_avg: 5.0,
                snr_min: 4.0,
                snr_max: 6.0,
                sample_count: 1,
            })
            .collect();
        insert_buckets(engine.writer(), &buckets).await.unwrap();

        let stats = engine.mheard_stats_weekly().await.unwrap();
        assert!(stats.is_empty(), "5 points is below the 10-point minimum");
    }

    #[tokio::test]
    async fn test_should_roll_aged_buckets_into_hourly_rows() {
        let (engine, _dir) = temp_engine().await;
        let old = chrono::Utc::now().timestamp() - 9 * 24 * 3600;
        let old_aligned = old / 3600 * 3600;

        let buckets: Vec<SignalBucket> = (0..4)
            .map(|i| SignalBucket {
                callsign: "X-1".into(),
                bucket_start: old_aligned + i * BUCKET_SECONDS,
                rssi_avg: -80.0 - f64::from(i as u8),
                rssi_min: -90,
                rssi_max: -70,
                snr_avg: 5.0,
                snr_min: 4.0,
                snr_max: 6.0,
                sample_count: 2,
            })
            .collect();
        insert_buckets(engine.writer(), &buckets).await.unwrap();

        let rolled = engine.aggregate_hourly_buckets().await.unwrap();
        assert_eq!(rolled, 1, "four 5-minute buckets in one hour roll into one row");

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signal_buckets")
            .fetch_one(engine.reader())
            .await
            .unwrap();
        assert_eq!(remaining.0, 0);

        let hourly: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(sample_count), 0) FROM signal_buckets_hourly",
        )
        .fetch_one(engine.reader())
        .await
        .unwrap();
        assert_eq!(hourly.0, 1);
        assert_eq!(hourly.1, 8, "sample counts survive the rollup");
    }
}
