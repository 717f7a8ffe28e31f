// =============================================================================
// Signal Archive — hourly compaction of per-endpoint aggregates
// =============================================================================
//
// Raw signals age out of the recent ring; what survives long-term is one row
// per (key, hour): success/error counts, the hour's latency reservoir, and
// the request total. Analytics reads these rows for heatmaps and percentile
// series beyond the ring horizon.
//
// Disk write failures retry with exponential backoff (100 ms doubling to a
// 30 s cap, six attempts). The ring stays authoritative for live queries, so
// a lost flush degrades history, never liveness.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::aggregate::{Aggregator, HourlyRollup};
use crate::db::Db;
use crate::policy::InsightStore;
use crate::signal_store::SignalStore;

/// Maximum write attempts per flush.
const FLUSH_ATTEMPTS: u32 = 6;
/// First retry delay.
const FLUSH_BACKOFF_MS: u64 = 100;
/// Retry delay ceiling.
const FLUSH_BACKOFF_CAP_MS: u64 = 30_000;

/// How often closed hours are drained from the aggregator.
const ARCHIVE_TICK_SECS: u64 = 60;
/// How often ring signals and idle aggregates are aged out.
const SWEEP_TICK_SECS: u64 = 3600;
/// How often expired insights are swept.
const INSIGHT_SWEEP_TICK_SECS: u64 = 86_400;

pub struct ArchiveWriter {
    db: Db,
    retries: AtomicU64,
}

impl ArchiveWriter {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            retries: AtomicU64::new(0),
        }
    }

    /// Retries performed so far (health metric).
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Write a batch of hourly rollups, retrying with backoff. After the
    /// final attempt the batch is dropped with an error log.
    pub async fn flush(&self, rollups: &[HourlyRollup]) -> Result<()> {
        if rollups.is_empty() {
            return Ok(());
        }

        let mut backoff = FLUSH_BACKOFF_MS;
        for attempt in 1..=FLUSH_ATTEMPTS {
            match self.try_write(rollups) {
                Ok(()) => {
                    debug!(rows = rollups.len(), "archive flush complete");
                    return Ok(());
                }
                Err(err) if attempt < FLUSH_ATTEMPTS => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "archive flush failed, retrying"
                    );
                    sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(FLUSH_BACKOFF_CAP_MS);
                }
                Err(err) => {
                    error!(
                        rows = rollups.len(),
                        error = %err,
                        "archive flush abandoned after {FLUSH_ATTEMPTS} attempts"
                    );
                    return Err(err);
                }
            }
        }
        unreachable!("flush loop always returns");
    }

    fn try_write(&self, rollups: &[HourlyRollup]) -> Result<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO signals_archive
                     (hour_bucket, tenant_id, service_name, endpoint,
                      n_success, n_error, latency_reservoir, rpm_total)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for rollup in rollups {
                    let blob = serde_json::to_vec(&rollup.latency_samples)
                        .context("failed to encode reservoir blob")?;
                    stmt.execute(params![
                        rollup.hour_bucket,
                        rollup.key.tenant.to_string(),
                        rollup.key.service,
                        rollup.key.endpoint,
                        rollup.n_success as i64,
                        rollup.n_error as i64,
                        blob,
                        rollup.requests as i64,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Drain closed hours from the aggregator into the archive. Runs forever;
/// spawn once at startup.
pub async fn run_archive_loop(aggregator: Arc<Aggregator>, writer: Arc<ArchiveWriter>) {
    info!(tick_secs = ARCHIVE_TICK_SECS, "archive loop started");
    let mut ticker = interval(Duration::from_secs(ARCHIVE_TICK_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let rollups = aggregator.drain_closed_hours(Utc::now());
        if rollups.is_empty() {
            continue;
        }
        if let Err(err) = writer.flush(&rollups).await {
            aggregator.record_error();
            error!(error = %err, "hourly archive write lost");
        }
    }
}

/// Age out ring signals and idle aggregates hourly, and expired insights
/// once a day. Runs forever; spawn once at startup.
pub async fn run_retention_sweep(
    signals: Arc<SignalStore>,
    aggregator: Arc<Aggregator>,
    insights: Arc<InsightStore>,
    retention: chrono::Duration,
) {
    info!(
        ring_tick_secs = SWEEP_TICK_SECS,
        insight_tick_secs = INSIGHT_SWEEP_TICK_SECS,
        retention_days = retention.num_days(),
        "retention sweep started"
    );
    let mut ring_ticker = interval(Duration::from_secs(SWEEP_TICK_SECS));
    ring_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut insight_ticker = interval(Duration::from_secs(INSIGHT_SWEEP_TICK_SECS));
    insight_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ring_ticker.tick() => {
                let now = Utc::now();
                let pruned_signals = signals.prune(retention, now);
                let pruned_aggregates = aggregator.prune_idle(retention, now);
                if pruned_signals + pruned_aggregates > 0 {
                    info!(
                        signals = pruned_signals,
                        aggregates = pruned_aggregates,
                        "ring retention sweep complete"
                    );
                }
            }
            _ = insight_ticker.tick() => {
                match insights.sweep_expired(Utc::now()) {
                    Ok(swept) if swept > 0 => {
                        info!(insights = swept, "insight retention sweep complete");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "insight retention sweep failed");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
