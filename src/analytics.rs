// =============================================================================
// Analytics — historical traffic patterns and percentile time series
// =============================================================================
//
// Two read-side queries over the hourly archive (and, for short windows, the
// raw recent ring):
//
//   - traffic patterns: an hour-of-week heatmap (hour 0-23 x day 0-6, UTC)
//     of request counts and average latency;
//   - percentiles: one p50/p95/p99 point per hour per endpoint.
//
// Source selection follows one rule: when the requested window extends
// beyond what the recent ring still holds, read archived reservoirs
// ("snapshots"); otherwise read raw ring samples ("raw_signals"). The
// response names the source either way.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::aggregate::{hour_bucket_of, percentiles_of};
use crate::db::Db;
use crate::signal_store::SignalStore;
use crate::types::{PolicyKey, TenantId};

/// Largest query window accepted by the analytics endpoints.
pub const MAX_QUERY_DAYS: u32 = 90;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// One cell of the hour-of-week heatmap. `day_of_week` is 0 = Sunday, UTC.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrafficPattern {
    pub hour: u32,
    pub day_of_week: u32,
    pub request_count: u64,
    pub avg_latency: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointPercentiles {
    pub endpoint: String,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// One hour of percentile data for one service.
#[derive(Debug, Clone, Serialize)]
pub struct PercentilePoint {
    /// RFC 3339 start of the hour.
    pub timestamp: String,
    pub service_name: String,
    pub endpoints: Vec<EndpointPercentiles>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileSource {
    Snapshots,
    RawSignals,
}

#[derive(Debug, Clone, Serialize)]
pub struct PercentileSeries {
    pub data: Vec<PercentilePoint>,
    pub source: PercentileSource,
}

// ---------------------------------------------------------------------------
// Traffic patterns
// ---------------------------------------------------------------------------

/// Hour-of-week heatmap over the last `days` days of archived hours.
pub fn traffic_patterns(db: &Db, tenant: TenantId, days: u32) -> Result<Vec<TrafficPattern>> {
    let cutoff = hour_bucket_of(Utc::now() - Duration::days(i64::from(days)));

    struct Cell {
        requests: u64,
        latency_weight: f64,
    }

    let mut cells: BTreeMap<(u32, u32), Cell> = BTreeMap::new();

    db.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT hour_bucket, n_success, n_error, latency_reservoir
             FROM signals_archive
             WHERE tenant_id = ?1 AND hour_bucket >= ?2",
        )?;
        let mut rows = stmt.query(params![tenant.to_string(), cutoff])?;
        while let Some(row) = rows.next()? {
            let bucket: i64 = row.get(0)?;
            let n_success: i64 = row.get(1)?;
            let n_error: i64 = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;

            let at = Utc
                .timestamp_opt(bucket * 3600, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let hour = at.hour();
            let dow = at.weekday().num_days_from_sunday();

            let requests = (n_success + n_error).max(0) as u64;
            let samples: Vec<f64> = serde_json::from_slice(&blob).unwrap_or_default();
            let mean = if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            };

            let cell = cells.entry((dow, hour)).or_insert(Cell {
                requests: 0,
                latency_weight: 0.0,
            });
            cell.requests += requests;
            cell.latency_weight += mean * requests as f64;
        }
        Ok(())
    })
    .context("traffic pattern query failed")?;

    Ok(cells
        .into_iter()
        .map(|((day_of_week, hour), cell)| TrafficPattern {
            hour,
            day_of_week,
            request_count: cell.requests,
            avg_latency: if cell.requests > 0 {
                cell.latency_weight / cell.requests as f64
            } else {
                0.0
            },
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Percentile series
// ---------------------------------------------------------------------------

/// Hourly p50/p95/p99 per endpoint over the last `days` days, optionally
/// restricted to one service.
pub fn percentile_series(
    db: &Db,
    signals: &SignalStore,
    tenant: TenantId,
    days: u32,
    service: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PercentileSeries> {
    let window_start = now - Duration::days(i64::from(days));

    let relevant: Vec<PolicyKey> = signals
        .tenant_keys(tenant)
        .into_iter()
        .filter(|k| service.map_or(true, |s| k.service == s))
        .collect();

    // Raw samples only when every relevant ring still reaches back to the
    // window start; a window beyond the ring horizon reads the archive.
    let ring_covers_window = !relevant.is_empty()
        && relevant.iter().all(|key| {
            signals
                .oldest_timestamp(key)
                .is_some_and(|oldest| oldest <= window_start)
        });

    if ring_covers_window {
        Ok(PercentileSeries {
            data: raw_series(signals, &relevant, window_start),
            source: PercentileSource::RawSignals,
        })
    } else {
        Ok(PercentileSeries {
            data: snapshot_series(db, tenant, service, window_start)?,
            source: PercentileSource::Snapshots,
        })
    }
}

fn raw_series(
    signals: &SignalStore,
    keys: &[PolicyKey],
    window_start: DateTime<Utc>,
) -> Vec<PercentilePoint> {
    // (hour, service) -> endpoint -> latencies
    let mut groups: BTreeMap<(i64, String), BTreeMap<String, Vec<f64>>> = BTreeMap::new();

    for key in keys {
        for signal in signals.slice_since(key, window_start) {
            let bucket = hour_bucket_of(signal.timestamp);
            groups
                .entry((bucket, key.service.clone()))
                .or_default()
                .entry(key.endpoint.clone())
                .or_default()
                .push(signal.latency_ms);
        }
    }

    groups
        .into_iter()
        .map(|((bucket, service_name), endpoints)| {
            build_point(bucket, service_name, endpoints)
        })
        .collect()
}

fn snapshot_series(
    db: &Db,
    tenant: TenantId,
    service: Option<&str>,
    window_start: DateTime<Utc>,
) -> Result<Vec<PercentilePoint>> {
    let cutoff = hour_bucket_of(window_start);
    let mut groups: BTreeMap<(i64, String), BTreeMap<String, Vec<f64>>> = BTreeMap::new();

    db.with_conn(|conn| {
        let mut collect = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            let bucket: i64 = row.get(0)?;
            let service_name: String = row.get(1)?;
            let endpoint: String = row.get(2)?;
            let blob: Vec<u8> = row.get(3)?;
            let samples: Vec<f64> = serde_json::from_slice(&blob).unwrap_or_default();
            groups
                .entry((bucket, service_name))
                .or_default()
                .entry(endpoint)
                .or_default()
                .extend(samples);
            Ok(())
        };

        match service {
            Some(service) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT hour_bucket, service_name, endpoint, latency_reservoir
                     FROM signals_archive
                     WHERE tenant_id = ?1 AND service_name = ?2 AND hour_bucket >= ?3",
                )?;
                let mut rows = stmt.query(params![tenant.to_string(), service, cutoff])?;
                while let Some(row) = rows.next()? {
                    collect(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT hour_bucket, service_name, endpoint, latency_reservoir
                     FROM signals_archive
                     WHERE tenant_id = ?1 AND hour_bucket >= ?2",
                )?;
                let mut rows = stmt.query(params![tenant.to_string(), cutoff])?;
                while let Some(row) = rows.next()? {
                    collect(row)?;
                }
            }
        }
        Ok(())
    })
    .context("percentile snapshot query failed")?;

    Ok(groups
        .into_iter()
        .map(|((bucket, service_name), endpoints)| {
            build_point(bucket, service_name, endpoints)
        })
        .collect())
}

fn build_point(
    bucket: i64,
    service_name: String,
    endpoints: BTreeMap<String, Vec<f64>>,
) -> PercentilePoint {
    let timestamp = Utc
        .timestamp_opt(bucket * 3600, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339();

    let endpoints = endpoints
        .into_iter()
        .filter_map(|(endpoint, samples)| {
            percentiles_of(&samples).map(|p| EndpointPercentiles {
                endpoint,
                p50: p.p50,
                p95: p.p95,
                p99: p.p99,
            })
        })
        .collect();

    PercentilePoint {
        timestamp,
        service_name,
        endpoints,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::HourlyRollup;
    use crate::archive::ArchiveWriter;
    use crate::types::{Signal, SignalStatus};

    fn tenant() -> TenantId {
        TenantId::from_api_key("analytics-test")
    }

    fn key(endpoint: &str) -> PolicyKey {
        PolicyKey::new(tenant(), "svc", endpoint)
    }

    async fn seed_archive(db: &Db, hours_ago: i64, samples: Vec<f64>, requests: u64) {
        let writer = ArchiveWriter::new(db.clone());
        let bucket = hour_bucket_of(Utc::now() - Duration::hours(hours_ago));
        writer
            .flush(&[HourlyRollup {
                key: key("/p"),
                hour_bucket: bucket,
                n_success: requests,
                n_error: 0,
                latency_samples: samples,
                requests,
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn heatmap_aggregates_archived_hours() {
        let db = Db::open(":memory:").unwrap();
        seed_archive(&db, 2, vec![100.0, 200.0], 50).await;
        seed_archive(&db, 30, vec![300.0], 10).await;

        let patterns = traffic_patterns(&db, tenant(), 7).unwrap();
        let total: u64 = patterns.iter().map(|p| p.request_count).sum();
        assert_eq!(total, 60);
        for p in &patterns {
            assert!(p.hour < 24);
            assert!(p.day_of_week < 7);
        }
    }

    #[tokio::test]
    async fn heatmap_respects_window() {
        let db = Db::open(":memory:").unwrap();
        seed_archive(&db, 24 * 10, vec![100.0], 40).await;

        // A 7-day window excludes the 10-day-old hour.
        assert!(traffic_patterns(&db, tenant(), 7).unwrap().is_empty());
        // A 30-day window includes it.
        let wide = traffic_patterns(&db, tenant(), 30).unwrap();
        assert_eq!(wide.iter().map(|p| p.request_count).sum::<u64>(), 40);
    }

    #[tokio::test]
    async fn heatmap_is_tenant_scoped() {
        let db = Db::open(":memory:").unwrap();
        seed_archive(&db, 2, vec![100.0], 50).await;
        let other = TenantId::from_api_key("other");
        assert!(traffic_patterns(&db, other, 7).unwrap().is_empty());
    }

    #[tokio::test]
    async fn percentiles_use_snapshots_when_ring_is_short() {
        let db = Db::open(":memory:").unwrap();
        let signals = SignalStore::new(4, 100);
        // Uniform 0..1000 in one archived hour.
        let samples: Vec<f64> = (0..1000).map(f64::from).collect();
        seed_archive(&db, 5, samples, 1000).await;

        let series =
            percentile_series(&db, &signals, tenant(), 7, Some("svc"), Utc::now()).unwrap();
        assert_eq!(series.source, PercentileSource::Snapshots);
        assert_eq!(series.data.len(), 1);

        let point = &series.data[0];
        assert_eq!(point.service_name, "svc");
        let ep = &point.endpoints[0];
        assert!((ep.p50 - 500.0).abs() < 20.0, "p50 = {}", ep.p50);
        assert!((ep.p95 - 950.0).abs() < 20.0, "p95 = {}", ep.p95);
        assert!((ep.p99 - 990.0).abs() < 20.0, "p99 = {}", ep.p99);
    }

    #[tokio::test]
    async fn percentiles_use_raw_ring_when_it_covers_the_window() {
        let db = Db::open(":memory:").unwrap();
        let signals = SignalStore::new(4, 10_000);
        let now = Utc::now();

        // Ring data older than the window start means full coverage.
        signals.append(Signal {
            tenant_id: tenant(),
            service_name: "svc".into(),
            endpoint: "/p".into(),
            latency_ms: 5.0,
            status: SignalStatus::Success,
            timestamp: now - Duration::days(2),
        });
        for i in 0..100u32 {
            signals.append(Signal {
                tenant_id: tenant(),
                service_name: "svc".into(),
                endpoint: "/p".into(),
                latency_ms: f64::from(i * 10),
                status: SignalStatus::Success,
                timestamp: now - Duration::hours(2),
            });
        }

        let series = percentile_series(&db, &signals, tenant(), 1, Some("svc"), now).unwrap();
        assert_eq!(series.source, PercentileSource::RawSignals);
        assert_eq!(series.data.len(), 1);
        assert_eq!(series.data[0].endpoints.len(), 1);
    }

    #[tokio::test]
    async fn percentile_source_string_form() {
        assert_eq!(
            serde_json::to_string(&PercentileSource::Snapshots).unwrap(),
            "\"snapshots\""
        );
        assert_eq!(
            serde_json::to_string(&PercentileSource::RawSignals).unwrap(),
            "\"raw_signals\""
        );
    }

    #[tokio::test]
    async fn service_filter_limits_snapshot_series() {
        let db = Db::open(":memory:").unwrap();
        let signals = SignalStore::new(4, 100);
        seed_archive(&db, 3, vec![10.0, 20.0], 2).await;

        let series =
            percentile_series(&db, &signals, tenant(), 7, Some("absent"), Utc::now()).unwrap();
        assert!(series.data.is_empty());
    }
}
