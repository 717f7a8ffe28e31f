// =============================================================================
// Aggregator — per-endpoint rolling statistics under concurrent writers
// =============================================================================
//
// One `EndpointAggregate` per (tenant, service, endpoint) key, held in a
// sharded map (shard = hash(key) % SHARD_COUNT). All mutation for a key goes
// through its shard lock, which serialises writers per key; snapshots are
// immutable value copies so no lock is held while serving readers.
//
// Two snapshot cadences feed downstream consumers:
//   - every 1 s: streaming snapshots for the SSE hub;
//   - every 10 s: policy snapshots for the decision engine. These also reset
//     the per-window sample counter used for the insufficient-data mark.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::aggregate::reservoir::{Percentiles, Reservoir, RESERVOIR_CAPACITY};
use crate::aggregate::rpm::RpmRing;
use crate::types::{PolicyKey, Signal, SignalStatus, TenantId};

/// Snapshots with fewer than this many samples in the evaluation window are
/// marked `insufficient_data`; the policy engine must not downgrade on them.
pub const MIN_WINDOW_SAMPLES: u32 = 20;

/// EWMA half-life for the smoothed latency estimate.
const EWMA_HALF_LIFE_SECS: f64 = 30.0;

// ---------------------------------------------------------------------------
// Latency EWMA
// ---------------------------------------------------------------------------

/// Exponentially weighted moving average with a 30 s half-life, decayed by
/// signal timestamps rather than a fixed per-sample alpha so that bursty and
/// sparse traffic age the same way.
#[derive(Debug, Clone, Default)]
pub struct LatencyEwma {
    value: Option<f64>,
    last_at: Option<DateTime<Utc>>,
}

impl LatencyEwma {
    pub fn observe(&mut self, latency_ms: f64, at: DateTime<Utc>) {
        match (self.value, self.last_at) {
            (Some(prev), Some(last)) => {
                let dt = (at - last).num_milliseconds().max(0) as f64 / 1000.0;
                let alpha = 1.0 - 0.5f64.powf(dt / EWMA_HALF_LIFE_SECS);
                // A same-millisecond burst still needs to move the average.
                let alpha = alpha.max(0.02);
                self.value = Some(prev + alpha * (latency_ms - prev));
                self.last_at = Some(at);
            }
            _ => {
                self.value = Some(latency_ms);
                self.last_at = Some(at);
            }
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

// ---------------------------------------------------------------------------
// EndpointAggregate
// ---------------------------------------------------------------------------

/// Rolling statistics for one endpoint. Mutated only by the aggregator under
/// the owning shard's write lock (single-writer discipline per key).
#[derive(Debug)]
pub struct EndpointAggregate {
    pub n_success: u64,
    pub n_error: u64,
    reservoir: Reservoir,
    rpm: RpmRing,
    ewma: LatencyEwma,
    pub last_signal_at: DateTime<Utc>,
    /// Samples recorded since the last policy snapshot.
    window_samples: u32,
    /// Successes / errors inside the current evaluation window.
    window_errors: u32,
    window_successes: u32,

    // Hourly accumulation for the archive.
    hour_bucket: i64,
    hour_success: u64,
    hour_error: u64,
    hour_reservoir: Reservoir,
    /// Hours finished since the last archive drain.
    closed_hours: Vec<ClosedHour>,
}

#[derive(Debug)]
struct ClosedHour {
    bucket: i64,
    n_success: u64,
    n_error: u64,
    samples: Vec<f64>,
}

impl EndpointAggregate {
    fn new(first_seen: DateTime<Utc>, reservoir_capacity: usize) -> Self {
        Self {
            n_success: 0,
            n_error: 0,
            reservoir: Reservoir::new(reservoir_capacity),
            rpm: RpmRing::new(),
            ewma: LatencyEwma::default(),
            last_signal_at: first_seen,
            window_samples: 0,
            window_errors: 0,
            window_successes: 0,
            hour_bucket: hour_bucket_of(first_seen),
            hour_success: 0,
            hour_error: 0,
            hour_reservoir: Reservoir::new(reservoir_capacity),
            closed_hours: Vec::new(),
        }
    }

    fn record(&mut self, signal: &Signal) {
        let bucket = hour_bucket_of(signal.timestamp);
        if bucket != self.hour_bucket {
            self.roll_hour(bucket);
        }
        match signal.status {
            SignalStatus::Success => {
                self.n_success += 1;
                self.window_successes += 1;
                self.hour_success += 1;
            }
            SignalStatus::Error => {
                self.n_error += 1;
                self.window_errors += 1;
                self.hour_error += 1;
            }
        }
        self.reservoir.offer(signal.latency_ms);
        self.hour_reservoir.offer(signal.latency_ms);
        self.rpm.record(signal.timestamp.timestamp() as u64);
        self.ewma.observe(signal.latency_ms, signal.timestamp);
        self.last_signal_at = signal.timestamp;
        self.window_samples = self.window_samples.saturating_add(1);
    }

    /// Close the accumulating hour and start a new one.
    fn roll_hour(&mut self, new_bucket: i64) {
        if self.hour_success + self.hour_error > 0 {
            self.closed_hours.push(ClosedHour {
                bucket: self.hour_bucket,
                n_success: self.hour_success,
                n_error: self.hour_error,
                samples: self.hour_reservoir.samples().to_vec(),
            });
        }
        self.hour_bucket = new_bucket;
        self.hour_success = 0;
        self.hour_error = 0;
        self.hour_reservoir.reset();
    }

    fn error_rate(&self) -> Option<f64> {
        let n = self.n_success + self.n_error;
        if n == 0 {
            None
        } else {
            Some(self.n_error as f64 / n as f64)
        }
    }
}

/// Unix hour (hours since epoch) a timestamp falls into.
pub fn hour_bucket_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(3600)
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Immutable value copy of an aggregate at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub key: PolicyKey,
    pub n_success: u64,
    pub n_error: u64,
    /// Undefined (None) until at least one signal has arrived.
    pub error_rate: Option<f64>,
    /// Mean of the latency reservoir; defined iff at least one success.
    pub avg_latency: Option<f64>,
    pub percentiles: Option<Percentiles>,
    pub rpm: u32,
    pub ewma_latency: Option<f64>,
    pub last_signal_at: DateTime<Utc>,
    /// Samples recorded in the evaluation window this snapshot closes.
    pub window_samples: u32,
    /// Error rate within the evaluation window alone.
    pub window_error_rate: Option<f64>,
    pub insufficient_data: bool,
    pub taken_at: DateTime<Utc>,
}

/// One finished hour of accumulation for one key, ready for the archive.
#[derive(Debug, Clone)]
pub struct HourlyRollup {
    pub key: PolicyKey,
    pub hour_bucket: i64,
    pub n_success: u64,
    pub n_error: u64,
    pub latency_samples: Vec<f64>,
    pub requests: u64,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct Aggregator {
    shards: Vec<RwLock<HashMap<PolicyKey, EndpointAggregate>>>,
    reservoir_capacity: usize,
    /// Internal errors are never surfaced to callers; they land here and are
    /// exported through the health endpoint.
    errors: AtomicU64,
}

impl Aggregator {
    pub fn new(shard_count: usize) -> Self {
        Self::with_reservoir_capacity(shard_count, RESERVOIR_CAPACITY)
    }

    pub fn with_reservoir_capacity(shard_count: usize, reservoir_capacity: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            reservoir_capacity,
            errors: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &PolicyKey) -> &RwLock<HashMap<PolicyKey, EndpointAggregate>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Fold one signal into its endpoint aggregate. Per-key ordering is the
    /// caller's responsibility (the ingress router consumes each tenant queue
    /// sequentially); the shard lock serialises concurrent tenants.
    pub fn record(&self, signal: &Signal) {
        let key = signal.key();
        let mut shard = self.shard(&key).write();
        shard
            .entry(key)
            .or_insert_with(|| EndpointAggregate::new(signal.timestamp, self.reservoir_capacity))
            .record(signal);
    }

    /// Streaming snapshot of one key. Does not reset evaluation windows.
    pub fn snapshot_key(&self, key: &PolicyKey) -> Option<AggregateSnapshot> {
        let shard = self.shard(key).read();
        shard.get(key).map(|agg| self.build_snapshot(key, agg, false))
    }

    /// Streaming snapshots for every key of one tenant.
    pub fn tenant_snapshots(&self, tenant: TenantId) -> Vec<AggregateSnapshot> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            for (key, agg) in guard.iter() {
                if key.tenant == tenant {
                    out.push(self.build_snapshot(key, agg, false));
                }
            }
        }
        out
    }

    /// Evaluation snapshots for every key, closing the current window: the
    /// per-window counters reset so the next 10 s tick measures fresh data.
    pub fn policy_snapshots(&self) -> Vec<AggregateSnapshot> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write();
            for (key, agg) in guard.iter_mut() {
                out.push(self.build_snapshot(key, agg, true));
                agg.window_samples = 0;
                agg.window_errors = 0;
                agg.window_successes = 0;
            }
        }
        out
    }

    /// Every tenant currently holding at least one aggregate.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut seen = std::collections::HashSet::new();
        for shard in &self.shards {
            let guard = shard.read();
            for key in guard.keys() {
                seen.insert(key.tenant);
            }
        }
        seen.into_iter().collect()
    }

    /// Collect and reset every hourly accumulation belonging to an hour that
    /// has fully elapsed at `now`. Called by the archive flush loop.
    pub fn drain_closed_hours(&self, now: DateTime<Utc>) -> Vec<HourlyRollup> {
        let current = hour_bucket_of(now);
        let mut rollups = Vec::new();

        for shard in &self.shards {
            let mut guard = shard.write();
            for (key, agg) in guard.iter_mut() {
                if agg.hour_bucket < current {
                    agg.roll_hour(current);
                }
                for closed in agg.closed_hours.drain(..) {
                    rollups.push(HourlyRollup {
                        key: key.clone(),
                        hour_bucket: closed.bucket,
                        n_success: closed.n_success,
                        n_error: closed.n_error,
                        latency_samples: closed.samples,
                        requests: closed.n_success + closed.n_error,
                    });
                }
            }
        }
        rollups
    }

    /// Drop aggregates whose last signal is beyond the retention horizon.
    pub fn prune_idle(&self, older_than: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - older_than;
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, agg| agg.last_signal_at >= cutoff);
            removed += before - guard.len();
        }
        removed
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn build_snapshot(
        &self,
        key: &PolicyKey,
        agg: &EndpointAggregate,
        evaluation: bool,
    ) -> AggregateSnapshot {
        let now = Utc::now();
        let window_total = agg.window_successes + agg.window_errors;
        let window_error_rate = if window_total > 0 {
            Some(f64::from(agg.window_errors) / f64::from(window_total))
        } else {
            None
        };

        AggregateSnapshot {
            key: key.clone(),
            n_success: agg.n_success,
            n_error: agg.n_error,
            error_rate: agg.error_rate(),
            avg_latency: if agg.n_success >= 1 {
                agg.reservoir.mean()
            } else {
                None
            },
            percentiles: agg.reservoir.percentiles(),
            rpm: agg.rpm.sum(now.timestamp() as u64),
            ewma_latency: agg.ewma.value(),
            last_signal_at: agg.last_signal_at,
            window_samples: agg.window_samples,
            window_error_rate,
            insufficient_data: evaluation && agg.window_samples < MIN_WINDOW_SAMPLES,
            taken_at: now,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::from_api_key("test-tenant")
    }

    fn signal(latency_ms: f64, status: SignalStatus, at: DateTime<Utc>) -> Signal {
        Signal {
            tenant_id: tenant(),
            service_name: "svc".into(),
            endpoint: "/p".into(),
            latency_ms,
            status,
            timestamp: at,
        }
    }

    #[test]
    fn avg_latency_matches_arithmetic_mean_below_capacity() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        for i in 0..100 {
            agg.record(&signal(f64::from(i), SignalStatus::Success, now));
        }
        let key = PolicyKey::new(tenant(), "svc", "/p");
        let snap = agg.snapshot_key(&key).unwrap();
        // Mean of 0..=99 is 49.5; below reservoir capacity all samples are kept.
        assert!((snap.avg_latency.unwrap() - 49.5).abs() < 1e-9);
        assert_eq!(snap.n_success, 100);
    }

    #[test]
    fn error_rate_counts_both_statuses() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        for _ in 0..30 {
            agg.record(&signal(10.0, SignalStatus::Success, now));
        }
        for _ in 0..10 {
            agg.record(&signal(10.0, SignalStatus::Error, now));
        }
        let key = PolicyKey::new(tenant(), "svc", "/p");
        let snap = agg.snapshot_key(&key).unwrap();
        assert!((snap.error_rate.unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn avg_latency_undefined_without_success() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        for _ in 0..5 {
            agg.record(&signal(10.0, SignalStatus::Error, now));
        }
        let key = PolicyKey::new(tenant(), "svc", "/p");
        let snap = agg.snapshot_key(&key).unwrap();
        assert!(snap.avg_latency.is_none());
        assert_eq!(snap.error_rate, Some(1.0));
    }

    #[test]
    fn policy_snapshot_marks_thin_windows_and_resets() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        for _ in 0..10 {
            agg.record(&signal(10.0, SignalStatus::Success, now));
        }
        let snaps = agg.policy_snapshots();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].insufficient_data);
        assert_eq!(snaps[0].window_samples, 10);

        // Window was reset; an immediate second tick sees zero samples.
        let snaps = agg.policy_snapshots();
        assert_eq!(snaps[0].window_samples, 0);
        assert!(snaps[0].insufficient_data);
    }

    #[test]
    fn policy_snapshot_with_enough_samples_is_usable() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        for _ in 0..25 {
            agg.record(&signal(10.0, SignalStatus::Success, now));
        }
        let snaps = agg.policy_snapshots();
        assert!(!snaps[0].insufficient_data);
    }

    #[test]
    fn streaming_snapshot_does_not_close_window() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        for _ in 0..25 {
            agg.record(&signal(10.0, SignalStatus::Success, now));
        }
        let key = PolicyKey::new(tenant(), "svc", "/p");
        let _ = agg.snapshot_key(&key).unwrap();
        let snaps = agg.policy_snapshots();
        assert_eq!(snaps[0].window_samples, 25);
    }

    #[test]
    fn tenant_snapshots_are_scoped() {
        let agg = Aggregator::new(4);
        let now = Utc::now();
        agg.record(&signal(10.0, SignalStatus::Success, now));

        let other = Signal {
            tenant_id: TenantId::from_api_key("other-tenant"),
            service_name: "svc".into(),
            endpoint: "/q".into(),
            latency_ms: 5.0,
            status: SignalStatus::Success,
            timestamp: now,
        };
        agg.record(&other);

        let mine = agg.tenant_snapshots(tenant());
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].key.endpoint, "/p");
        assert_eq!(agg.tenants().len(), 2);
    }

    #[test]
    fn hourly_drain_collects_closed_hours_only() {
        let agg = Aggregator::new(4);
        let past = Utc::now() - Duration::hours(2);
        for _ in 0..5 {
            agg.record(&signal(100.0, SignalStatus::Success, past));
        }

        // The accumulating hour (2h ago) is closed relative to now.
        let rollups = agg.drain_closed_hours(Utc::now());
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].requests, 5);
        assert_eq!(rollups[0].hour_bucket, hour_bucket_of(past));

        // Draining again yields nothing.
        assert!(agg.drain_closed_hours(Utc::now()).is_empty());
    }

    #[test]
    fn signals_crossing_an_hour_boundary_split_into_rollups() {
        let agg = Aggregator::new(4);
        let older = Utc::now() - Duration::hours(3);
        let newer = Utc::now() - Duration::hours(2);
        for _ in 0..4 {
            agg.record(&signal(100.0, SignalStatus::Success, older));
        }
        for _ in 0..6 {
            agg.record(&signal(200.0, SignalStatus::Success, newer));
        }

        let mut rollups = agg.drain_closed_hours(Utc::now());
        rollups.sort_by_key(|r| r.hour_bucket);
        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[0].hour_bucket, hour_bucket_of(older));
        assert_eq!(rollups[0].requests, 4);
        assert_eq!(rollups[1].hour_bucket, hour_bucket_of(newer));
        assert_eq!(rollups[1].requests, 6);
    }

    #[test]
    fn prune_drops_idle_aggregates() {
        let agg = Aggregator::new(4);
        let stale = Utc::now() - Duration::days(10);
        agg.record(&signal(10.0, SignalStatus::Success, stale));
        assert_eq!(agg.prune_idle(Duration::days(7), Utc::now()), 1);
        let key = PolicyKey::new(tenant(), "svc", "/p");
        assert!(agg.snapshot_key(&key).is_none());
    }

    #[test]
    fn ewma_converges_toward_new_level() {
        let mut ewma = LatencyEwma::default();
        let mut at = Utc::now();
        ewma.observe(100.0, at);
        for _ in 0..20 {
            at += Duration::seconds(30);
            ewma.observe(500.0, at);
        }
        let v = ewma.value().unwrap();
        assert!(v > 450.0, "ewma = {v}");
    }
}
