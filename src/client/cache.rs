// =============================================================================
// Client policy cache — TTL on a monotonic clock, single-flight refresh
// =============================================================================
//
// One entry per endpoint. The hot path is an ArcSwap pointer load; no locks,
// no I/O. Expiry uses `Instant`, not wall time, so clock steps cannot mass-
// expire the cache, and a compare-and-swap flag gives single-flight refresh:
// however many requests observe an expired entry, exactly one fetch runs.
//
// An unreachable policy API degrades softly: the stale entry keeps serving
// past its TTL, and endpoints never fetched serve the safe default.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

/// Policy cache TTL.
pub const POLICY_TTL: Duration = Duration::from_secs(30);

/// Client-side view of one endpoint's policy. Unknown response fields are
/// ignored so the server may add fields without breaking older clients.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PolicyRecord {
    pub cache_enabled: bool,
    pub circuit_breaker: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_customer_rpm: f64,
    pub queue_deferral_rpm: f64,
    pub load_shedding_rpm: f64,
    #[serde(default)]
    pub load_shed_active: bool,
    #[serde(default)]
    pub queue_defer_active: bool,
    #[serde(default)]
    pub estimated_delay_s: u32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub version: u64,
}

impl PolicyRecord {
    /// Safe default used before any fetch succeeds: no traffic management.
    pub fn safe_default() -> Self {
        Self {
            cache_enabled: false,
            circuit_breaker: false,
            rate_limit_enabled: false,
            rate_limit_customer_rpm: 0.0,
            queue_deferral_rpm: 0.0,
            load_shedding_rpm: 0.0,
            load_shed_active: false,
            queue_defer_active: false,
            estimated_delay_s: 0,
            reasoning: "no policy yet".to_string(),
            version: 0,
        }
    }
}

/// Freshness of a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Within TTL.
    Fresh,
    /// Past TTL; a refresh should be kicked off.
    Stale,
    /// Never fetched; serving the safe default.
    Missing,
}

struct CacheEntry {
    policy: ArcSwap<PolicyRecord>,
    fetched_at: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            policy: ArcSwap::from_pointee(PolicyRecord::safe_default()),
            fetched_at: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        }
    }
}

pub struct PolicyCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    ttl: Duration,
}

impl PolicyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Current policy for an endpoint plus its freshness. Lock-free on the
    /// policy itself; the entry map takes a brief read lock.
    pub fn get(&self, endpoint: &str) -> (Arc<PolicyRecord>, CacheStatus) {
        let entry = self.entry(endpoint);
        let policy = entry.policy.load_full();
        let status = match *entry.fetched_at.lock() {
            None => CacheStatus::Missing,
            Some(at) if at.elapsed() >= self.ttl => CacheStatus::Stale,
            Some(_) => CacheStatus::Fresh,
        };
        (policy, status)
    }

    /// Claim the single-flight refresh slot for an endpoint. Returns true for
    /// exactly one caller until `store` or `abort_refresh` releases it.
    pub fn begin_refresh(&self, endpoint: &str) -> bool {
        self.entry(endpoint)
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the refresh slot without storing (fetch failed; the stale
    /// entry keeps serving).
    pub fn abort_refresh(&self, endpoint: &str) {
        self.entry(endpoint).refreshing.store(false, Ordering::Release);
    }

    /// Install a freshly fetched policy and restart its TTL.
    pub fn store(&self, endpoint: &str, policy: PolicyRecord) {
        let entry = self.entry(endpoint);
        entry.policy.store(Arc::new(policy));
        *entry.fetched_at.lock() = Some(Instant::now());
        entry.refreshing.store(false, Ordering::Release);
    }

    fn entry(&self, endpoint: &str) -> Arc<CacheEntry> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(endpoint) {
                return entry.clone();
            }
        }
        let mut entries = self.entries.write();
        entries
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
