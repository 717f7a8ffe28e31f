// =============================================================================
// Policy Store — versioned per-endpoint policies with a lock-free read cache
// =============================================================================
//
// The policy lookup is the hottest read path in the system (the client
// library polls it on every request), so reads never touch SQLite: the full
// policy map lives behind an ArcSwap and `get` is a pointer load plus a hash
// lookup. Writers install a fresh copy-on-write map after each durable
// commit.
//
// Policy and threshold rows for one key commit in a single transaction; a
// commit that keeps failing after backoff parks the records in a bounded
// pending buffer (read-only mode for that key) and the previously committed
// policy keeps being served.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::params;
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::db::Db;
use crate::policy::thresholds::Threshold;
use crate::types::{PolicyKey, TenantId};

/// Commit attempts before a key is parked in the pending buffer.
const COMMIT_ATTEMPTS: u32 = 3;
/// Base backoff between commit attempts.
const COMMIT_BACKOFF_MS: u64 = 100;
/// Maximum records the pending buffer may hold.
const PENDING_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Policy record
// ---------------------------------------------------------------------------

/// The effective traffic-management decisions for one endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Policy {
    #[serde(skip)]
    pub key: PolicyKey,
    pub cache_enabled: bool,
    pub circuit_breaker: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_customer_rpm: f64,
    pub queue_deferral_rpm: f64,
    pub load_shedding_rpm: f64,
    /// Positive iff `cache_enabled`.
    pub cache_latency_ms: f64,
    pub circuit_breaker_error_rate: f64,
    pub load_shed_active: bool,
    pub queue_defer_active: bool,
    pub estimated_delay_s: u32,
    /// Free text, capped at 2 KB, never parsed server-side.
    pub reasoning: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// The safe default served for keys with no evaluated policy yet.
    pub fn safe_default(key: PolicyKey) -> Self {
        Self {
            key,
            cache_enabled: false,
            circuit_breaker: false,
            rate_limit_enabled: false,
            rate_limit_customer_rpm: 0.0,
            queue_deferral_rpm: 0.0,
            load_shedding_rpm: 0.0,
            cache_latency_ms: 0.0,
            circuit_breaker_error_rate: 0.0,
            load_shed_active: false,
            queue_defer_active: false,
            estimated_delay_s: 0,
            reasoning: "no policy yet".to_string(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether two policies carry the same decisions. `reasoning`, `version`
    /// and `updated_at` are presentation fields and do not participate:
    /// identical decisions must never bump the version.
    pub fn decisions_equal(&self, other: &Policy) -> bool {
        self.cache_enabled == other.cache_enabled
            && self.circuit_breaker == other.circuit_breaker
            && self.rate_limit_enabled == other.rate_limit_enabled
            && self.rate_limit_customer_rpm == other.rate_limit_customer_rpm
            && self.queue_deferral_rpm == other.queue_deferral_rpm
            && self.load_shedding_rpm == other.load_shedding_rpm
            && self.cache_latency_ms == other.cache_latency_ms
            && self.circuit_breaker_error_rate == other.circuit_breaker_error_rate
            && self.load_shed_active == other.load_shed_active
            && self.queue_defer_active == other.queue_defer_active
            && self.estimated_delay_s == other.estimated_delay_s
    }
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

type PolicyMap = HashMap<PolicyKey, Arc<Policy>>;

pub struct PolicyStore {
    db: Db,
    cache: ArcSwap<PolicyMap>,
    /// Serialises copy-on-write cache installs and pending-buffer access.
    write_lock: Mutex<()>,
    pending: Mutex<VecDeque<(Policy, Threshold)>>,
}

impl PolicyStore {
    /// Load all persisted policies into the read cache.
    pub fn load(db: Db) -> Result<Self> {
        let mut map = PolicyMap::new();
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, service_name, endpoint, version, cache_enabled,
                        circuit_breaker, rate_limit_enabled, rate_limit_customer_rpm,
                        queue_deferral_rpm, load_shedding_rpm, cache_latency_ms,
                        circuit_breaker_error_rate, load_shed_active, queue_defer_active,
                        estimated_delay_s, reasoning, updated_at
                 FROM policies",
            )?;
            let rows = stmt.query_map([], row_to_policy)?;
            for row in rows {
                let policy = row?;
                map.insert(policy.key.clone(), Arc::new(policy));
            }
            Ok(())
        })
        .context("failed to load policies")?;

        info!(policies = map.len(), "policy store loaded");
        Ok(Self {
            db,
            cache: ArcSwap::from_pointee(map),
            write_lock: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Current policy for a key. Lock-free; may serve a version slightly
    /// behind the latest committed one.
    pub fn get(&self, key: &PolicyKey) -> Option<Arc<Policy>> {
        self.cache.load().get(key).cloned()
    }

    /// Policy for a key or the safe default if none exists.
    pub fn get_or_default(&self, key: &PolicyKey) -> Arc<Policy> {
        self.get(key)
            .unwrap_or_else(|| Arc::new(Policy::safe_default(key.clone())))
    }

    /// All cached policies for one tenant.
    pub fn tenant_policies(&self, tenant: TenantId) -> Vec<Arc<Policy>> {
        self.cache
            .load()
            .values()
            .filter(|p| p.key.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Number of keys currently parked in read-only mode.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Durably commit a policy and its threshold in one transaction, then
    /// install the policy in the read cache. Retries with backoff; after
    /// exhaustion the records are parked and the cached policy keeps serving.
    pub async fn commit(&self, policy: Policy, threshold: Threshold) -> Result<()> {
        let mut backoff = COMMIT_BACKOFF_MS;
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self.try_commit(&policy, &threshold) {
                Ok(()) => {
                    self.install(policy);
                    return Ok(());
                }
                Err(err) if attempt < COMMIT_ATTEMPTS => {
                    warn!(
                        key = %policy.key,
                        attempt,
                        error = %err,
                        "policy commit failed, retrying"
                    );
                    sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 3).min(30_000);
                }
                Err(err) => {
                    self.park(policy, threshold);
                    return Err(err);
                }
            }
        }
        unreachable!("commit loop always returns");
    }

    /// Retry parked commits. Called by the evaluation loop before each round.
    pub async fn flush_pending(&self) {
        loop {
            let next = self.pending.lock().pop_front();
            let Some((policy, threshold)) = next else {
                return;
            };
            match self.try_commit(&policy, &threshold) {
                Ok(()) => {
                    info!(key = %policy.key, "parked policy committed");
                    self.install(policy);
                }
                Err(err) => {
                    // Still failing: put it back and stop for this round.
                    warn!(key = %policy.key, error = %err, "parked policy still failing");
                    self.pending.lock().push_front((policy, threshold));
                    return;
                }
            }
        }
    }

    fn park(&self, policy: Policy, threshold: Threshold) {
        let mut pending = self.pending.lock();
        if pending.len() >= PENDING_CAPACITY {
            pending.pop_front();
        }
        warn!(
            key = %policy.key,
            pending = pending.len() + 1,
            "database unavailable, key entering read-only mode"
        );
        pending.push_back((policy, threshold));
    }

    fn install(&self, policy: Policy) {
        let _guard = self.write_lock.lock();
        let mut map: PolicyMap = (**self.cache.load()).clone();
        map.insert(policy.key.clone(), Arc::new(policy));
        self.cache.store(Arc::new(map));
    }

    fn try_commit(&self, policy: &Policy, threshold: &Threshold) -> Result<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO policies
                 (tenant_id, service_name, endpoint, version, cache_enabled,
                  circuit_breaker, rate_limit_enabled, rate_limit_customer_rpm,
                  queue_deferral_rpm, load_shedding_rpm, cache_latency_ms,
                  circuit_breaker_error_rate, load_shed_active, queue_defer_active,
                  estimated_delay_s, reasoning, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17)",
                params![
                    policy.key.tenant.to_string(),
                    policy.key.service,
                    policy.key.endpoint,
                    policy.version as i64,
                    policy.cache_enabled,
                    policy.circuit_breaker,
                    policy.rate_limit_enabled,
                    policy.rate_limit_customer_rpm,
                    policy.queue_deferral_rpm,
                    policy.load_shedding_rpm,
                    policy.cache_latency_ms,
                    policy.circuit_breaker_error_rate,
                    policy.load_shed_active,
                    policy.queue_defer_active,
                    i64::from(policy.estimated_delay_s),
                    policy.reasoning,
                    policy.updated_at.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO thresholds
                 (tenant_id, service_name, endpoint, cache_latency_ms,
                  circuit_breaker_error_rate, rate_limit_customer_rpm,
                  queue_deferral_rpm, load_shedding_rpm, confidence, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    threshold.key.tenant.to_string(),
                    threshold.key.service,
                    threshold.key.endpoint,
                    threshold.cache_latency_ms,
                    threshold.circuit_breaker_error_rate,
                    threshold.rate_limit_customer_rpm,
                    threshold.queue_deferral_rpm,
                    threshold.load_shedding_rpm,
                    threshold.confidence,
                    threshold.last_updated.to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

fn row_to_policy(row: &rusqlite::Row<'_>) -> rusqlite::Result<Policy> {
    let tenant_hex: String = row.get(0)?;
    let tenant = TenantId::from_hex(&tenant_hex).unwrap_or_else(|| TenantId::from_bytes([0u8; 16]));
    let updated_at: String = row.get(16)?;
    Ok(Policy {
        key: PolicyKey {
            tenant,
            service: row.get(1)?,
            endpoint: row.get(2)?,
        },
        version: row.get::<_, i64>(3)? as u64,
        cache_enabled: row.get(4)?,
        circuit_breaker: row.get(5)?,
        rate_limit_enabled: row.get(6)?,
        rate_limit_customer_rpm: row.get(7)?,
        queue_deferral_rpm: row.get(8)?,
        load_shedding_rpm: row.get(9)?,
        cache_latency_ms: row.get(10)?,
        circuit_breaker_error_rate: row.get(11)?,
        load_shed_active: row.get(12)?,
        queue_defer_active: row.get(13)?,
        estimated_delay_s: row.get::<_, i64>(14)? as u32,
        reasoning: row.get(15)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PolicyKey {
        PolicyKey::new(TenantId::from_api_key("ps-test"), "svc", "/p")
    }

    fn sample_policy(version: u64) -> Policy {
        Policy {
            key: key(),
            cache_enabled: true,
            circuit_breaker: false,
            rate_limit_enabled: true,
            rate_limit_customer_rpm: 60.0,
            queue_deferral_rpm: 1000.0,
            load_shedding_rpm: 2000.0,
            cache_latency_ms: 500.0,
            circuit_breaker_error_rate: 0.5,
            load_shed_active: false,
            queue_defer_active: false,
            estimated_delay_s: 0,
            reasoning: "avg latency above cache threshold".into(),
            version,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_then_get_roundtrip() {
        let db = Db::open(":memory:").unwrap();
        let store = PolicyStore::load(db).unwrap();

        store
            .commit(sample_policy(1), Threshold::defaults(key()))
            .await
            .unwrap();

        let got = store.get(&key()).unwrap();
        assert_eq!(got.version, 1);
        assert!(got.cache_enabled);
        assert_eq!(got.cache_latency_ms, 500.0);
    }

    #[tokio::test]
    async fn survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.db");
        let path = path.to_str().unwrap();

        {
            let store = PolicyStore::load(Db::open(path).unwrap()).unwrap();
            store
                .commit(sample_policy(3), Threshold::defaults(key()))
                .await
                .unwrap();
        }

        let store = PolicyStore::load(Db::open(path).unwrap()).unwrap();
        let got = store.get(&key()).unwrap();
        assert_eq!(got.version, 3);
    }

    #[test]
    fn safe_default_shape() {
        let p = Policy::safe_default(key());
        assert!(!p.cache_enabled);
        assert!(!p.circuit_breaker);
        assert!(!p.rate_limit_enabled);
        assert_eq!(p.reasoning, "no policy yet");
        assert_eq!(p.version, 0);
    }

    #[test]
    fn decisions_equal_ignores_presentation_fields() {
        let a = sample_policy(1);
        let mut b = sample_policy(9);
        b.reasoning = "different words".into();
        b.updated_at = Utc::now();
        assert!(a.decisions_equal(&b));

        b.circuit_breaker = true;
        assert!(!a.decisions_equal(&b));
    }

    #[test]
    fn get_or_default_for_unknown_key() {
        let db = Db::open(":memory:").unwrap();
        let store = PolicyStore::load(db).unwrap();
        let p = store.get_or_default(&key());
        assert_eq!(p.reasoning, "no policy yet");
    }

    #[tokio::test]
    async fn tenant_policies_are_scoped() {
        let db = Db::open(":memory:").unwrap();
        let store = PolicyStore::load(db).unwrap();
        store
            .commit(sample_policy(1), Threshold::defaults(key()))
            .await
            .unwrap();

        let other = TenantId::from_api_key("someone-else");
        assert_eq!(store.tenant_policies(key().tenant).len(), 1);
        assert!(store.tenant_policies(other).is_empty());
    }
}
