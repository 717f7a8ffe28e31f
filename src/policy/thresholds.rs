// =============================================================================
// Threshold Store — adaptive numeric inputs to the decision rules
// =============================================================================
//
// Thresholds start from conservative defaults and drift as the Explain
// collaborator suggests adjustments with enough confidence. They share the
// policy store's transactional commit path (a threshold row never exists
// without its policy row); this store owns the defaults and the read cache.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::db::Db;
use crate::types::{PolicyKey, TenantId};

/// Default cache-enablement latency threshold (ms).
pub const DEFAULT_CACHE_LATENCY_MS: f64 = 500.0;
/// Default circuit-breaker error-rate threshold.
pub const DEFAULT_CB_ERROR_RATE: f64 = 0.5;
/// Default per-customer rate limit (requests per minute).
pub const DEFAULT_CUSTOMER_RPM: f64 = 60.0;
/// Default queue-deferral RPM threshold.
pub const DEFAULT_QUEUE_DEFERRAL_RPM: f64 = 1000.0;
/// Default load-shedding RPM threshold.
pub const DEFAULT_LOAD_SHEDDING_RPM: f64 = 2000.0;

/// Adaptive thresholds for one endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Threshold {
    pub key: PolicyKey,
    pub cache_latency_ms: f64,
    pub circuit_breaker_error_rate: f64,
    pub rate_limit_customer_rpm: f64,
    pub queue_deferral_rpm: f64,
    pub load_shedding_rpm: f64,
    /// Confidence carried over from the last accepted suggestion.
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
}

impl Threshold {
    pub fn defaults(key: PolicyKey) -> Self {
        Self {
            key,
            cache_latency_ms: DEFAULT_CACHE_LATENCY_MS,
            circuit_breaker_error_rate: DEFAULT_CB_ERROR_RATE,
            rate_limit_customer_rpm: DEFAULT_CUSTOMER_RPM,
            queue_deferral_rpm: DEFAULT_QUEUE_DEFERRAL_RPM,
            load_shedding_rpm: DEFAULT_LOAD_SHEDDING_RPM,
            confidence: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Whether the numeric fields differ from `other` by at least `fraction`
    /// on any dimension. Used for the 10% adaptation gate.
    pub fn differs_by(&self, other: &Threshold, fraction: f64) -> bool {
        let apart = |a: f64, b: f64| {
            if a == b {
                return false;
            }
            let base = a.abs().max(f64::EPSILON);
            (a - b).abs() / base >= fraction
        };
        apart(self.cache_latency_ms, other.cache_latency_ms)
            || apart(
                self.circuit_breaker_error_rate,
                other.circuit_breaker_error_rate,
            )
            || apart(self.rate_limit_customer_rpm, other.rate_limit_customer_rpm)
            || apart(self.queue_deferral_rpm, other.queue_deferral_rpm)
            || apart(self.load_shedding_rpm, other.load_shedding_rpm)
    }
}

type ThresholdMap = HashMap<PolicyKey, Arc<Threshold>>;

pub struct ThresholdStore {
    cache: ArcSwap<ThresholdMap>,
    write_lock: Mutex<()>,
}

impl ThresholdStore {
    /// Load all persisted thresholds into the read cache.
    pub fn load(db: &Db) -> Result<Self> {
        let mut map = ThresholdMap::new();
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, service_name, endpoint, cache_latency_ms,
                        circuit_breaker_error_rate, rate_limit_customer_rpm,
                        queue_deferral_rpm, load_shedding_rpm, confidence, last_updated
                 FROM thresholds",
            )?;
            let rows = stmt.query_map([], |row| {
                let tenant_hex: String = row.get(0)?;
                let tenant = TenantId::from_hex(&tenant_hex)
                    .unwrap_or_else(|| TenantId::from_bytes([0u8; 16]));
                let last_updated: String = row.get(9)?;
                Ok(Threshold {
                    key: PolicyKey {
                        tenant,
                        service: row.get(1)?,
                        endpoint: row.get(2)?,
                    },
                    cache_latency_ms: row.get(3)?,
                    circuit_breaker_error_rate: row.get(4)?,
                    rate_limit_customer_rpm: row.get(5)?,
                    queue_deferral_rpm: row.get(6)?,
                    load_shedding_rpm: row.get(7)?,
                    confidence: row.get(8)?,
                    last_updated: DateTime::parse_from_rfc3339(&last_updated)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            for row in rows {
                let threshold = row?;
                map.insert(threshold.key.clone(), Arc::new(threshold));
            }
            Ok(())
        })
        .context("failed to load thresholds")?;

        info!(thresholds = map.len(), "threshold store loaded");
        Ok(Self {
            cache: ArcSwap::from_pointee(map),
            write_lock: Mutex::new(()),
        })
    }

    /// Current thresholds for a key, or defaults if none recorded.
    pub fn get_or_default(&self, key: &PolicyKey) -> Threshold {
        match self.cache.load().get(key) {
            Some(t) => (**t).clone(),
            None => Threshold::defaults(key.clone()),
        }
    }

    /// Install a threshold in the read cache. Durability is the policy
    /// store's transactional commit; this only makes the value visible.
    pub fn install(&self, threshold: Threshold) {
        let _guard = self.write_lock.lock();
        let mut map: ThresholdMap = (**self.cache.load()).clone();
        map.insert(threshold.key.clone(), Arc::new(threshold));
        self.cache.store(Arc::new(map));
    }

    /// All cached thresholds for one tenant.
    pub fn tenant_thresholds(&self, tenant: TenantId) -> Vec<Arc<Threshold>> {
        self.cache
            .load()
            .values()
            .filter(|t| t.key.tenant == tenant)
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
