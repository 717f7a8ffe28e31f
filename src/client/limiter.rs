// =============================================================================
// Per-customer rate limiter — 60-bucket rings keyed by customer identifier
// =============================================================================
//
// Each customer (caller IP or a configured identifier) gets its own RPM ring
// behind its own mutex, so hot customers contend only with themselves. Only
// admitted requests are recorded: a limited customer's rejected retries do
// not push their window further out.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::aggregate::RpmRing;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy)]
pub struct RateCheck {
    /// Requests admitted in the trailing minute, including this one if it
    /// was admitted.
    pub count: u32,
    pub limited: bool,
    /// Seconds until the customer frees a slot; at least 1 when limited.
    pub retry_after_s: u64,
}

pub struct CustomerLimiter {
    rings: RwLock<HashMap<String, Arc<Mutex<RpmRing>>>>,
}

impl CustomerLimiter {
    pub fn new() -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `customer` at `now_secs` against
    /// `limit_rpm`. A non-positive limit admits everything.
    pub fn check_and_record(&self, customer: &str, limit_rpm: f64, now_secs: u64) -> RateCheck {
        let ring = self.ring(customer);
        let mut ring = ring.lock();

        let count = ring.sum(now_secs);
        if limit_rpm > 0.0 && f64::from(count) >= limit_rpm {
            return RateCheck {
                count,
                limited: true,
                retry_after_s: ring.seconds_until_slot_expires(now_secs).max(1),
            };
        }

        ring.record(now_secs);
        RateCheck {
            count: count + 1,
            limited: false,
            retry_after_s: 0,
        }
    }

    /// Number of customers currently tracked.
    pub fn customers(&self) -> usize {
        self.rings.read().len()
    }

    /// Drop rings with no activity in the trailing minute.
    pub fn prune(&self, now_secs: u64) {
        self.rings.write().retain(|_, ring| ring.lock().sum(now_secs) > 0);
    }

    fn ring(&self, customer: &str) -> Arc<Mutex<RpmRing>> {
        {
            let rings = self.rings.read();
            if let Some(ring) = rings.get(customer) {
                return ring.clone();
            }
        }
        let mut rings = self.rings.write();
        rings
            .entry(customer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RpmRing::new())))
            .clone()
    }
}

impl Default for CustomerLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
