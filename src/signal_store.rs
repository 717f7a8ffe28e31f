// =============================================================================
// Signal Store — bounded recent ring of raw signals per endpoint
// =============================================================================
//
// The recent ring keeps raw signals for live queries (signal feed, short
// analytics windows). It is bounded two ways: a per-endpoint entry cap and
// the retention horizon, whichever is tighter. Overflow evicts oldest-first
// and bumps a per-key dropped counter that the health endpoint exposes.
//
// Long-term history survives only as hourly aggregates (see archive.rs); the
// ring stays authoritative for anything inside its horizon.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::{PolicyKey, Signal, TenantId};

// ---------------------------------------------------------------------------
// Recent ring
// ---------------------------------------------------------------------------

struct Ring {
    buf: VecDeque<Signal>,
    dropped: u64,
}

/// Thread-safe store of the most recent signals per endpoint key.
pub struct SignalStore {
    shards: Vec<RwLock<HashMap<PolicyKey, Ring>>>,
    per_key_capacity: usize,
    /// Total ring evictions caused by the entry cap (not by age-out).
    dropped_total: AtomicU64,
}

impl SignalStore {
    pub fn new(shard_count: usize, per_key_capacity: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            per_key_capacity,
            dropped_total: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &PolicyKey) -> &RwLock<HashMap<PolicyKey, Ring>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Append one signal to its key's ring. O(1); evicts oldest on overflow.
    pub fn append(&self, signal: Signal) {
        let key = signal.key();
        let mut shard = self.shard(&key).write();
        let ring = shard.entry(key).or_insert_with(|| Ring {
            buf: VecDeque::with_capacity(64),
            dropped: 0,
        });

        ring.buf.push_back(signal);
        while ring.buf.len() > self.per_key_capacity {
            ring.buf.pop_front();
            ring.dropped += 1;
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The most recent `n` signals for a key, newest first.
    pub fn recent_slice(&self, key: &PolicyKey, n: usize) -> Vec<Signal> {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(ring) => ring.buf.iter().rev().take(n).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// All ring signals for a key at or after `since`, oldest first.
    pub fn slice_since(&self, key: &PolicyKey, since: DateTime<Utc>) -> Vec<Signal> {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(ring) => ring
                .buf
                .iter()
                .filter(|s| s.timestamp >= since)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Timestamp of the oldest retained signal for a key, if any. Analytics
    /// uses this to decide whether a query window fits the ring horizon.
    pub fn oldest_timestamp(&self, key: &PolicyKey) -> Option<DateTime<Utc>> {
        let shard = self.shard(key).read();
        shard.get(key).and_then(|ring| ring.buf.front().map(|s| s.timestamp))
    }

    /// Every key a tenant currently has ring data for.
    pub fn tenant_keys(&self, tenant: TenantId) -> Vec<PolicyKey> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            keys.extend(guard.keys().filter(|k| k.tenant == tenant).cloned());
        }
        keys
    }

    /// Overflow evictions for one key.
    pub fn dropped(&self, key: &PolicyKey) -> u64 {
        let shard = self.shard(key).read();
        shard.get(key).map_or(0, |ring| ring.dropped)
    }

    /// Overflow evictions across all keys.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Age out signals older than the retention horizon. Returns how many
    /// were removed. Rings drained to empty are dropped entirely.
    pub fn prune(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - retention;
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            for ring in guard.values_mut() {
                while ring
                    .buf
                    .front()
                    .is_some_and(|s| s.timestamp < cutoff)
                {
                    ring.buf.pop_front();
                    removed += 1;
                }
            }
            guard.retain(|_, ring| !ring.buf.is_empty());
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// Per-tenant ingress queues
// ---------------------------------------------------------------------------

/// Rejection returned when a tenant's ingress queue is full. Carries the
/// depth so the API layer can derive a proportional Retry-After.
#[derive(Debug)]
pub struct QueueFull {
    pub depth: usize,
    pub capacity: usize,
}

impl QueueFull {
    /// Suggested client back-off, proportional to how deep the queue is.
    pub fn retry_after_ms(&self) -> u64 {
        let ratio = self.depth as f64 / self.capacity.max(1) as f64;
        (ratio * 5_000.0).clamp(100.0, 30_000.0) as u64
    }
}

struct TenantQueue {
    tx: mpsc::Sender<Vec<Signal>>,
}

/// Bounded per-tenant queues decoupling HTTP ingress from aggregation.
///
/// The HTTP handler only ever `try_send`s — it never waits on aggregation.
/// Each tenant gets a dedicated consumer task (spawned by the owner of the
/// receiving side) so per-key ordering within a tenant is preserved.
pub struct IngressQueues {
    queues: RwLock<HashMap<TenantId, TenantQueue>>,
    capacity: usize,
}

impl IngressQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Enqueue a batch for `tenant`. On first use for a tenant, `spawn` is
    /// called with the receiving end so the caller can start the consumer.
    pub fn enqueue(
        &self,
        tenant: TenantId,
        batch: Vec<Signal>,
        spawn: impl FnOnce(mpsc::Receiver<Vec<Signal>>),
    ) -> Result<(), QueueFull> {
        // Fast path: queue already exists.
        {
            let queues = self.queues.read();
            if let Some(q) = queues.get(&tenant) {
                return self.try_send(q, batch);
            }
        }

        let mut queues = self.queues.write();
        // Double-check: another request may have created the queue meanwhile.
        if let Some(q) = queues.get(&tenant) {
            return self.try_send(q, batch);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        spawn(rx);
        let q = TenantQueue { tx };
        let result = self.try_send(&q, batch);
        queues.insert(tenant, q);
        result
    }

    fn try_send(&self, q: &TenantQueue, batch: Vec<Signal>) -> Result<(), QueueFull> {
        q.tx.try_send(batch).map_err(|_| QueueFull {
            depth: self.capacity - q.tx.capacity(),
            capacity: self.capacity,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
