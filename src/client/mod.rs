// =============================================================================
// Client Runtime — in-service traffic management driven by the control plane
// =============================================================================
//
// Host services wrap each inbound request with `middleware`, which resolves
// the endpoint's policy from a local TTL cache and computes the request
// annotation: cache, skip (circuit breaker), per-customer rate limit, load
// shedding and queue deferral, gated by the caller-declared priority. On
// completion the host calls `track`, which posts the observed signal to the
// control plane fire-and-forget.
//
// Hard rule: the request path never blocks on control-plane I/O. Policy
// fetches run in background tasks (single-flight per endpoint); signal posts
// drain through a bounded drop-oldest queue. If the control plane is away,
// stale policies keep serving and, failing that, the safe default applies.
//
// Priority matrix:
//   critical — honours only the circuit breaker.
//   high     — adds rate limiting and shedding at 1.25x the threshold.
//   medium   — honours everything at the configured thresholds.
//   low      — honours everything, shedding early at 0.8x.
// =============================================================================

pub mod cache;
pub mod limiter;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::aggregate::RpmRing;
use crate::types::{Priority, SignalStatus};

pub use cache::{CacheStatus, PolicyCache, PolicyRecord, POLICY_TTL};
pub use limiter::{CustomerLimiter, RateCheck};

/// Deadline for one background policy fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);
/// Outbound signal queue capacity (signals, not batches).
const OUTBOUND_QUEUE_CAP: usize = 4096;
/// How often the outbound worker drains the queue.
const OUTBOUND_FLUSH_MS: u64 = 100;
/// Largest signal batch per POST.
const OUTBOUND_BATCH: usize = 1000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane base URL, e.g. `http://helmsman:8080`.
    pub base_url: String,
    /// API key; resolved server-side to the tenant.
    pub api_key: String,
    /// Name of the host service, attached to every tracked signal.
    pub service_name: String,
    /// Policy cache TTL.
    pub cache_ttl: Duration,
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            service_name: service_name.into(),
            cache_ttl: POLICY_TTL,
        }
    }
}

// ---------------------------------------------------------------------------
// Request annotation
// ---------------------------------------------------------------------------

/// Per-request verdicts attached before dispatch. The host service reads
/// these to short-circuit, cache, queue or shed the request.
#[derive(Debug, Clone)]
pub struct RequestAnnotation {
    pub should_cache: bool,
    /// Circuit breaker open: skip the handler entirely.
    pub should_skip: bool,
    pub is_rate_limited_customer: bool,
    pub is_load_shedding: bool,
    pub is_queue_deferral: bool,
    /// Suggested deferral delay in seconds.
    pub estimated_delay: u32,
    /// Seconds a rate-limited customer should wait before retrying.
    pub retry_after: u64,
    pub customer_identifier: String,
    pub priority_required: Priority,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct TrackedSignal {
    endpoint: String,
    latency_ms: f64,
    status: SignalStatus,
}

pub struct ControlPlaneClient {
    config: ClientConfig,
    http: reqwest::Client,
    cache: Arc<PolicyCache>,
    limiter: CustomerLimiter,
    /// Locally observed per-endpoint traffic, for priority-scaled shed and
    /// deferral decisions.
    endpoint_rpm: Mutex<std::collections::HashMap<String, Arc<Mutex<RpmRing>>>>,
    outbound: Mutex<VecDeque<TrackedSignal>>,
    outbound_notify: Arc<Notify>,
    dropped_signals: AtomicU64,
}

impl ControlPlaneClient {
    /// Build the client and start its outbound worker (when a Tokio runtime
    /// is present; without one, tracking degrades to drop with a warning).
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            cache: Arc::new(PolicyCache::new(config.cache_ttl)),
            limiter: CustomerLimiter::new(),
            endpoint_rpm: Mutex::new(std::collections::HashMap::new()),
            outbound: Mutex::new(VecDeque::with_capacity(OUTBOUND_QUEUE_CAP)),
            outbound_notify: Arc::new(Notify::new()),
            dropped_signals: AtomicU64::new(0),
            config,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let worker = client.clone();
            handle.spawn(async move { worker.run_outbound_worker().await });
        }

        client
    }

    /// Signals dropped due to outbound overflow or post failure.
    pub fn dropped_signals(&self) -> u64 {
        self.dropped_signals.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Middleware
    // -------------------------------------------------------------------------

    /// Annotate one inbound request. Pure in-memory: resolves the cached
    /// policy, counts the request, and applies the priority matrix.
    pub fn middleware(
        &self,
        endpoint: &str,
        priority: Priority,
        customer: &str,
    ) -> RequestAnnotation {
        let policy = self.resolve_policy(endpoint);
        let now_secs = Utc::now().timestamp() as u64;

        let endpoint_rpm = {
            let ring = self.endpoint_ring(endpoint);
            let mut ring = ring.lock();
            ring.record(now_secs);
            ring.sum(now_secs)
        };

        // Circuit breaker applies to every priority, critical included.
        let should_skip = policy.circuit_breaker;

        // Per-customer rate limit: everything above critical.
        let (is_rate_limited_customer, retry_after) = if priority.rate_limited()
            && policy.rate_limit_enabled
        {
            let check =
                self.limiter
                    .check_and_record(customer, policy.rate_limit_customer_rpm, now_secs);
            (check.limited, check.retry_after_s)
        } else {
            (false, 0)
        };

        // Load shedding at the priority-scaled threshold. The server-side
        // flag was computed at 1.0x, so it only binds priorities whose
        // effective threshold is at or below that.
        let rpm = f64::from(endpoint_rpm);
        let is_load_shedding = match priority.shed_factor() {
            Some(factor) if policy.load_shedding_rpm > 0.0 => {
                (policy.load_shed_active && factor <= 1.0)
                    || rpm >= factor * policy.load_shedding_rpm
            }
            _ => false,
        };

        // Queue deferral between the two thresholds, unless already shedding.
        let (is_queue_deferral, estimated_delay) = if priority.defers()
            && !is_load_shedding
            && policy.queue_deferral_rpm > 0.0
        {
            if rpm >= policy.queue_deferral_rpm {
                let over = rpm - policy.queue_deferral_rpm;
                let delay = (over / policy.queue_deferral_rpm * 5.0).ceil().max(0.0) as u32;
                (true, delay)
            } else if policy.queue_defer_active {
                (true, policy.estimated_delay_s)
            } else {
                (false, 0)
            }
        } else {
            (false, 0)
        };

        // Caching applies to priorities that honour the full matrix.
        let should_cache = priority != Priority::Critical && policy.cache_enabled;

        let reason = if should_skip {
            "circuit breaker open".to_string()
        } else if is_rate_limited_customer {
            format!("customer over {:.0} rpm limit", policy.rate_limit_customer_rpm)
        } else if is_load_shedding {
            format!("shedding at {endpoint_rpm} rpm ({priority} priority)")
        } else if is_queue_deferral {
            format!("deferring at {endpoint_rpm} rpm")
        } else {
            "allowed".to_string()
        };

        RequestAnnotation {
            should_cache,
            should_skip,
            is_rate_limited_customer,
            is_load_shedding,
            is_queue_deferral,
            estimated_delay,
            retry_after,
            customer_identifier: customer.to_string(),
            priority_required: priority,
            reason,
        }
    }

    // -------------------------------------------------------------------------
    // Tracking
    // -------------------------------------------------------------------------

    /// Record one completed request. Fire-and-forget: the signal joins a
    /// bounded queue (drop-oldest on overflow) drained by the worker.
    pub fn track(&self, endpoint: &str, latency_ms: f64, status: SignalStatus) {
        {
            let mut queue = self.outbound.lock();
            if queue.len() >= OUTBOUND_QUEUE_CAP {
                queue.pop_front();
                self.dropped_signals.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(TrackedSignal {
                endpoint: endpoint.to_string(),
                latency_ms,
                status,
            });
        }
        self.outbound_notify.notify_one();
    }

    // -------------------------------------------------------------------------
    // Policy resolution
    // -------------------------------------------------------------------------

    /// Cached policy for an endpoint; spawns a single-flight background
    /// refresh when the entry is stale or missing. Never blocks.
    fn resolve_policy(&self, endpoint: &str) -> Arc<PolicyRecord> {
        let (policy, status) = self.cache.get(endpoint);
        if status != CacheStatus::Fresh && self.cache.begin_refresh(endpoint) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cache = self.cache.clone();
                let http = self.http.clone();
                let url = format!(
                    "{}/config/{}{}",
                    self.config.base_url, self.config.service_name, endpoint
                );
                let api_key = self.config.api_key.clone();
                let endpoint = endpoint.to_string();
                handle.spawn(async move {
                    match fetch_policy(&http, &url, &api_key).await {
                        Ok(fresh) => cache.store(&endpoint, fresh),
                        Err(err) => {
                            debug!(endpoint = %endpoint, error = %err, "policy refresh failed, serving cached");
                            cache.abort_refresh(&endpoint);
                        }
                    }
                });
            } else {
                self.cache.abort_refresh(endpoint);
            }
        }
        policy
    }

    fn endpoint_ring(&self, endpoint: &str) -> Arc<Mutex<RpmRing>> {
        let mut rings = self.endpoint_rpm.lock();
        rings
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RpmRing::new())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Outbound worker
    // -------------------------------------------------------------------------

    async fn run_outbound_worker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(OUTBOUND_FLUSH_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.outbound_notify.notified() => {}
            }

            let batch: Vec<TrackedSignal> = {
                let mut queue = self.outbound.lock();
                let take = queue.len().min(OUTBOUND_BATCH);
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                continue;
            }

            let body = json!({
                "signals": batch
                    .iter()
                    .map(|s| json!({
                        "service_name": self.config.service_name,
                        "endpoint": s.endpoint,
                        "latency_ms": s.latency_ms,
                        "status": s.status,
                    }))
                    .collect::<Vec<_>>()
            });

            // One retry, then the batch is dropped.
            let mut sent = false;
            for _ in 0..2 {
                match self
                    .http
                    .post(format!("{}/signals", self.config.base_url))
                    .bearer_auth(&self.config.api_key)
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        sent = true;
                        break;
                    }
                    Ok(response) => {
                        debug!(status = %response.status(), "signal post rejected");
                    }
                    Err(err) => {
                        debug!(error = %err, "signal post failed");
                    }
                }
            }
            if !sent {
                self.dropped_signals
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                warn!(dropped = batch.len(), "signal batch dropped after retry");
            }
        }
    }
}

/// One policy fetch against the control plane.
async fn fetch_policy(
    http: &reqwest::Client,
    url: &str,
    api_key: &str,
) -> anyhow::Result<PolicyRecord> {
    let response = http.get(url).bearer_auth(api_key).send().await?;
    let response = response.error_for_status()?;
    Ok(response.json::<PolicyRecord>().await?)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Arc<ControlPlaneClient> {
        ControlPlaneClient::new(ClientConfig::new(
            "http://127.0.0.1:1",
            "hk_test_0123456789",
            "svc",
        ))
    }

    /// Seed a policy so gating logic can run without a live control plane.
    fn seed(client: &ControlPlaneClient, endpoint: &str, policy: PolicyRecord) {
        client.cache.store(endpoint, policy);
    }

    fn managed_policy() -> PolicyRecord {
        PolicyRecord {
            cache_enabled: true,
            circuit_breaker: false,
            rate_limit_enabled: true,
            rate_limit_customer_rpm: 10.0,
            queue_deferral_rpm: 1000.0,
            load_shedding_rpm: 2000.0,
            load_shed_active: false,
            queue_defer_active: false,
            estimated_delay_s: 0,
            reasoning: "managed".to_string(),
            version: 3,
        }
    }

    #[tokio::test]
    async fn unknown_endpoint_uses_safe_default() {
        let client = client();
        let annotation = client.middleware("/new", Priority::Medium, "10.0.0.1");
        assert!(!annotation.should_cache);
        assert!(!annotation.should_skip);
        assert!(!annotation.is_rate_limited_customer);
        assert!(!annotation.is_load_shedding);
        assert_eq!(annotation.reason, "allowed");
    }

    #[tokio::test]
    async fn circuit_breaker_applies_to_every_priority() {
        let client = client();
        seed(
            &client,
            "/p",
            PolicyRecord {
                circuit_breaker: true,
                ..managed_policy()
            },
        );

        for priority in [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ] {
            let annotation = client.middleware("/p", priority, "10.0.0.1");
            assert!(annotation.should_skip, "priority {priority}");
        }
    }

    #[tokio::test]
    async fn rate_limit_first_ten_pass_then_retry_after() {
        let client = client();
        seed(&client, "/p", managed_policy());

        let mut annotations = Vec::new();
        for _ in 0..15 {
            annotations.push(client.middleware("/p", Priority::Medium, "10.9.8.7"));
        }

        for annotation in &annotations[..10] {
            assert!(!annotation.is_rate_limited_customer);
        }
        for annotation in &annotations[10..] {
            assert!(annotation.is_rate_limited_customer);
            assert!(annotation.retry_after >= 1);
        }
    }

    #[tokio::test]
    async fn critical_bypasses_rate_limit_and_shedding() {
        let client = client();
        seed(
            &client,
            "/p",
            PolicyRecord {
                rate_limit_customer_rpm: 1.0,
                load_shed_active: true,
                ..managed_policy()
            },
        );

        for _ in 0..5 {
            let annotation = client.middleware("/p", Priority::Critical, "10.0.0.1");
            assert!(!annotation.is_rate_limited_customer);
            assert!(!annotation.is_load_shedding);
            assert!(!annotation.is_queue_deferral);
            assert!(!annotation.should_cache);
        }
    }

    #[tokio::test]
    async fn low_priority_sheds_before_medium() {
        let client = client();
        // Shedding threshold 2000; drive local traffic to ~1800 rpm (0.9x).
        seed(&client, "/p", managed_policy());
        for _ in 0..1799 {
            client.middleware("/p", Priority::Critical, "seed");
        }

        // low sheds at 0.8x = 1600: 1800 >= 1600.
        let low = client.middleware("/p", Priority::Low, "10.0.0.1");
        assert!(low.is_load_shedding);

        // medium sheds at 1.0x = 2000: 1800 < 2000, defers instead.
        let medium = client.middleware("/p", Priority::Medium, "10.0.0.2");
        assert!(!medium.is_load_shedding);
        assert!(medium.is_queue_deferral);

        // high sheds at 1.25x = 2500 and never defers.
        let high = client.middleware("/p", Priority::High, "10.0.0.3");
        assert!(!high.is_load_shedding);
        assert!(!high.is_queue_deferral);
    }

    #[tokio::test]
    async fn deferral_delay_grows_with_overload() {
        let client = client();
        seed(&client, "/p", managed_policy());
        // Drive to ~1400 rpm: ceil((1400 - 1000) / 1000 * 5) = 2.
        for _ in 0..1399 {
            client.middleware("/p", Priority::Critical, "seed");
        }
        let annotation = client.middleware("/p", Priority::Medium, "10.0.0.1");
        assert!(annotation.is_queue_deferral);
        assert_eq!(annotation.estimated_delay, 2);
    }

    #[tokio::test]
    async fn server_side_shed_flag_is_honoured() {
        let client = client();
        seed(
            &client,
            "/p",
            PolicyRecord {
                load_shed_active: true,
                ..managed_policy()
            },
        );
        let annotation = client.middleware("/p", Priority::Medium, "10.0.0.1");
        assert!(annotation.is_load_shedding);
        // Critical still passes.
        let critical = client.middleware("/p", Priority::Critical, "10.0.0.1");
        assert!(!critical.is_load_shedding);
    }

    #[tokio::test]
    async fn cache_decision_follows_policy() {
        let client = client();
        seed(&client, "/p", managed_policy());
        let annotation = client.middleware("/p", Priority::Medium, "10.0.0.1");
        assert!(annotation.should_cache);
        assert!(!annotation.should_skip);
    }

    #[tokio::test]
    async fn track_queues_and_overflow_drops_oldest() {
        let client = client();
        for _ in 0..(OUTBOUND_QUEUE_CAP + 5) {
            client.track("/p", 12.0, SignalStatus::Success);
        }
        assert_eq!(client.dropped_signals(), 5);
    }

    #[tokio::test]
    async fn annotation_carries_customer_and_priority() {
        let client = client();
        let annotation = client.middleware("/p", Priority::High, "customer-42");
        assert_eq!(annotation.customer_identifier, "customer-42");
        assert_eq!(annotation.priority_required, Priority::High);
    }
}
