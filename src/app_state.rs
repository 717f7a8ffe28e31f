// =============================================================================
// Central Application State — Helmsman control plane
// =============================================================================
//
// The single source of truth for the server. Every subsystem manages its own
// interior mutability; AppState ties them together, routes ingested signals
// to the stores, and builds the per-tenant snapshots served by the REST and
// SSE surfaces.
//
// Thread safety:
//   - Stores use sharded parking_lot locks or ArcSwap internally.
//   - Per-tenant ingress consumers preserve per-key signal order.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use crate::aggregate::{AggregateSnapshot, Aggregator};
use crate::api::sse::{publish_signal, StreamHub};
use crate::archive::ArchiveWriter;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::policy::{
    Explain, HeuristicExplainer, HttpExplainer, InsightStore, PolicyEngine, PolicyStore,
    ThresholdStore,
};
use crate::signal_store::{IngressQueues, QueueFull, SignalStore};
use crate::types::{Signal, TenantId};

/// A service with no signal for this long is reported `down`.
const DOWN_AFTER_MINS: i64 = 5;
/// Error rate above which a service is reported `degraded`.
const DEGRADED_ERROR_RATE: f64 = 0.1;

// ---------------------------------------------------------------------------
// Snapshot payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Down,
}

/// Per-endpoint health line inside a service snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub rpm: u32,
    pub avg_latency: f64,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
    pub cache_enabled: bool,
    pub circuit_breaker: bool,
    pub last_signal_at: String,
}

/// One service as the operator dashboard sees it.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub status: ServiceStatus,
    pub total_signals: u64,
    pub avg_latency: f64,
    pub error_rate: f64,
    pub endpoints: Vec<EndpointHealth>,
}

/// Tenant-wide aggregates across all services.
#[derive(Debug, Clone, Serialize)]
pub struct OverallMetrics {
    pub total_signals: u64,
    pub avg_latency: f64,
    pub error_rate: f64,
    pub total_rpm: u64,
    pub services: usize,
    pub endpoints: usize,
}

/// The full payload streamed on `/sse/services` and served on `GET /services`.
#[derive(Debug, Clone, Serialize)]
pub struct ServicesPayload {
    pub services: Vec<ServiceSnapshot>,
    pub overall: OverallMetrics,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Shared server state; wrapped in `Arc` immediately after construction.
pub struct AppState {
    pub config: ServerConfig,
    pub db: Db,
    pub signals: Arc<SignalStore>,
    pub aggregator: Arc<Aggregator>,
    pub policies: Arc<PolicyStore>,
    pub thresholds: Arc<ThresholdStore>,
    pub insights: Arc<InsightStore>,
    pub engine: Arc<PolicyEngine>,
    pub hub: Arc<StreamHub>,
    pub archive: Arc<ArchiveWriter>,
    ingress: IngressQueues,
    pub start_time: Instant,
}

impl AppState {
    /// Wire all subsystems onto an already opened database.
    pub fn new(config: ServerConfig, db: Db) -> Result<Self> {
        let signals = Arc::new(SignalStore::new(config.shard_count, config.ring_capacity));
        let aggregator = Arc::new(Aggregator::new(config.shard_count));
        let policies = Arc::new(PolicyStore::load(db.clone())?);
        let thresholds = Arc::new(ThresholdStore::load(&db)?);
        let insights = Arc::new(InsightStore::new(db.clone()));
        let archive = Arc::new(ArchiveWriter::new(db.clone()));

        let explain: Arc<dyn Explain> = match &config.explain_endpoint {
            Some(endpoint) => {
                info!(endpoint = %endpoint, "using HTTP explain collaborator");
                Arc::new(HttpExplainer::new(endpoint.clone()))
            }
            None => {
                info!("no EXPLAIN_ENDPOINT set, using heuristic explainer");
                Arc::new(HeuristicExplainer)
            }
        };

        let engine = Arc::new(PolicyEngine::new(
            policies.clone(),
            thresholds.clone(),
            insights.clone(),
            explain,
        ));

        let ingress = IngressQueues::new(config.ingress_queue_depth);

        Ok(Self {
            config,
            db,
            signals,
            aggregator,
            policies,
            thresholds,
            insights,
            engine,
            hub: Arc::new(StreamHub::new()),
            archive,
            ingress,
            start_time: Instant::now(),
        })
    }

    // -------------------------------------------------------------------------
    // Ingress
    // -------------------------------------------------------------------------

    /// Enqueue a validated batch for a tenant. Never waits on aggregation;
    /// a full queue surfaces as `QueueFull` so the handler can answer 429.
    pub fn enqueue_signals(
        self: &Arc<Self>,
        tenant: TenantId,
        batch: Vec<Signal>,
    ) -> Result<usize, QueueFull> {
        let accepted = batch.len();
        let state = self.clone();
        self.ingress.enqueue(tenant, batch, move |rx| {
            tokio::spawn(run_tenant_ingress(state, tenant, rx));
        })?;
        Ok(accepted)
    }

    // -------------------------------------------------------------------------
    // Snapshot builders
    // -------------------------------------------------------------------------

    /// Full `{services, overall}` payload for one tenant.
    pub fn services_payload(&self, tenant: TenantId) -> ServicesPayload {
        let snapshots = self.aggregator.tenant_snapshots(tenant);
        let now = Utc::now();

        // Group endpoint snapshots by service, preserving a stable order.
        let mut by_service: std::collections::BTreeMap<String, Vec<&AggregateSnapshot>> =
            std::collections::BTreeMap::new();
        for snap in &snapshots {
            by_service
                .entry(snap.key.service.clone())
                .or_default()
                .push(snap);
        }

        let mut services = Vec::with_capacity(by_service.len());
        for (service, snaps) in by_service {
            let mut total: u64 = 0;
            let mut errors: u64 = 0;
            let mut latency_weight = 0.0;
            let mut latency_n: u64 = 0;
            let mut newest_signal = None;
            let mut degraded = false;
            let mut endpoints = Vec::with_capacity(snaps.len());

            for snap in snaps {
                let n = snap.n_success + snap.n_error;
                total += n;
                errors += snap.n_error;
                if let Some(avg) = snap.avg_latency {
                    latency_weight += avg * n as f64;
                    latency_n += n;
                }
                if newest_signal.map_or(true, |t| snap.last_signal_at > t) {
                    newest_signal = Some(snap.last_signal_at);
                }

                let threshold = self.thresholds.get_or_default(&snap.key);
                let endpoint_error_rate = snap.error_rate.unwrap_or(0.0);
                if endpoint_error_rate > DEGRADED_ERROR_RATE {
                    degraded = true;
                }
                if snap
                    .avg_latency
                    .is_some_and(|avg| avg > 2.0 * threshold.cache_latency_ms)
                {
                    degraded = true;
                }

                let policy = self.policies.get_or_default(&snap.key);
                endpoints.push(EndpointHealth {
                    endpoint: snap.key.endpoint.clone(),
                    rpm: snap.rpm,
                    avg_latency: snap.avg_latency.unwrap_or(0.0),
                    error_rate: endpoint_error_rate,
                    p50: snap.percentiles.map(|p| p.p50),
                    p95: snap.percentiles.map(|p| p.p95),
                    p99: snap.percentiles.map(|p| p.p99),
                    cache_enabled: policy.cache_enabled,
                    circuit_breaker: policy.circuit_breaker,
                    last_signal_at: snap.last_signal_at.to_rfc3339(),
                });
            }

            let idle_cutoff = now - Duration::minutes(DOWN_AFTER_MINS);
            let status = match newest_signal {
                Some(t) if t < idle_cutoff => ServiceStatus::Down,
                _ if degraded => ServiceStatus::Degraded,
                _ => ServiceStatus::Healthy,
            };

            services.push(ServiceSnapshot {
                service,
                status,
                total_signals: total,
                avg_latency: if latency_n > 0 {
                    latency_weight / latency_n as f64
                } else {
                    0.0
                },
                error_rate: if total > 0 {
                    errors as f64 / total as f64
                } else {
                    0.0
                },
                endpoints,
            });
        }

        let overall = overall_of(&snapshots, &services);
        ServicesPayload { services, overall }
    }

    pub fn services_payload_json(&self, tenant: TenantId) -> String {
        serde_json::to_string(&self.services_payload(tenant))
            .unwrap_or_else(|_| "{}".to_string())
    }

    pub fn overall_payload_json(&self, tenant: TenantId) -> String {
        serde_json::to_string(&self.services_payload(tenant).overall)
            .unwrap_or_else(|_| "{}".to_string())
    }

    /// Health block for `GET /health`.
    pub fn health_payload(&self) -> serde_json::Value {
        json!({
            "status": "ok",
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "stream_subscribers": self.hub.subscriber_count(),
            "ring_dropped_total": self.signals.dropped_total(),
            "aggregator_errors_total": self.aggregator.error_count(),
            "archive_retries_total": self.archive.retry_count(),
            "explain_timeouts_total": self.engine.explain_timeouts(),
            "pending_policy_writes": self.policies.pending_len(),
            "server_time": Utc::now().to_rfc3339(),
        })
    }
}

fn overall_of(snapshots: &[AggregateSnapshot], services: &[ServiceSnapshot]) -> OverallMetrics {
    let mut total: u64 = 0;
    let mut errors: u64 = 0;
    let mut latency_weight = 0.0;
    let mut latency_n: u64 = 0;
    let mut total_rpm: u64 = 0;

    for snap in snapshots {
        let n = snap.n_success + snap.n_error;
        total += n;
        errors += snap.n_error;
        if let Some(avg) = snap.avg_latency {
            latency_weight += avg * n as f64;
            latency_n += n;
        }
        total_rpm += u64::from(snap.rpm);
    }

    OverallMetrics {
        total_signals: total,
        avg_latency: if latency_n > 0 {
            latency_weight / latency_n as f64
        } else {
            0.0
        },
        error_rate: if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        },
        total_rpm,
        services: services.len(),
        endpoints: snapshots.len(),
    }
}

/// Consume one tenant's ingress queue, feeding the ring, the aggregator and
/// the live signal stream. One task per tenant keeps per-key order intact.
async fn run_tenant_ingress(
    state: Arc<AppState>,
    tenant: TenantId,
    mut rx: mpsc::Receiver<Vec<Signal>>,
) {
    info!(tenant = %tenant, "tenant ingress consumer started");
    while let Some(batch) = rx.recv().await {
        for signal in batch {
            state.aggregator.record(&signal);
            publish_signal(&state.hub, &signal);
            state.signals.append(signal);
        }
    }
    info!(tenant = %tenant, "tenant ingress consumer stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalStatus;

    fn state() -> Arc<AppState> {
        let config = ServerConfig {
            db_url: ":memory:".into(),
            ..ServerConfig::default()
        };
        let db = Db::open(":memory:").unwrap();
        Arc::new(AppState::new(config, db).unwrap())
    }

    fn tenant() -> TenantId {
        TenantId::from_api_key("state-test")
    }

    fn signal(service: &str, endpoint: &str, latency: f64, status: SignalStatus) -> Signal {
        Signal {
            tenant_id: tenant(),
            service_name: service.into(),
            endpoint: endpoint.into(),
            latency_ms: latency,
            status,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_feeds_ring_and_aggregator() {
        let state = state();
        let batch = vec![
            signal("svc", "/p", 10.0, SignalStatus::Success),
            signal("svc", "/p", 20.0, SignalStatus::Error),
        ];
        let accepted = state.enqueue_signals(tenant(), batch).unwrap();
        assert_eq!(accepted, 2);

        // Give the consumer task a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let payload = state.services_payload(tenant());
        assert_eq!(payload.services.len(), 1);
        assert_eq!(payload.overall.total_signals, 2);
        assert!((payload.overall.error_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn services_payload_is_tenant_scoped() {
        let state = state();
        state
            .enqueue_signals(tenant(), vec![signal("svc", "/p", 10.0, SignalStatus::Success)])
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let other = TenantId::from_api_key("someone-else");
        let payload = state.services_payload(other);
        assert!(payload.services.is_empty());
        assert_eq!(payload.overall.total_signals, 0);
    }

    #[tokio::test]
    async fn high_error_rate_marks_service_degraded() {
        let state = state();
        let mut batch = Vec::new();
        for _ in 0..8 {
            batch.push(signal("svc", "/p", 10.0, SignalStatus::Success));
        }
        for _ in 0..2 {
            batch.push(signal("svc", "/p", 10.0, SignalStatus::Error));
        }
        state.enqueue_signals(tenant(), batch).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let payload = state.services_payload(tenant());
        assert_eq!(payload.services[0].status, ServiceStatus::Degraded);
    }

    #[tokio::test]
    async fn quiet_service_is_down() {
        let state = state();
        let mut old = signal("svc", "/p", 10.0, SignalStatus::Success);
        old.timestamp = Utc::now() - Duration::minutes(10);
        state.enqueue_signals(tenant(), vec![old]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let payload = state.services_payload(tenant());
        assert_eq!(payload.services[0].status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn healthy_service_is_healthy() {
        let state = state();
        let batch = (0..10)
            .map(|_| signal("svc", "/p", 10.0, SignalStatus::Success))
            .collect();
        state.enqueue_signals(tenant(), batch).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let payload = state.services_payload(tenant());
        assert_eq!(payload.services[0].status, ServiceStatus::Healthy);
        assert_eq!(payload.overall.services, 1);
        assert_eq!(payload.overall.endpoints, 1);
    }

    #[tokio::test]
    async fn health_payload_has_counters() {
        let state = state();
        let health = state.health_payload();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["ring_dropped_total"], 0);
        assert_eq!(health["pending_policy_writes"], 0);
    }
}
