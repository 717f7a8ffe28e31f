// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public endpoints (health) require no authentication. Everything else
// resolves the caller's tenant from a bearer API key or session cookie via
// the `TenantAuth` extractor.
//
// Deadlines: the policy lookup answers from the in-process cache and carries
// a 2 s ceiling; ingress gets 5 s; the SSE streams are unbounded by design.
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::analytics::{self, MAX_QUERY_DAYS};
use crate::api::auth::TenantAuth;
use crate::api::sse;
use crate::app_state::AppState;
use crate::error::ApiError;
use crate::policy::{Policy, Threshold};
use crate::types::{
    PolicyKey, Signal, SignalStatus, MAX_BATCH_SIZE, MAX_ENDPOINT_LEN, MAX_LATENCY_MS,
    MAX_SERVICE_NAME_LEN,
};

/// Deadline for the synchronous policy lookup.
const POLICY_DEADLINE: Duration = Duration::from_secs(2);
/// Deadline for signal ingress.
const INGRESS_DEADLINE: Duration = Duration::from_secs(5);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS, tracing and per-surface deadlines.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Client runtime surface ──────────────────────────────────
        .route(
            "/signals",
            post(ingest_signals).layer(TimeoutLayer::new(INGRESS_DEADLINE)),
        )
        .route(
            "/config/:service/*endpoint",
            get(get_policy).layer(TimeoutLayer::new(POLICY_DEADLINE)),
        )
        // ── Operator surface ────────────────────────────────────────
        .route("/services", get(get_services))
        .route("/ai/thresholds", get(get_thresholds))
        .route("/ai/insights", get(get_insights))
        .route("/analytics/traffic-patterns", get(get_traffic_patterns))
        .route("/analytics/percentiles", get(get_percentiles))
        // ── SSE streams (unbounded) ─────────────────────────────────
        .route("/sse/services", get(sse::sse_services))
        .route("/sse/signals", get(sse::sse_signals))
        .route("/sse/overall", get(sse::sse_overall))
        // ── Middleware & state ──────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_payload())
}

// =============================================================================
// Signal ingress
// =============================================================================

/// Unknown fields are rejected; `tenant_id` and `timestamp` are accepted but
/// ignored — the server derives both itself.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IngressBody {
    signals: Vec<IngressSignal>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IngressSignal {
    service_name: String,
    endpoint: String,
    latency_ms: f64,
    status: SignalStatus,
    #[serde(default)]
    #[allow(dead_code)]
    tenant_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<String>,
}

async fn ingest_signals(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngressBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.signals.is_empty() {
        return Err(ApiError::InvalidInput("batch is empty".to_string()));
    }
    if body.signals.len() > MAX_BATCH_SIZE {
        return Err(ApiError::InvalidInput(format!(
            "batch of {} exceeds the {MAX_BATCH_SIZE}-signal limit",
            body.signals.len()
        )));
    }

    let stamped_at = Utc::now();
    let mut batch = Vec::with_capacity(body.signals.len());
    for raw in body.signals {
        batch.push(validate_signal(raw, &auth, stamped_at)?);
    }

    let accepted = state
        .enqueue_signals(auth.tenant, batch)
        .map_err(|full| ApiError::Overloaded {
            retry_after_ms: full.retry_after_ms(),
        })?;

    debug!(tenant = %auth.tenant, accepted, "signals accepted");
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
}

fn validate_signal(
    raw: IngressSignal,
    auth: &TenantAuth,
    stamped_at: chrono::DateTime<Utc>,
) -> Result<Signal, ApiError> {
    if raw.service_name.is_empty() || raw.service_name.len() > MAX_SERVICE_NAME_LEN {
        return Err(ApiError::InvalidInput(format!(
            "service_name must be 1..={MAX_SERVICE_NAME_LEN} chars"
        )));
    }
    if raw.endpoint.is_empty() || raw.endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(ApiError::InvalidInput(format!(
            "endpoint must be 1..={MAX_ENDPOINT_LEN} chars"
        )));
    }
    if !raw.endpoint.starts_with('/') {
        return Err(ApiError::InvalidInput(
            "endpoint must start with '/'".to_string(),
        ));
    }
    if !raw.latency_ms.is_finite() || raw.latency_ms < 0.0 || raw.latency_ms > MAX_LATENCY_MS {
        return Err(ApiError::InvalidInput(format!(
            "latency_ms must be a finite value in 0..={MAX_LATENCY_MS}"
        )));
    }

    Ok(Signal {
        tenant_id: auth.tenant,
        service_name: raw.service_name,
        endpoint: raw.endpoint,
        latency_ms: raw.latency_ms,
        status: raw.status,
        // Server-stamped; any client-provided timestamp is a hint only.
        timestamp: stamped_at,
    })
}

// =============================================================================
// Policy lookup (client runtime hot path)
// =============================================================================

#[derive(Serialize)]
struct PolicyResponse {
    service_name: String,
    endpoint: String,
    tenant_id: String,
    cache_enabled: bool,
    circuit_breaker: bool,
    rate_limit_enabled: bool,
    rate_limit_customer_rpm: f64,
    queue_deferral_rpm: f64,
    load_shedding_rpm: f64,
    cache_latency_ms: f64,
    circuit_breaker_error_rate: f64,
    load_shed_active: bool,
    queue_defer_active: bool,
    estimated_delay_s: u32,
    reasoning: String,
    version: u64,
}

impl PolicyResponse {
    fn from_policy(key: &PolicyKey, policy: &Policy) -> Self {
        Self {
            service_name: key.service.clone(),
            endpoint: key.endpoint.clone(),
            tenant_id: key.tenant.to_string(),
            cache_enabled: policy.cache_enabled,
            circuit_breaker: policy.circuit_breaker,
            rate_limit_enabled: policy.rate_limit_enabled,
            rate_limit_customer_rpm: policy.rate_limit_customer_rpm,
            queue_deferral_rpm: policy.queue_deferral_rpm,
            load_shedding_rpm: policy.load_shedding_rpm,
            cache_latency_ms: policy.cache_latency_ms,
            circuit_breaker_error_rate: policy.circuit_breaker_error_rate,
            load_shed_active: policy.load_shed_active,
            queue_defer_active: policy.queue_defer_active,
            estimated_delay_s: policy.estimated_delay_s,
            reasoning: policy.reasoning.clone(),
            version: policy.version,
        }
    }
}

async fn get_policy(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
    Path((service, endpoint)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if service.is_empty() || service.len() > MAX_SERVICE_NAME_LEN {
        return Err(ApiError::InvalidInput("invalid service name".to_string()));
    }
    // The wildcard capture comes back without a guaranteed leading slash.
    let endpoint = if endpoint.starts_with('/') {
        endpoint
    } else {
        format!("/{endpoint}")
    };
    if endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(ApiError::InvalidInput("endpoint too long".to_string()));
    }

    let key = PolicyKey::new(auth.tenant, service, endpoint);
    // Pure in-memory read; unknown keys get the safe default in the same
    // shape so the client runtime never special-cases.
    let policy = state.policies.get_or_default(&key);
    Ok(Json(PolicyResponse::from_policy(&key, &policy)))
}

// =============================================================================
// Operator snapshot (REST mirror of /sse/services)
// =============================================================================

async fn get_services(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.services_payload(auth.tenant))
}

// =============================================================================
// AI surface: thresholds and insights
// =============================================================================

#[derive(Serialize)]
struct ThresholdView {
    service_name: String,
    endpoint: String,
    cache_latency_ms: f64,
    circuit_breaker_error_rate: f64,
    rate_limit_customer_rpm: f64,
    queue_deferral_rpm: f64,
    load_shedding_rpm: f64,
    confidence: f64,
    last_updated: String,
}

impl ThresholdView {
    fn from_threshold(t: &Threshold) -> Self {
        Self {
            service_name: t.key.service.clone(),
            endpoint: t.key.endpoint.clone(),
            cache_latency_ms: t.cache_latency_ms,
            circuit_breaker_error_rate: t.circuit_breaker_error_rate,
            rate_limit_customer_rpm: t.rate_limit_customer_rpm,
            queue_deferral_rpm: t.queue_deferral_rpm,
            load_shedding_rpm: t.load_shedding_rpm,
            confidence: t.confidence,
            last_updated: t.last_updated.to_rfc3339(),
        }
    }
}

async fn get_thresholds(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let thresholds: Vec<ThresholdView> = state
        .thresholds
        .tenant_thresholds(auth.tenant)
        .iter()
        .map(|t| ThresholdView::from_threshold(t))
        .collect();
    let total = thresholds.len();
    Json(json!({ "thresholds": thresholds, "total": total }))
}

#[derive(Deserialize)]
struct InsightsQuery {
    service: Option<String>,
    limit: Option<usize>,
}

async fn get_insights(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<InsightsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let insights = state
        .insights
        .list(auth.tenant, query.service.as_deref(), limit)?;
    let total = insights.len();
    Ok(Json(json!({ "insights": insights, "total": total })))
}

// =============================================================================
// Analytics
// =============================================================================

#[derive(Deserialize)]
struct TrafficQuery {
    days: Option<u32>,
}

async fn get_traffic_patterns(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrafficQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = validate_days(query.days)?;
    let patterns = analytics::traffic_patterns(&state.db, auth.tenant, days)?;
    Ok(Json(json!({ "patterns": patterns })))
}

#[derive(Deserialize)]
struct PercentileQuery {
    days: Option<u32>,
    service: Option<String>,
}

async fn get_percentiles(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PercentileQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = validate_days(query.days)?;
    let series = analytics::percentile_series(
        &state.db,
        &state.signals,
        auth.tenant,
        days,
        query.service.as_deref(),
        Utc::now(),
    )?;
    Ok(Json(series))
}

fn validate_days(days: Option<u32>) -> Result<u32, ApiError> {
    let days = days.unwrap_or(7);
    if days == 0 || days > MAX_QUERY_DAYS {
        return Err(ApiError::InvalidInput(format!(
            "days must be in 1..={MAX_QUERY_DAYS}"
        )));
    }
    Ok(days)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_body_rejects_unknown_fields() {
        let err = serde_json::from_str::<IngressBody>(
            r#"{"signals": [], "mystery_field": 1}"#,
        );
        assert!(err.is_err());

        let err = serde_json::from_str::<IngressBody>(
            r#"{"signals": [{"service_name": "s", "endpoint": "/p",
                "latency_ms": 1.0, "status": "success", "extra": true}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn ingress_body_tolerates_ignored_known_fields() {
        let body: IngressBody = serde_json::from_str(
            r#"{"signals": [{"service_name": "s", "endpoint": "/p",
                "latency_ms": 1.0, "status": "success",
                "tenant_id": "deadbeef", "timestamp": "2026-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(body.signals.len(), 1);
    }

    #[test]
    fn validate_signal_enforces_bounds() {
        let auth = TenantAuth::resolve("hk_test_0123456789").unwrap();
        let now = Utc::now();

        let ok = IngressSignal {
            service_name: "svc".into(),
            endpoint: "/p".into(),
            latency_ms: 50.0,
            status: SignalStatus::Success,
            tenant_id: None,
            timestamp: None,
        };
        let signal = validate_signal(ok, &auth, now).unwrap();
        assert_eq!(signal.tenant_id, auth.tenant);
        assert_eq!(signal.timestamp, now);

        let bad_latency = IngressSignal {
            service_name: "svc".into(),
            endpoint: "/p".into(),
            latency_ms: f64::NAN,
            status: SignalStatus::Success,
            tenant_id: None,
            timestamp: None,
        };
        assert!(validate_signal(bad_latency, &auth, now).is_err());

        let bad_endpoint = IngressSignal {
            service_name: "svc".into(),
            endpoint: "no-slash".into(),
            latency_ms: 1.0,
            status: SignalStatus::Success,
            tenant_id: None,
            timestamp: None,
        };
        assert!(validate_signal(bad_endpoint, &auth, now).is_err());

        let long_service = IngressSignal {
            service_name: "s".repeat(MAX_SERVICE_NAME_LEN + 1),
            endpoint: "/p".into(),
            latency_ms: 1.0,
            status: SignalStatus::Success,
            tenant_id: None,
            timestamp: None,
        };
        assert!(validate_signal(long_service, &auth, now).is_err());
    }

    #[test]
    fn days_validation() {
        assert_eq!(validate_days(None).unwrap(), 7);
        assert_eq!(validate_days(Some(30)).unwrap(), 30);
        assert!(validate_days(Some(0)).is_err());
        assert!(validate_days(Some(MAX_QUERY_DAYS + 1)).is_err());
    }

    #[test]
    fn policy_response_mirrors_safe_default() {
        let key = PolicyKey::new(
            crate::types::TenantId::from_api_key("rest-test"),
            "svc",
            "/p",
        );
        let response = PolicyResponse::from_policy(&key, &Policy::safe_default(key.clone()));
        assert!(!response.cache_enabled);
        assert!(!response.circuit_breaker);
        assert!(!response.rate_limit_enabled);
        assert_eq!(response.reasoning, "no policy yet");
        assert_eq!(response.version, 0);
        assert_eq!(response.service_name, "svc");
        assert_eq!(response.endpoint, "/p");
    }
}
