// =============================================================================
// Policy Engine — turns aggregate snapshots into traffic-management policies
// =============================================================================
//
// Five ordered rules, evaluated on every 10 s snapshot:
//   1. Circuit breaker  — error rate over threshold with >= 50 samples.
//   2. Cache            — avg latency over threshold with a tolerable error
//                         rate.
//   3. Load shedding    — RPM over the shedding threshold.
//   4. Queue deferral   — RPM between the deferral and shedding thresholds.
//   5. Customer limit   — always carried through from the thresholds.
//
// Protections clear through hysteresis: three consecutive healthy snapshots,
// not one. Snapshots marked insufficient never downgrade an existing policy.
// Identical inputs produce `Unchanged` and never bump the version.
//
// After the numeric rules, the Explain collaborator contributes reasoning
// and may suggest threshold adjustments; suggestions are applied when the
// confidence is >= 0.7 and the change is >= 10%. Collaborator failures leave
// the numeric outcome intact.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate::AggregateSnapshot;
use crate::policy::explain::{clamp_reasoning, Explain, ExplainInput, EXPLAIN_DEADLINE};
use crate::policy::insights::{InsightStore, InsightType};
use crate::policy::store::{Policy, PolicyStore};
use crate::policy::thresholds::{Threshold, ThresholdStore};
use crate::types::PolicyKey;

/// Samples required in the evaluation window before the breaker may trip.
const CB_MIN_SAMPLES: u32 = 50;
/// Error-rate ceiling for enabling the cache.
const CACHE_MAX_ERROR_RATE: f64 = 0.2;
/// Consecutive healthy snapshots required to clear a protection.
const CLEAR_STREAK: u8 = 3;
/// Minimum relative change before a threshold suggestion is applied.
const ADAPTATION_MIN_DELTA: f64 = 0.10;
/// Minimum collaborator confidence before suggestions are applied.
const ADAPTATION_MIN_CONFIDENCE: f64 = 0.7;
/// Error-rate spike factor that triggers an anomaly insight.
const ANOMALY_ERROR_FACTOR: f64 = 5.0;
/// Latency spike factor that triggers an anomaly insight.
const ANOMALY_LATENCY_FACTOR: f64 = 3.0;

/// Result of one evaluation.
#[derive(Debug)]
pub enum PolicyDelta {
    /// Decisions identical to the committed policy; nothing written.
    Unchanged,
    /// A new policy version was committed.
    Updated(Arc<Policy>),
}

/// Per-key evaluation state: hysteresis streaks and anomaly baselines.
#[derive(Debug, Default)]
struct KeyState {
    breaker_clear_streak: u8,
    cache_clear_streak: u8,
    baseline_error_rate: Option<f64>,
    baseline_latency: Option<f64>,
}

pub struct PolicyEngine {
    policies: Arc<PolicyStore>,
    thresholds: Arc<ThresholdStore>,
    insights: Arc<InsightStore>,
    explain: Arc<dyn Explain>,
    state: Mutex<HashMap<PolicyKey, KeyState>>,
    explain_timeouts: AtomicU64,
}

impl PolicyEngine {
    pub fn new(
        policies: Arc<PolicyStore>,
        thresholds: Arc<ThresholdStore>,
        insights: Arc<InsightStore>,
        explain: Arc<dyn Explain>,
    ) -> Self {
        Self {
            policies,
            thresholds,
            insights,
            explain,
            state: Mutex::new(HashMap::new()),
            explain_timeouts: AtomicU64::new(0),
        }
    }

    pub fn explain_timeouts(&self) -> u64 {
        self.explain_timeouts.load(Ordering::Relaxed)
    }

    /// Evaluate one snapshot against the current policy and thresholds.
    pub async fn evaluate(&self, snap: &AggregateSnapshot) -> Result<PolicyDelta> {
        let key = &snap.key;
        let prior = self.policies.get(key);
        let stored_threshold = self.thresholds.get_or_default(key);

        // Thin windows never downgrade an existing policy; the streaks stay
        // frozen so a quiet period cannot silently clear a breaker.
        if snap.insufficient_data && prior.is_some() {
            debug!(key = %key, samples = snap.window_samples, "window too thin, policy held");
            return Ok(PolicyDelta::Unchanged);
        }

        self.detect_anomalies(snap);

        // Collaborator: reasoning plus optional threshold suggestions.
        let explanation = match tokio::time::timeout(
            EXPLAIN_DEADLINE,
            self.explain.explain(&explain_input(snap, &stored_threshold)),
        )
        .await
        {
            Ok(Ok(explanation)) => Some(explanation),
            Ok(Err(err)) => {
                warn!(key = %key, error = %err, "explain collaborator failed");
                self.note_explain_omission(key, "explain collaborator failed");
                None
            }
            Err(_) => {
                warn!(key = %key, "explain collaborator timed out");
                self.note_explain_omission(key, "explain collaborator timed out");
                None
            }
        };

        let (threshold, threshold_changed) =
            self.adapt_thresholds(key, stored_threshold, explanation.as_ref());

        let (candidate, rule_reasons) = self.apply_rules(snap, prior.as_deref(), &threshold);

        let reasoning = clamp_reasoning(match &explanation {
            Some(e) if !e.reasoning.is_empty() => e.reasoning.clone(),
            _ => rule_reasons,
        });

        // Same decisions and same thresholds: nothing to write.
        if let Some(prior) = &prior {
            if candidate.decisions_equal(prior) && !threshold_changed {
                return Ok(PolicyDelta::Unchanged);
            }
        }

        let version = prior.as_ref().map_or(1, |p| p.version + 1);
        let policy = Policy {
            reasoning,
            version,
            updated_at: Utc::now(),
            ..candidate
        };

        info!(
            key = %key,
            version,
            cache = policy.cache_enabled,
            breaker = policy.circuit_breaker,
            shed = policy.load_shed_active,
            defer = policy.queue_defer_active,
            "policy updated"
        );

        let committed = Arc::new(policy.clone());
        self.thresholds.install(threshold.clone());
        self.policies.commit(policy, threshold).await?;
        Ok(PolicyDelta::Updated(committed))
    }

    // -------------------------------------------------------------------------
    // Numeric rules
    // -------------------------------------------------------------------------

    fn apply_rules(
        &self,
        snap: &AggregateSnapshot,
        prior: Option<&Policy>,
        threshold: &Threshold,
    ) -> (Policy, String) {
        let key = &snap.key;
        let mut reasons: Vec<String> = Vec::new();
        let mut state_map = self.state.lock();
        let state = state_map.entry(key.clone()).or_default();

        // 1. Circuit breaker.
        let window_error_rate = snap.window_error_rate.unwrap_or(0.0);
        let prior_breaker = prior.is_some_and(|p| p.circuit_breaker);
        let circuit_breaker = if window_error_rate >= threshold.circuit_breaker_error_rate
            && snap.window_samples >= CB_MIN_SAMPLES
        {
            state.breaker_clear_streak = 0;
            reasons.push(format!(
                "circuit breaker open: error rate {:.0}% over {} samples (threshold {:.0}%)",
                window_error_rate * 100.0,
                snap.window_samples,
                threshold.circuit_breaker_error_rate * 100.0
            ));
            true
        } else if prior_breaker {
            if window_error_rate < 0.5 * threshold.circuit_breaker_error_rate {
                state.breaker_clear_streak += 1;
            } else {
                state.breaker_clear_streak = 0;
            }
            if state.breaker_clear_streak >= CLEAR_STREAK {
                state.breaker_clear_streak = 0;
                reasons.push(format!(
                    "circuit breaker closed after {} healthy windows",
                    CLEAR_STREAK
                ));
                false
            } else {
                reasons.push(format!(
                    "circuit breaker held: {}/{} healthy windows",
                    state.breaker_clear_streak, CLEAR_STREAK
                ));
                true
            }
        } else {
            false
        };

        // 2. Cache.
        let avg_latency = snap.avg_latency;
        let error_rate = snap.error_rate.unwrap_or(0.0);
        let prior_cache = prior.is_some_and(|p| p.cache_enabled);
        let cache_enabled = match avg_latency {
            Some(avg) if avg >= threshold.cache_latency_ms && error_rate < CACHE_MAX_ERROR_RATE => {
                state.cache_clear_streak = 0;
                reasons.push(format!(
                    "cache enabled: avg latency {avg:.0} ms >= {:.0} ms",
                    threshold.cache_latency_ms
                ));
                true
            }
            Some(avg) if prior_cache => {
                if avg < 0.6 * threshold.cache_latency_ms {
                    state.cache_clear_streak += 1;
                } else {
                    state.cache_clear_streak = 0;
                }
                if state.cache_clear_streak >= CLEAR_STREAK {
                    state.cache_clear_streak = 0;
                    reasons.push("cache disabled: latency recovered".to_string());
                    false
                } else {
                    true
                }
            }
            None if prior_cache => true,
            _ => false,
        };

        // 3. Load shedding.
        let rpm = f64::from(snap.rpm);
        let load_shed_active = rpm >= threshold.load_shedding_rpm;
        if load_shed_active {
            reasons.push(format!(
                "load shedding: {} rpm >= {:.0} rpm",
                snap.rpm, threshold.load_shedding_rpm
            ));
        }

        // 4. Queue deferral.
        let (queue_defer_active, estimated_delay_s) = if !load_shed_active
            && rpm >= threshold.queue_deferral_rpm
        {
            let over = rpm - threshold.queue_deferral_rpm;
            let delay = (over / threshold.queue_deferral_rpm * 5.0).ceil().max(0.0) as u32;
            reasons.push(format!(
                "queue deferral: {} rpm, estimated delay {delay} s",
                snap.rpm
            ));
            (true, delay)
        } else {
            (false, 0)
        };

        if reasons.is_empty() {
            reasons.push(format!(
                "{}/{} healthy: no traffic management needed",
                key.service, key.endpoint
            ));
        }

        let policy = Policy {
            key: key.clone(),
            cache_enabled,
            circuit_breaker,
            // 5. The per-customer limit is always published; enforcement is
            // the client runtime's job.
            rate_limit_enabled: true,
            rate_limit_customer_rpm: threshold.rate_limit_customer_rpm,
            queue_deferral_rpm: threshold.queue_deferral_rpm,
            load_shedding_rpm: threshold.load_shedding_rpm,
            cache_latency_ms: if cache_enabled {
                threshold.cache_latency_ms
            } else {
                0.0
            },
            circuit_breaker_error_rate: threshold.circuit_breaker_error_rate,
            load_shed_active,
            queue_defer_active,
            estimated_delay_s,
            reasoning: String::new(),
            version: 0,
            updated_at: Utc::now(),
        };

        (policy, reasons.join("; "))
    }

    // -------------------------------------------------------------------------
    // Threshold adaptation
    // -------------------------------------------------------------------------

    /// Apply a collaborator suggestion to the stored thresholds. Returns the
    /// effective thresholds and whether they changed.
    fn adapt_thresholds(
        &self,
        key: &PolicyKey,
        stored: Threshold,
        explanation: Option<&crate::policy::explain::Explanation>,
    ) -> (Threshold, bool) {
        let Some(explanation) = explanation else {
            return (stored, false);
        };
        if explanation.confidence < ADAPTATION_MIN_CONFIDENCE {
            return (stored, false);
        }

        let mut candidate = stored.clone();
        let s = &explanation.suggested;
        if let Some(v) = s.cache_latency_ms {
            candidate.cache_latency_ms = v.max(1.0);
        }
        if let Some(v) = s.circuit_breaker_error_rate {
            candidate.circuit_breaker_error_rate = v.clamp(0.01, 1.0);
        }
        if let Some(v) = s.rate_limit_customer_rpm {
            candidate.rate_limit_customer_rpm = v.max(1.0);
        }
        if let Some(v) = s.queue_deferral_rpm {
            candidate.queue_deferral_rpm = v.max(1.0);
        }
        if let Some(v) = s.load_shedding_rpm {
            candidate.load_shedding_rpm = v.max(1.0);
        }
        // Deferral must engage at or below the shedding threshold.
        if candidate.queue_deferral_rpm > candidate.load_shedding_rpm {
            candidate.queue_deferral_rpm = candidate.load_shedding_rpm;
        }

        if !candidate.differs_by(&stored, ADAPTATION_MIN_DELTA) {
            return (stored, false);
        }

        candidate.confidence = explanation.confidence;
        candidate.last_updated = Utc::now();

        if let Err(err) = self.insights.record(
            key,
            InsightType::Recommendation,
            format!(
                "thresholds adapted: cache {:.0} ms -> {:.0} ms, breaker {:.0}% -> {:.0}%",
                stored.cache_latency_ms,
                candidate.cache_latency_ms,
                stored.circuit_breaker_error_rate * 100.0,
                candidate.circuit_breaker_error_rate * 100.0
            ),
            explanation.confidence,
        ) {
            warn!(key = %key, error = %err, "failed to record recommendation insight");
        }

        (candidate, true)
    }

    // -------------------------------------------------------------------------
    // Anomaly detection
    // -------------------------------------------------------------------------

    fn detect_anomalies(&self, snap: &AggregateSnapshot) {
        let mut state_map = self.state.lock();
        let state = state_map.entry(snap.key.clone()).or_default();

        if let Some(err) = snap.window_error_rate {
            if let Some(baseline) = state.baseline_error_rate {
                let floor = baseline.max(0.01);
                if err > ANOMALY_ERROR_FACTOR * floor && err > 0.05 {
                    self.record_anomaly(
                        &snap.key,
                        format!(
                            "error rate spiked to {:.0}% ({}x the {:.1}% baseline)",
                            err * 100.0,
                            (err / floor) as u32,
                            baseline * 100.0
                        ),
                    );
                }
            }
            state.baseline_error_rate = Some(match state.baseline_error_rate {
                Some(b) => b + 0.1 * (err - b),
                None => err,
            });
        }

        if let Some(avg) = snap.avg_latency {
            if let Some(baseline) = state.baseline_latency {
                if baseline > 0.0 && avg > ANOMALY_LATENCY_FACTOR * baseline {
                    self.record_anomaly(
                        &snap.key,
                        format!(
                            "latency spiked to {avg:.0} ms ({:.1}x the {baseline:.0} ms baseline)",
                            avg / baseline
                        ),
                    );
                }
            }
            state.baseline_latency = Some(match state.baseline_latency {
                Some(b) => b + 0.1 * (avg - b),
                None => avg,
            });
        }
    }

    fn record_anomaly(&self, key: &PolicyKey, description: String) {
        if let Err(err) = self
            .insights
            .record(key, InsightType::Anomaly, description, 1.0)
        {
            warn!(key = %key, error = %err, "failed to record anomaly insight");
        }
    }

    fn note_explain_omission(&self, key: &PolicyKey, what: &str) {
        self.explain_timeouts.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.insights.record(
            key,
            InsightType::Pattern,
            format!("threshold adaptation skipped: {what}; numeric rules applied"),
            0.0,
        ) {
            warn!(key = %key, error = %err, "failed to record omission insight");
        }
    }
}

/// Evaluate every endpoint on the 10 s cadence. Runs forever; spawn once at
/// startup. Parked writes are retried before each round so keys leave
/// read-only mode as soon as the database recovers.
pub async fn run_evaluation_loop(state: Arc<crate::app_state::AppState>) {
    const EVALUATION_TICK_SECS: u64 = 10;
    info!(tick_secs = EVALUATION_TICK_SECS, "policy evaluation loop started");

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(EVALUATION_TICK_SECS));
    // A stalled tick is coalesced, not replayed.
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        state.policies.flush_pending().await;

        for snapshot in state.aggregator.policy_snapshots() {
            if let Err(err) = state.engine.evaluate(&snapshot).await {
                state.aggregator.record_error();
                warn!(key = %snapshot.key, error = %err, "policy evaluation failed");
            }
        }
    }
}

fn explain_input(snap: &AggregateSnapshot, threshold: &Threshold) -> ExplainInput {
    ExplainInput {
        service_name: snap.key.service.clone(),
        endpoint: snap.key.endpoint.clone(),
        avg_latency_ms: snap.avg_latency,
        error_rate: snap.error_rate,
        rpm: snap.rpm,
        p95_latency_ms: snap.percentiles.map(|p| p.p95),
        cache_latency_ms: threshold.cache_latency_ms,
        circuit_breaker_error_rate: threshold.circuit_breaker_error_rate,
        load_shedding_rpm: threshold.load_shedding_rpm,
    }
}

// =============================================================================
// Tests
// =============================================================================
