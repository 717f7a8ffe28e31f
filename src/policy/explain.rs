// =============================================================================
// Explain collaborator — narrative reasoning and threshold suggestions
// =============================================================================
//
// The decision engine is numeric; the Explain collaborator turns a metrics
// snapshot into operator-readable reasoning and, optionally, suggested
// threshold adjustments with a confidence score. Any implementor of the
// trait is accepted: the production deployment points EXPLAIN_ENDPOINT at an
// external service; without one, the built-in heuristic produces
// deterministic reasoning so `reasoning` is never empty.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard cap on reasoning text. Longer output is truncated, never rejected.
pub const MAX_REASONING_LEN: usize = 2048;

/// Deadline for one collaborator call.
pub const EXPLAIN_DEADLINE: Duration = Duration::from_secs(3);

/// Metrics handed to the collaborator for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExplainInput {
    pub service_name: String,
    pub endpoint: String,
    pub avg_latency_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub rpm: u32,
    pub p95_latency_ms: Option<f64>,
    pub cache_latency_ms: f64,
    pub circuit_breaker_error_rate: f64,
    pub load_shedding_rpm: f64,
}

/// Threshold adjustments proposed by the collaborator. Absent fields mean
/// "keep the current value".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestedThresholds {
    pub cache_latency_ms: Option<f64>,
    pub circuit_breaker_error_rate: Option<f64>,
    pub rate_limit_customer_rpm: Option<f64>,
    pub queue_deferral_rpm: Option<f64>,
    pub load_shedding_rpm: Option<f64>,
}

/// One collaborator response.
#[derive(Debug, Clone, Deserialize)]
pub struct Explanation {
    pub reasoning: String,
    #[serde(default)]
    pub suggested: SuggestedThresholds,
    #[serde(default)]
    pub confidence: f64,
}

/// Contract the engine depends on. `reasoning` ends up verbatim (truncated)
/// in the policy record; suggestions feed threshold adaptation.
#[async_trait]
pub trait Explain: Send + Sync {
    async fn explain(&self, input: &ExplainInput) -> Result<Explanation>;
}

/// Truncate reasoning to the wire cap at a char boundary.
pub fn clamp_reasoning(mut reasoning: String) -> String {
    if reasoning.len() > MAX_REASONING_LEN {
        let mut cut = MAX_REASONING_LEN;
        while !reasoning.is_char_boundary(cut) {
            cut -= 1;
        }
        reasoning.truncate(cut);
    }
    reasoning
}

// ---------------------------------------------------------------------------
// HTTP collaborator
// ---------------------------------------------------------------------------

/// POSTs the metrics snapshot to an external explain service.
pub struct HttpExplainer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExplainer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(EXPLAIN_DEADLINE)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Explain for HttpExplainer {
    async fn explain(&self, input: &ExplainInput) -> Result<Explanation> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(input)
            .send()
            .await
            .context("explain request failed")?;

        let response = response
            .error_for_status()
            .context("explain service returned an error status")?;

        let mut explanation: Explanation = response
            .json()
            .await
            .context("explain response was not valid JSON")?;
        explanation.reasoning = clamp_reasoning(explanation.reasoning);
        explanation.confidence = explanation.confidence.clamp(0.0, 1.0);
        Ok(explanation)
    }
}

// ---------------------------------------------------------------------------
// Heuristic collaborator
// ---------------------------------------------------------------------------

/// Deterministic fallback used when no EXPLAIN_ENDPOINT is configured.
///
/// Reasoning strings describe the observed metrics against the current
/// thresholds; threshold suggestions track the p95 latency (cache threshold
/// at 1.2× p95) with moderate confidence so adaptation stays gradual.
pub struct HeuristicExplainer;

#[async_trait]
impl Explain for HeuristicExplainer {
    async fn explain(&self, input: &ExplainInput) -> Result<Explanation> {
        let mut parts: Vec<String> = Vec::new();

        if let Some(avg) = input.avg_latency_ms {
            if avg >= input.cache_latency_ms {
                parts.push(format!(
                    "avg latency {avg:.0} ms is at or above the {:.0} ms cache threshold; caching relieves repeated work",
                    input.cache_latency_ms
                ));
            } else {
                parts.push(format!(
                    "avg latency {avg:.0} ms is under the {:.0} ms cache threshold",
                    input.cache_latency_ms
                ));
            }
        }

        if let Some(err) = input.error_rate {
            if err >= input.circuit_breaker_error_rate {
                parts.push(format!(
                    "error rate {:.0}% exceeds the {:.0}% breaker threshold",
                    err * 100.0,
                    input.circuit_breaker_error_rate * 100.0
                ));
            } else if err > 0.0 {
                parts.push(format!("error rate {:.1}% is within tolerance", err * 100.0));
            }
        }

        if f64::from(input.rpm) >= input.load_shedding_rpm {
            parts.push(format!(
                "traffic {} rpm is above the {:.0} rpm shedding threshold",
                input.rpm, input.load_shedding_rpm
            ));
        } else {
            parts.push(format!("traffic steady at {} rpm", input.rpm));
        }

        let reasoning = clamp_reasoning(format!(
            "{}/{}: {}",
            input.service_name,
            input.endpoint,
            parts.join("; ")
        ));

        // Track the cache threshold toward 1.2x the observed p95 so slow
        // endpoints get a realistic bar instead of the global default.
        let suggested = SuggestedThresholds {
            cache_latency_ms: input.p95_latency_ms.map(|p95| (p95 * 1.2).max(50.0)),
            ..SuggestedThresholds::default()
        };

        Ok(Explanation {
            reasoning,
            suggested,
            confidence: 0.75,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn input(avg: Option<f64>, err: Option<f64>, rpm: u32) -> ExplainInput {
        ExplainInput {
            service_name: "svc".into(),
            endpoint: "/p".into(),
            avg_latency_ms: avg,
            error_rate: err,
            rpm,
            p95_latency_ms: avg.map(|a| a * 1.5),
            cache_latency_ms: 500.0,
            circuit_breaker_error_rate: 0.5,
            load_shedding_rpm: 2000.0,
        }
    }

    #[tokio::test]
    async fn heuristic_reasoning_mentions_slow_endpoint() {
        let explanation = HeuristicExplainer
            .explain(&input(Some(800.0), Some(0.01), 120))
            .await
            .unwrap();
        assert!(explanation.reasoning.contains("cache threshold"));
        assert!(!explanation.reasoning.is_empty());
        assert!(explanation.confidence >= 0.7);
    }

    #[tokio::test]
    async fn heuristic_suggests_p95_tracked_cache_threshold() {
        let explanation = HeuristicExplainer
            .explain(&input(Some(800.0), None, 10))
            .await
            .unwrap();
        let suggested = explanation.suggested.cache_latency_ms.unwrap();
        assert!((suggested - 800.0 * 1.5 * 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn heuristic_handles_empty_metrics() {
        let explanation = HeuristicExplainer
            .explain(&input(None, None, 0))
            .await
            .unwrap();
        assert!(explanation.reasoning.contains("svc//p"));
        assert!(explanation.suggested.cache_latency_ms.is_none());
    }

    #[test]
    fn reasoning_is_truncated_at_cap() {
        let long = "x".repeat(MAX_REASONING_LEN * 2);
        assert_eq!(clamp_reasoning(long).len(), MAX_REASONING_LEN);

        let short = "short".to_string();
        assert_eq!(clamp_reasoning(short), "short");
    }

    #[test]
    fn explanation_deserialises_with_defaults() {
        let parsed: Explanation =
            serde_json::from_str(r#"{"reasoning": "all quiet"}"#).unwrap();
        assert_eq!(parsed.reasoning, "all quiet");
        assert_eq!(parsed.confidence, 0.0);
        assert!(parsed.suggested.load_shedding_rpm.is_none());
    }
}
