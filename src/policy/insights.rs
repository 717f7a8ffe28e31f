// =============================================================================
// Insight Store — append-only record of decisions and anomalies
// =============================================================================
//
// Every notable engine event lands here: accepted threshold recommendations,
// anomaly detections, traffic-pattern observations, and omissions (e.g. the
// Explain collaborator timing out). Retention is 30 days, enforced by a
// periodic sweep.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::debug;

use crate::db::Db;
use crate::types::{PolicyKey, TenantId};

/// How long insights are retained.
pub const INSIGHT_RETENTION_DAYS: i64 = 30;

/// Category of an insight event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightType {
    Pattern,
    Anomaly,
    Recommendation,
}

impl InsightType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Anomaly => "anomaly",
            Self::Recommendation => "recommendation",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "anomaly" => Self::Anomaly,
            "recommendation" => Self::Recommendation,
            _ => Self::Pattern,
        }
    }
}

/// One append-only insight event.
#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub id: String,
    pub insight_type: InsightType,
    pub service: String,
    pub endpoint: String,
    pub description: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

pub struct InsightStore {
    db: Db,
}

impl InsightStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one insight.
    pub fn record(
        &self,
        key: &PolicyKey,
        insight_type: InsightType,
        description: impl Into<String>,
        confidence: f64,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let description = description.into();
        debug!(
            key = %key,
            kind = insight_type.as_str(),
            confidence,
            "insight recorded"
        );
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO insights
                     (id, insight_type, tenant_id, service_name, endpoint,
                      description, confidence, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id,
                        insight_type.as_str(),
                        key.tenant.to_string(),
                        key.service,
                        key.endpoint,
                        description,
                        confidence.clamp(0.0, 1.0),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .context("failed to record insight")
    }

    /// Most recent insights for a tenant, optionally filtered by service.
    pub fn list(
        &self,
        tenant: TenantId,
        service: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Insight>> {
        self.db.with_conn(|conn| {
            let mut out = Vec::new();
            let mut push_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
                let kind: String = row.get(1)?;
                let created_at: String = row.get(6)?;
                out.push(Insight {
                    id: row.get(0)?,
                    insight_type: InsightType::parse(&kind),
                    service: row.get(2)?,
                    endpoint: row.get(3)?,
                    description: row.get(4)?,
                    confidence: row.get(5)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                });
                Ok(())
            };

            match service {
                Some(service) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, insight_type, service_name, endpoint, description,
                                confidence, created_at
                         FROM insights
                         WHERE tenant_id = ?1 AND service_name = ?2
                         ORDER BY created_at DESC LIMIT ?3",
                    )?;
                    let mut rows = stmt.query(params![
                        tenant.to_string(),
                        service,
                        limit as i64
                    ])?;
                    while let Some(row) = rows.next()? {
                        push_row(row)?;
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, insight_type, service_name, endpoint, description,
                                confidence, created_at
                         FROM insights
                         WHERE tenant_id = ?1
                         ORDER BY created_at DESC LIMIT ?2",
                    )?;
                    let mut rows = stmt.query(params![tenant.to_string(), limit as i64])?;
                    while let Some(row) = rows.next()? {
                        push_row(row)?;
                    }
                }
            }
            Ok(out)
        })
    }

    /// Delete insights older than the retention horizon. Returns rows removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - Duration::days(INSIGHT_RETENTION_DAYS)).to_rfc3339();
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM insights WHERE created_at < ?1", params![cutoff])?;
            Ok(removed)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(service: &str) -> PolicyKey {
        PolicyKey::new(TenantId::from_api_key("is-test"), service, "/p")
    }

    #[test]
    fn record_and_list_newest_first() {
        let store = InsightStore::new(Db::open(":memory:").unwrap());
        store
            .record(&key("svc"), InsightType::Anomaly, "error spike", 0.9)
            .unwrap();
        store
            .record(&key("svc"), InsightType::Recommendation, "raise limit", 0.8)
            .unwrap();

        let insights = store.list(key("svc").tenant, None, 10).unwrap();
        assert_eq!(insights.len(), 2);
        assert!(insights
            .iter()
            .any(|i| i.insight_type == InsightType::Anomaly));
    }

    #[test]
    fn list_filters_by_service() {
        let store = InsightStore::new(Db::open(":memory:").unwrap());
        store
            .record(&key("a"), InsightType::Pattern, "weekday peak", 0.7)
            .unwrap();
        store
            .record(&key("b"), InsightType::Pattern, "weekend lull", 0.7)
            .unwrap();

        let only_a = store.list(key("a").tenant, Some("a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].service, "a");
    }

    #[test]
    fn list_is_tenant_scoped() {
        let store = InsightStore::new(Db::open(":memory:").unwrap());
        store
            .record(&key("svc"), InsightType::Pattern, "x", 0.5)
            .unwrap();
        let other = TenantId::from_api_key("other-tenant");
        assert!(store.list(other, None, 10).unwrap().is_empty());
    }

    #[test]
    fn confidence_is_clamped() {
        let store = InsightStore::new(Db::open(":memory:").unwrap());
        store
            .record(&key("svc"), InsightType::Anomaly, "spike", 7.5)
            .unwrap();
        let insights = store.list(key("svc").tenant, None, 1).unwrap();
        assert_eq!(insights[0].confidence, 1.0);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = InsightStore::new(Db::open(":memory:").unwrap());
        store
            .record(&key("svc"), InsightType::Pattern, "fresh", 0.5)
            .unwrap();

        // Nothing expires today.
        assert_eq!(store.sweep_expired(Utc::now()).unwrap(), 0);
        // Everything expires 31 days from now.
        let later = Utc::now() + Duration::days(31);
        assert_eq!(store.sweep_expired(later).unwrap(), 1);
        assert!(store.list(key("svc").tenant, None, 10).unwrap().is_empty());
    }
}
