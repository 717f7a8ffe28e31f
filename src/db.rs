// =============================================================================
// Persistence — SQLite schema and shared connection handle
// =============================================================================
//
// Policies, thresholds, insights and the hourly signal archive live in one
// SQLite database. WAL mode lets readers proceed during writes; the policy
// hot path never touches the database at all (it reads the in-process cache),
// so the connection is a single mutex-guarded handle shared by the stores.
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;

/// Schema for the control-plane database. WAL gives concurrent readers
/// during writes; NORMAL sync is enough because every row here is
/// reconstructible from live traffic.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS policies (
    tenant_id                  TEXT NOT NULL,
    service_name               TEXT NOT NULL,
    endpoint                   TEXT NOT NULL,
    version                    INTEGER NOT NULL,
    cache_enabled              INTEGER NOT NULL,
    circuit_breaker            INTEGER NOT NULL,
    rate_limit_enabled         INTEGER NOT NULL,
    rate_limit_customer_rpm    REAL NOT NULL,
    queue_deferral_rpm         REAL NOT NULL,
    load_shedding_rpm          REAL NOT NULL,
    cache_latency_ms           REAL NOT NULL,
    circuit_breaker_error_rate REAL NOT NULL,
    load_shed_active           INTEGER NOT NULL,
    queue_defer_active         INTEGER NOT NULL,
    estimated_delay_s          INTEGER NOT NULL,
    reasoning                  TEXT NOT NULL,
    updated_at                 TEXT NOT NULL,
    PRIMARY KEY (tenant_id, service_name, endpoint)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS thresholds (
    tenant_id                  TEXT NOT NULL,
    service_name               TEXT NOT NULL,
    endpoint                   TEXT NOT NULL,
    cache_latency_ms           REAL NOT NULL,
    circuit_breaker_error_rate REAL NOT NULL,
    rate_limit_customer_rpm    REAL NOT NULL,
    queue_deferral_rpm         REAL NOT NULL,
    load_shedding_rpm          REAL NOT NULL,
    confidence                 REAL NOT NULL,
    last_updated               TEXT NOT NULL,
    PRIMARY KEY (tenant_id, service_name, endpoint)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS insights (
    id           TEXT PRIMARY KEY,
    insight_type TEXT NOT NULL,
    tenant_id    TEXT NOT NULL,
    service_name TEXT NOT NULL,
    endpoint     TEXT NOT NULL,
    description  TEXT NOT NULL,
    confidence   REAL NOT NULL,
    created_at   TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_insights_created
    ON insights(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_insights_tenant_service
    ON insights(tenant_id, service_name, created_at DESC);

CREATE TABLE IF NOT EXISTS signals_archive (
    hour_bucket       INTEGER NOT NULL,
    tenant_id         TEXT NOT NULL,
    service_name      TEXT NOT NULL,
    endpoint          TEXT NOT NULL,
    n_success         INTEGER NOT NULL,
    n_error           INTEGER NOT NULL,
    latency_reservoir BLOB NOT NULL,
    rpm_total         INTEGER NOT NULL,
    PRIMARY KEY (hour_bucket, tenant_id, service_name, endpoint)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_archive_tenant_hour
    ON signals_archive(tenant_id, hour_bucket DESC);
CREATE INDEX IF NOT EXISTS idx_archive_service
    ON signals_archive(tenant_id, service_name, hour_bucket DESC);
"#;

/// Shared database handle. Cheap to clone; all stores go through it.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database at `path` and apply the schema.
    /// `:memory:` is accepted for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().context("failed to open in-memory database")?
        } else {
            Connection::open(path)
                .with_context(|| format!("failed to open database at {path}"))?
        };

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;

        info!(path = %path, "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

// =============================================================================
// Tests
// =============================================================================
