// =============================================================================
// Server Configuration — environment-driven settings
// =============================================================================
//
// Every tunable the server needs at startup is read from the environment once
// in `ServerConfig::from_env()`. Invalid values are reported as errors so the
// binary can exit with the config-error code instead of limping along with
// half-parsed settings.
// =============================================================================

use anyhow::{bail, Context, Result};
use tracing::info;

/// Default address the API server binds to.
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Default SQLite database path.
const DEFAULT_DB_URL: &str = "helmsman.db";
/// Default retention of raw signals in the recent ring, in days.
const DEFAULT_RETENTION_DAYS: u32 = 7;
/// Default number of lock shards for per-key state.
const DEFAULT_SHARD_COUNT: usize = 256;
/// Default capacity of each per-tenant ingress queue (batches, not signals).
const DEFAULT_INGRESS_QUEUE_DEPTH: usize = 1024;
/// Default per-endpoint recent-ring capacity.
const DEFAULT_RING_CAPACITY: usize = 10_000;

/// Top-level server configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the API server (`LISTEN_ADDR`).
    pub listen_addr: String,
    /// SQLite database path (`DB_URL`). `:memory:` is accepted for tests.
    pub db_url: String,
    /// Optional HTTP endpoint of the Explain collaborator
    /// (`EXPLAIN_ENDPOINT`). When unset, the built-in heuristic explainer
    /// produces reasoning and threshold suggestions.
    pub explain_endpoint: Option<String>,
    /// Days of raw signal retention in the recent ring
    /// (`SIGNAL_RETENTION_DAYS`, default 7).
    pub signal_retention_days: u32,
    /// Number of lock shards for per-key state (`SHARD_COUNT`, default 256).
    pub shard_count: usize,
    /// Capacity of each per-tenant ingress queue, in batches.
    pub ingress_queue_depth: usize,
    /// Per-endpoint recent-ring capacity, in signals.
    pub ring_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            db_url: DEFAULT_DB_URL.to_string(),
            explain_endpoint: None,
            signal_retention_days: DEFAULT_RETENTION_DAYS,
            shard_count: DEFAULT_SHARD_COUNT,
            ingress_queue_depth: DEFAULT_INGRESS_QUEUE_DEPTH,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            if addr.trim().is_empty() {
                bail!("LISTEN_ADDR is set but empty");
            }
            config.listen_addr = addr;
        }

        if let Ok(url) = std::env::var("DB_URL") {
            if url.trim().is_empty() {
                bail!("DB_URL is set but empty");
            }
            config.db_url = url;
        }

        if let Ok(endpoint) = std::env::var("EXPLAIN_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                config.explain_endpoint = Some(endpoint);
            }
        }

        if let Ok(days) = std::env::var("SIGNAL_RETENTION_DAYS") {
            let days: u32 = days
                .parse()
                .context("SIGNAL_RETENTION_DAYS must be a positive integer")?;
            if days == 0 {
                bail!("SIGNAL_RETENTION_DAYS must be at least 1");
            }
            config.signal_retention_days = days;
        }

        if let Ok(shards) = std::env::var("SHARD_COUNT") {
            let shards: usize = shards
                .parse()
                .context("SHARD_COUNT must be a positive integer")?;
            if shards == 0 {
                bail!("SHARD_COUNT must be at least 1");
            }
            config.shard_count = shards;
        }

        info!(
            listen_addr = %config.listen_addr,
            db_url = %config.db_url,
            explain = config.explain_endpoint.is_some(),
            retention_days = config.signal_retention_days,
            shard_count = config.shard_count,
            "server config resolved"
        );

        Ok(config)
    }

    /// Ring retention horizon as a chrono duration.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.signal_retention_days))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.signal_retention_days, 7);
        assert_eq!(cfg.shard_count, 256);
        assert_eq!(cfg.ring_capacity, 10_000);
        assert!(cfg.explain_endpoint.is_none());
    }

    #[test]
    fn retention_horizon_in_days() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.retention(), chrono::Duration::days(7));
    }
}
