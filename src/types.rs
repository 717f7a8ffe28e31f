// =============================================================================
// Shared types used across the Helmsman control plane
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Wire limits
// ---------------------------------------------------------------------------

/// Maximum length of a service name on ingress.
pub const MAX_SERVICE_NAME_LEN: usize = 64;
/// Maximum length of an endpoint template on ingress.
pub const MAX_ENDPOINT_LEN: usize = 256;
/// Maximum accepted latency value in milliseconds.
pub const MAX_LATENCY_MS: f64 = 10_000_000.0;
/// Maximum number of signals in a single ingress batch.
pub const MAX_BATCH_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// TenantId
// ---------------------------------------------------------------------------

/// Opaque 16-byte tenant identifier.
///
/// Derived server-side from the caller's API key (truncated SHA-256) so that
/// the same key always resolves to the same tenant and raw keys never appear
/// in storage or logs. Rendered as 32 hex chars on the wire.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TenantId([u8; 16]);

impl TenantId {
    /// Derive the tenant id for an API key.
    pub fn from_api_key(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    /// Construct from raw bytes (used by stores rehydrating persisted keys).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse the 32-hex-char wire form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 16] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for TenantId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid tenant id"))
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Outcome of one observed endpoint call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Success,
    Error,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One immutable performance observation for a single endpoint call.
///
/// The timestamp is stamped at ingress; client-supplied values are treated as
/// a hint only and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub tenant_id: TenantId,
    pub service_name: String,
    /// Endpoint in template form, e.g. `/products/:id`. The client library is
    /// responsible for templatising concrete paths.
    pub endpoint: String,
    pub latency_ms: f64,
    pub status: SignalStatus,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            tenant: self.tenant_id,
            service: self.service_name.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyKey
// ---------------------------------------------------------------------------

/// Composite key that identifies one managed endpoint.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PolicyKey {
    pub tenant: TenantId,
    pub service: String,
    pub endpoint: String,
}

impl PolicyKey {
    pub fn new(tenant: TenantId, service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            tenant,
            service: service.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{}", self.tenant, self.service, self.endpoint)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Caller-declared request importance. Determines which traffic-management
/// decisions apply to a request (see the client runtime's priority matrix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Multiplier applied to the load-shedding RPM threshold for this
    /// priority. `critical` never sheds; `low` sheds earlier.
    pub fn shed_factor(&self) -> Option<f64> {
        match self {
            Self::Critical => None,
            Self::High => Some(1.25),
            Self::Medium => Some(1.0),
            Self::Low => Some(0.8),
        }
    }

    /// Whether queue deferral applies at this priority.
    pub fn defers(&self) -> bool {
        matches!(self, Self::Medium | Self::Low)
    }

    /// Whether the per-customer rate limit applies at this priority.
    pub fn rate_limited(&self) -> bool {
        !matches!(self, Self::Critical)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_is_stable_per_key() {
        let a = TenantId::from_api_key("hk_live_abc123");
        let b = TenantId::from_api_key("hk_live_abc123");
        let c = TenantId::from_api_key("hk_live_other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tenant_id_hex_roundtrip() {
        let id = TenantId::from_api_key("some-key");
        let hex = id.to_string();
        assert_eq!(hex.len(), 32);
        assert_eq!(TenantId::from_hex(&hex), Some(id));
    }

    #[test]
    fn tenant_id_rejects_bad_hex() {
        assert!(TenantId::from_hex("zz").is_none());
        assert!(TenantId::from_hex("abcd").is_none());
    }

    #[test]
    fn signal_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&SignalStatus::Success).unwrap(),
            "\"success\""
        );
        let parsed: SignalStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, SignalStatus::Error);
    }

    #[test]
    fn priority_matrix_factors() {
        assert_eq!(Priority::Critical.shed_factor(), None);
        assert_eq!(Priority::High.shed_factor(), Some(1.25));
        assert_eq!(Priority::Medium.shed_factor(), Some(1.0));
        assert_eq!(Priority::Low.shed_factor(), Some(0.8));
        assert!(!Priority::Critical.rate_limited());
        assert!(Priority::High.rate_limited());
        assert!(!Priority::High.defers());
        assert!(Priority::Low.defers());
    }
}
