// =============================================================================
// Tenant Authentication — opaque tokens resolved to tenant identity
// =============================================================================
//
// Two credential shapes, both treated as opaque tenant tokens:
//   - `Authorization: Bearer <api_key>` from the client runtime;
//   - a `helmsman_session` cookie from operator dashboards.
//
// Either way the token is hashed into a stable 16-byte tenant id (truncated
// SHA-256), so raw keys never reach storage or logs and per-tenant isolation
// falls out of the key itself.
//
// Usage as an Axum extractor:
//
//   async fn handler(auth: TenantAuth, ...) { let tenant = auth.tenant; ... }
//
// Missing or malformed credentials short-circuit with a 401 before the
// handler body executes.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::error::ApiError;
use crate::types::TenantId;

/// Session cookie name accepted for operator endpoints.
const SESSION_COOKIE: &str = "helmsman_session";

/// Shortest token accepted; anything shorter is certainly not a key.
const MIN_TOKEN_LEN: usize = 8;
/// Longest token accepted.
const MAX_TOKEN_LEN: usize = 512;

/// Axum extractor yielding the caller's resolved tenant identity.
pub struct TenantAuth {
    pub tenant: TenantId,
}

impl TenantAuth {
    /// Resolve a raw token into a tenant, validating basic shape.
    pub fn resolve(token: &str) -> Result<Self, ApiError> {
        let token = token.trim();
        if token.len() < MIN_TOKEN_LEN || token.len() > MAX_TOKEN_LEN {
            return Err(ApiError::Unauthenticated(
                "credential has an invalid length".to_string(),
            ));
        }
        if !token.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ApiError::Unauthenticated(
                "credential contains invalid characters".to_string(),
            ));
        }
        Ok(Self {
            tenant: TenantId::from_api_key(token),
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Bearer header first (client runtime), then session cookie
        // (operator dashboard).
        if let Some(value) = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Self::resolve(token);
            }
            return Err(ApiError::Unauthenticated(
                "authorization header is not a bearer token".to_string(),
            ));
        }

        if let Some(cookies) = parts
            .headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(token) = session_cookie(cookies) {
                return Self::resolve(token);
            }
        }

        Err(ApiError::Unauthenticated(
            "missing credentials: supply a bearer API key or session cookie".to_string(),
        ))
    }
}

/// Pull the session token out of a Cookie header value.
fn session_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE {
            Some(value)
        } else {
            None
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_maps_token_to_stable_tenant() {
        let a = TenantAuth::resolve("hk_live_0123456789").unwrap();
        let b = TenantAuth::resolve("hk_live_0123456789").unwrap();
        assert_eq!(a.tenant, b.tenant);
    }

    #[test]
    fn resolve_rejects_short_tokens() {
        assert!(TenantAuth::resolve("short").is_err());
        assert!(TenantAuth::resolve("").is_err());
    }

    #[test]
    fn resolve_rejects_control_characters() {
        assert!(TenantAuth::resolve("valid-length\nbut-bad").is_err());
    }

    #[test]
    fn resolve_rejects_overlong_tokens() {
        let long = "x".repeat(MAX_TOKEN_LEN + 1);
        assert!(TenantAuth::resolve(&long).is_err());
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let header = "theme=dark; helmsman_session=tok_0123456789; lang=en";
        assert_eq!(session_cookie(header), Some("tok_0123456789"));
    }

    #[test]
    fn session_cookie_absent() {
        assert_eq!(session_cookie("theme=dark; lang=en"), None);
        assert_eq!(session_cookie(""), None);
    }
}
