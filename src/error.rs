// =============================================================================
// API Error taxonomy — structured failures at the HTTP boundary
// =============================================================================
//
// Every error that crosses the HTTP boundary carries a stable machine code
// and a human message; stack traces and internal detail never leak. Handlers
// recover non-fatal errors locally and return them through this type.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Structured API failure. The variants map 1:1 onto the HTTP statuses the
/// control plane can return.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed or out-of-bounds request payload (400).
    InvalidInput(String),
    /// Missing or unresolvable credentials (401).
    Unauthenticated(String),
    /// Valid credentials without access to the resource (403).
    Forbidden(String),
    /// Tenant-scoped lookup that crossed tenants (404).
    NotFound(String),
    /// Back-pressure: the tenant's ingress queue is full (429).
    Overloaded { retry_after_ms: u64 },
    /// The Explain collaborator did not answer within its deadline (502).
    UpstreamTimeout(String),
    /// Anything unexpected (500). The message is logged, not returned.
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Overloaded { .. } => "overloaded",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg)
            | Self::Unauthenticated(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::UpstreamTimeout(msg)
            | Self::Internal(msg) => write!(f, "{}: {}", self.code(), msg),
            Self::Overloaded { retry_after_ms } => {
                write!(f, "overloaded: retry after {retry_after_ms} ms")
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::Overloaded { retry_after_ms } => json!({
                "code": self.code(),
                "message": "ingress queue full",
                "retry_after_ms": retry_after_ms,
            }),
            ApiError::Internal(detail) => {
                // Log the detail server-side; callers only see the kind.
                error!(detail = %detail, "internal error");
                json!({
                    "code": self.code(),
                    "message": "internal error",
                })
            }
            ApiError::InvalidInput(msg)
            | ApiError::Unauthenticated(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::UpstreamTimeout(msg) => json!({
                "code": self.code(),
                "message": msg,
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::Overloaded { retry_after_ms } = self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
