// =============================================================================
// HTTP surface — REST endpoints, SSE streams, tenant authentication
// =============================================================================

pub mod auth;
pub mod rest;
pub mod sse;
