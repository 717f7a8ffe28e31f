// =============================================================================
// Helmsman — an adaptive traffic control plane for instrumented services
// =============================================================================
//
// Server side: signal ingestion, per-endpoint aggregation, policy derivation
// (caching, circuit breaking, rate limits, deferral, shedding) and SSE
// streaming for operators. Client side: the `client` module, embedded in
// host services to resolve policies and enforce the per-request mechanics.
// =============================================================================

pub mod aggregate;
pub mod analytics;
pub mod api;
pub mod app_state;
pub mod archive;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod policy;
pub mod signal_store;
pub mod types;
