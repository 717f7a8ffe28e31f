// =============================================================================
// helmsmand — Helmsman control-plane server entry point
// =============================================================================
//
// Exit codes: 0 on clean shutdown, 64 on configuration errors, 69 when the
// database is unavailable at startup, 70 for anything else fatal.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use helmsman::api::rest;
use helmsman::api::sse::run_stream_publisher;
use helmsman::app_state::AppState;
use helmsman::archive::{run_archive_loop, run_retention_sweep};
use helmsman::config::ServerConfig;
use helmsman::db::Db;
use helmsman::policy::engine::run_evaluation_loop;

/// Configuration problem (bad environment).
const EXIT_CONFIG: i32 = 64;
/// Database unavailable at startup.
const EXIT_UNAVAILABLE: i32 = 69;
/// Internal failure.
const EXIT_INTERNAL: i32 = 70;

fn main() {
    std::process::exit(run());
}

#[tokio::main]
async fn run() -> i32 {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Helmsman control plane starting up");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return EXIT_CONFIG;
        }
    };

    // ── 2. Database ──────────────────────────────────────────────────────
    let db = match Db::open(&config.db_url) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, db_url = %config.db_url, "database unavailable");
            return EXIT_UNAVAILABLE;
        }
    };

    // ── 3. Shared state ──────────────────────────────────────────────────
    let listen_addr = config.listen_addr.clone();
    let retention = config.retention();
    let state = match AppState::new(config, db) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "failed to initialise state");
            return EXIT_INTERNAL;
        }
    };

    // ── 4. Background loops ──────────────────────────────────────────────
    tokio::spawn(run_stream_publisher(state.clone()));
    tokio::spawn(run_evaluation_loop(state.clone()));
    tokio::spawn(run_archive_loop(
        state.aggregator.clone(),
        state.archive.clone(),
    ));
    tokio::spawn(run_retention_sweep(
        state.signals.clone(),
        state.aggregator.clone(),
        state.insights.clone(),
        retention,
    ));
    info!("background loops launched");

    // ── 5. API server ────────────────────────────────────────────────────
    let app = rest::router(state);
    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %listen_addr, "failed to bind listener");
            return EXIT_UNAVAILABLE;
        }
    };
    info!(addr = %listen_addr, "API server listening");

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await
    });

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {
                    warn!("API server stopped unexpectedly");
                    EXIT_INTERNAL
                }
                Ok(Err(err)) => {
                    error!(error = %err, "API server failed");
                    EXIT_INTERNAL
                }
                Err(err) => {
                    error!(error = %err, "API server task panicked");
                    EXIT_INTERNAL
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping");
            info!("Helmsman shut down complete");
            0
        }
    }
}
