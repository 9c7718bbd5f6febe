//! HTTP route wiring.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::orchestrator::Orchestrator;

use super::control;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn serve(config: Config, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let state = Arc::new(AppState { orchestrator });

    let app = Router::new()
        .route("/api/health", get(control::health))
        .route("/api/sessions", get(control::list_sessions))
        .route("/api/sessions/:id/abort", post(control::abort_session))
        .route("/api/orchestrator/abort", post(control::abort_orchestrator))
        .route("/api/safety", get(control::safety_counters))
        .route("/api/safety/reset", post(control::reset_circuit_break))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for SIGTERM/SIGINT and stop the orchestrator before the server.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    state.orchestrator.shutdown();
    state.orchestrator.drain().await;
}
