//! Operator command handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::safety::SafetyCounters;
use crate::session::{SessionId, SessionView};

use super::routes::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub stopping: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        stopping: state.orchestrator.is_stopping(),
    })
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionView>> {
    Json(state.orchestrator.session_views().await)
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

pub async fn abort_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AbortResponse>, StatusCode> {
    let aborted = state.orchestrator.abort_session(SessionId::from(id)).await;
    if aborted {
        Ok(Json(AbortResponse { aborted: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

pub async fn abort_orchestrator(State(state): State<Arc<AppState>>) -> Json<AbortResponse> {
    state.orchestrator.shutdown();
    Json(AbortResponse { aborted: true })
}

pub async fn safety_counters(State(state): State<Arc<AppState>>) -> Json<SafetyCounters> {
    Json(state.orchestrator.monitor().counters())
}

pub async fn reset_circuit_break(State(state): State<Arc<AppState>>) -> Json<SafetyCounters> {
    state.orchestrator.monitor().clear_circuit_break();
    Json(state.orchestrator.monitor().counters())
}
