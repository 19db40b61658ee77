//! Dashboard read handlers.
//!
//! Reads return best-available data; when the store is unreachable the
//! payload carries `degraded: true` and falls back to local state.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::{ApiState, DashboardResponse, ErrorBody};

#[derive(Debug, Serialize)]
pub(crate) struct StatusBody {
    run_id: String,
    now: chrono::DateTime<Utc>,
    degraded: bool,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> Response {
    let body = StatusBody {
        run_id: state.orchestrator.run_id().to_string(),
        now: Utc::now(),
        degraded: state.orchestrator.degraded(),
    };
    Json(body).into_response()
}

/// GET /api/v1/agents
pub async fn agents(State(state): State<ApiState>) -> Response {
    let data = state.orchestrator.agents_summary();
    Json(DashboardResponse {
        data,
        degraded: state.orchestrator.degraded(),
    })
    .into_response()
}

/// GET /api/v1/agents/:id/vitals
pub async fn agent_vitals(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let data = state.orchestrator.recent_vitals(&id).await;
    Json(DashboardResponse {
        data,
        degraded: state.orchestrator.degraded(),
    })
    .into_response()
}

/// GET /api/v1/agents/:id/baseline
pub async fn agent_baseline(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.baseline_profile(&id) {
        Some(profile) => Json(DashboardResponse {
            data: profile,
            degraded: state.orchestrator.degraded(),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "not_found",
                message: format!("no baseline for agent {id}"),
            }),
        )
            .into_response(),
    }
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> Response {
    Json(state.orchestrator.fleet_stats().await).into_response()
}

/// GET /api/v1/healings/recent
pub async fn recent_actions(State(state): State<ApiState>) -> Response {
    match state.orchestrator.recent_actions(50).await {
        Ok(data) => Json(DashboardResponse {
            data,
            degraded: state.orchestrator.degraded(),
        })
        .into_response(),
        Err(e) => crate::error_response(e),
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PatternRow {
    diagnosis: cordon_core::types::DiagnosisKind,
    best_action: cordon_core::types::HealingAction,
    successes: u64,
}

/// GET /api/v1/patterns
pub async fn patterns(State(state): State<ApiState>) -> Response {
    let data: Vec<PatternRow> = state
        .orchestrator
        .learned_patterns()
        .into_iter()
        .map(|(diagnosis, best_action, successes)| PatternRow {
            diagnosis,
            best_action,
            successes,
        })
        .collect();
    Json(DashboardResponse {
        data,
        degraded: state.orchestrator.degraded(),
    })
    .into_response()
}

/// GET /health
pub async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

/// GET /metrics
pub async fn metrics_render(State(state): State<ApiState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
