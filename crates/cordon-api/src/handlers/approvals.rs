//! Approval actions and diagnosis feedback.
//!
//! Approval decisions never fail silently: an action that does not apply
//! (no pending/rejected entry for the agent) returns 409 with a reason.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use cordon_core::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error_response, ApiState, DashboardResponse, ErrorBody};

/// GET /api/v1/approvals/pending
pub async fn pending(State(state): State<ApiState>) -> Response {
    match state.orchestrator.pending_approvals().await {
        Ok(data) => Json(DashboardResponse {
            data,
            degraded: state.orchestrator.degraded(),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/v1/approvals/rejected
pub async fn rejected(State(state): State<ApiState>) -> Response {
    match state.orchestrator.rejected_approvals().await {
        Ok(data) => Json(DashboardResponse {
            data,
            degraded: state.orchestrator.degraded(),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

fn decision_response(applied: bool, agent_id: &str, action: &str) -> Response {
    if applied {
        Json(serde_json::json!({ "agent_id": agent_id, "action": action })).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: "not_applicable",
                message: format!("{action} does not apply to agent {agent_id}"),
            }),
        )
            .into_response()
    }
}

/// POST /api/v1/approvals/:id/approve
pub async fn approve(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.approve(&id).await {
        Ok(applied) => decision_response(applied, &id, "approve"),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/approvals/:id/reject
pub async fn reject(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.reject(&id).await {
        Ok(applied) => decision_response(applied, &id, "reject"),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/approvals/:id/heal-now
pub async fn heal_now(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.heal_now(&id).await {
        Ok(applied) => decision_response(applied, &id, "heal-now"),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct BulkResponse {
    agents: Vec<String>,
}

/// POST /api/v1/approvals/approve-all
pub async fn approve_all(State(state): State<ApiState>) -> Response {
    match state.orchestrator.approve_all().await {
        Ok(agents) => Json(BulkResponse { agents }).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/approvals/reject-all
pub async fn reject_all(State(state): State<ApiState>) -> Response {
    match state.orchestrator.reject_all().await {
        Ok(agents) => Json(BulkResponse { agents }).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/approvals/heal-all
pub async fn heal_all(State(state): State<ApiState>) -> Response {
    match state.orchestrator.heal_all_rejected().await {
        Ok(agents) => Json(BulkResponse { agents }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Feedback request body.
#[derive(Debug, Deserialize)]
pub(crate) struct FeedbackRequest {
    agent_id: String,
    diagnosis_kind_actual: DiagnosisKind,
    label: FeedbackLabel,
}

/// POST /api/v1/feedback
pub async fn feedback(State(state): State<ApiState>, body: axum::body::Bytes) -> Response {
    let request: FeedbackRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(cordon_core::Error::bad_input(format!(
                "invalid feedback: {e}"
            )))
        }
    };
    info!(agent = %request.agent_id, kind = %request.diagnosis_kind_actual, "feedback received");
    state
        .orchestrator
        .submit_feedback(DiagnosisFeedback {
            agent_id: request.agent_id,
            kind: request.diagnosis_kind_actual,
            label: request.label,
            at: Utc::now(),
        })
        .await;
    StatusCode::NO_CONTENT.into_response()
}
