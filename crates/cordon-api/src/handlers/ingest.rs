//! Vitals ingest handlers.
//!
//! Responses: 204 stored, 202 accepted while the store is unreachable,
//! 400 malformed payload, 401 bad key (middleware). Unknown agent ids are
//! auto-registered.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cordon_core::prelude::*;
use cordon_core::Error;
use cordon_orchestrator::orchestrator::IngestOutcome;
use tracing::debug;

use crate::{error_response, ApiState};

fn outcome_response(outcome: IngestOutcome) -> Response {
    match outcome {
        IngestOutcome::Stored => StatusCode::NO_CONTENT.into_response(),
        IngestOutcome::Degraded => StatusCode::ACCEPTED.into_response(),
    }
}

/// Decode the body by hand so malformed payloads map to 400 with the
/// `bad_input` kind rather than a framework rejection.
fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::bad_input(format!("invalid payload: {e}")))
}

/// POST /api/v1/vitals
pub async fn ingest_vitals(State(state): State<ApiState>, body: axum::body::Bytes) -> Response {
    let vitals: AgentVitals = match decode(&body) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    debug!(agent = %vitals.agent_id, "vitals ingest");
    match state.orchestrator.ingest(vitals).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(e),
    }
}

/// POST /api/v1/gateway/vitals
///
/// Accepts a pre-built record derived from an LLM request/response pair by
/// the reverse proxy; semantics identical to direct ingest.
pub async fn ingest_gateway(State(state): State<ApiState>, body: axum::body::Bytes) -> Response {
    let exchange: GatewayExchange = match decode(&body) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    debug!(agent = %exchange.agent_id, "gateway vitals ingest");
    match state.orchestrator.ingest(exchange.into()).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(e),
    }
}
