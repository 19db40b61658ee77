//! Request middleware: ingest API-key authentication.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::{error_response, ApiState};

/// Require `X-API-KEY` on ingest routes when a key is configured.
///
/// Key precedence (explicit config, cached, auto-generated) is resolved at
/// startup; this layer only compares.
pub async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        let presented = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return error_response(cordon_core::Error::Unauthorized);
        }
    }
    next.run(request).await
}
