//! Route table.
//!
//! ```text
//! POST /api/v1/vitals                  ingest (auth)
//! POST /api/v1/gateway/vitals          gateway extraction hook (auth)
//! GET  /api/v1/status                  run status
//! GET  /api/v1/agents                  fleet summary
//! GET  /api/v1/agents/:id/vitals       recent vitals
//! GET  /api/v1/agents/:id/baseline     baseline profile
//! GET  /api/v1/stats                   fleet statistics
//! GET  /api/v1/approvals/pending       pending approvals
//! GET  /api/v1/approvals/rejected      rejected approvals
//! POST /api/v1/approvals/:id/approve   approve one
//! POST /api/v1/approvals/:id/reject    reject one
//! POST /api/v1/approvals/:id/heal-now  heal-now one
//! POST /api/v1/approvals/approve-all   bulk approve
//! POST /api/v1/approvals/reject-all    bulk reject
//! POST /api/v1/approvals/heal-all      bulk heal-now
//! GET  /api/v1/healings/recent         recent action log
//! GET  /api/v1/patterns                learned healing patterns
//! POST /api/v1/feedback                diagnosis feedback
//! GET  /health                         liveness
//! GET  /metrics                        Prometheus render
//! ```

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{approvals, dashboard, ingest};
use crate::{middleware, ApiConfig, ApiState};

pub fn router(state: ApiState, config: &ApiConfig) -> Router {
    let ingest_routes = Router::new()
        .route("/vitals", post(ingest::ingest_vitals))
        .route("/gateway/vitals", post(ingest::ingest_gateway))
        .layer(from_fn_with_state(state.clone(), middleware::require_api_key));

    let read_routes = Router::new()
        .route("/status", get(dashboard::status))
        .route("/agents", get(dashboard::agents))
        .route("/agents/:id/vitals", get(dashboard::agent_vitals))
        .route("/agents/:id/baseline", get(dashboard::agent_baseline))
        .route("/stats", get(dashboard::stats))
        .route("/approvals/pending", get(approvals::pending))
        .route("/approvals/rejected", get(approvals::rejected))
        .route("/healings/recent", get(dashboard::recent_actions))
        .route("/patterns", get(dashboard::patterns));

    let action_routes = Router::new()
        .route("/approvals/:id/approve", post(approvals::approve))
        .route("/approvals/:id/reject", post(approvals::reject))
        .route("/approvals/:id/heal-now", post(approvals::heal_now))
        .route("/approvals/approve-all", post(approvals::approve_all))
        .route("/approvals/reject-all", post(approvals::reject_all))
        .route("/approvals/heal-all", post(approvals::heal_all))
        .route("/feedback", post(approvals::feedback));

    let api_v1 = ingest_routes.merge(read_routes).merge(action_routes);

    Router::new()
        .nest("/api/v1", api_v1)
        .route("/health", get(dashboard::health))
        .route("/metrics", get(dashboard::metrics_render))
        .layer(TimeoutLayer::new(config.timeout))
        .with_state(state)
}
