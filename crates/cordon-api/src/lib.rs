//! # Cordon API
//!
//! The thin HTTP surface over the orchestrator:
//! - vitals ingest (direct and gateway-extracted), guarded by an API key
//!   when one is configured
//! - dashboard reads: status, agents, stats, approvals, recent actions,
//!   learned patterns
//! - approval actions and diagnosis feedback
//! - health and Prometheus metrics endpoints

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod handlers;
pub mod middleware;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cordon_core::Error;
use cordon_orchestrator::orchestrator::Orchestrator;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

/// API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Request timeout applied to every route.
    pub timeout: std::time::Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8800".parse().expect("valid default bind"),
            timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// Ingest requires `X-API-KEY` to match when set.
    pub api_key: Option<String>,
    pub prometheus: Option<PrometheusHandle>,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("auth", &self.api_key.is_some())
            .finish()
    }
}

/// Error body returned to clients; `error` is the stable kind label.
#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Wrapper for dashboard reads carrying the degraded-store flag.
#[derive(Debug, serde::Serialize)]
pub struct DashboardResponse<T: serde::Serialize> {
    pub data: T,
    pub degraded: bool,
}

/// Map a pipeline error onto an HTTP response.
pub fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::BadInput(_) | Error::Serde(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::NotReady(_) => StatusCode::CONFLICT,
        Error::Store(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorBody {
        error: err.kind(),
        message: err.to_string(),
    };
    (status, Json(body)).into_response()
}

/// Serve the API until the shutdown signal fires.
#[derive(Debug)]
pub struct ApiServer {
    config: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: ApiState) -> Self {
        Self { config, state }
    }

    pub async fn serve(
        self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> cordon_core::Result<()> {
        let router = routes::router(self.state, &self.config);
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::config(format!("bind {}: {e}", self.config.bind_addr)))?;
        info!(addr = %self.config.bind_addr, "API listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::config(format!("serve: {e}")))
    }
}
