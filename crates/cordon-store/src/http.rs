//! Remote HTTP store binding.
//!
//! Speaks a narrow JSON protocol against a store service; every request
//! carries the run id so the server can partition data per run. Transport
//! failures surface as `Error::Store` and callers continue on the next tick.

use std::time::Duration;

use async_trait::async_trait;
use cordon_core::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::Store;

/// Remote store configuration.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL, e.g. `http://store:8086`.
    pub base_url: String,
    /// Bearer token, when the store requires one.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP-backed store handle.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    config: HttpStoreConfig,
    run_id: String,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig, run_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("http store client: {e}")))?;
        Ok(Self {
            client,
            config,
            run_id: run_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/store/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let req = self
            .client
            .post(self.url(path))
            .query(&[("run_id", self.run_id.as_str())])
            .json(body);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::store(format!("POST {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::store(format!("POST {path}: HTTP {}", resp.status())));
        }
        debug!(path, run_id = %self.run_id, "store write ok");
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let mut params: Vec<(&str, String)> = vec![("run_id", self.run_id.clone())];
        params.extend_from_slice(query);
        let req = self.client.get(self.url(path)).query(&params);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| Error::store(format!("GET {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::store(format!("GET {path}: HTTP {}", resp.status())));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::store(format!("GET {path}: decode: {e}")))
    }
}

#[async_trait]
impl Store for HttpStore {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn write_agent_vitals(&self, vitals: &AgentVitals) -> Result<()> {
        self.post("vitals", vitals).await
    }

    async fn get_recent_agent_vitals(
        &self,
        agent_id: &str,
        window: Duration,
    ) -> Result<Vec<AgentVitals>> {
        self.get(
            "vitals/recent",
            &[
                ("agent_id", agent_id.to_string()),
                ("window_s", window.as_secs().to_string()),
            ],
        )
        .await
    }

    async fn get_latest_agent_vitals(&self, agent_id: &str) -> Result<Option<AgentVitals>> {
        self.get("vitals/latest", &[("agent_id", agent_id.to_string())])
            .await
    }

    async fn get_total_executions(&self) -> Result<u64> {
        self.get("vitals/total", &[]).await
    }

    async fn write_baseline_profile(&self, profile: &serde_json::Value) -> Result<()> {
        self.post("baselines", profile).await
    }

    async fn get_baseline_profile(&self, agent_id: &str) -> Result<Option<serde_json::Value>> {
        self.get("baselines/latest", &[("agent_id", agent_id.to_string())])
            .await
    }

    async fn write_infection_event(&self, report: &InfectionReport) -> Result<()> {
        self.post("infections", report).await
    }

    async fn write_quarantine_event(&self, event: &QuarantineEvent) -> Result<()> {
        self.post("quarantine", event).await
    }

    async fn write_approval_event(&self, event: &ApprovalEvent) -> Result<()> {
        self.post("approvals", event).await
    }

    async fn get_latest_approval_state(&self, agent_id: &str) -> Result<Option<ApprovalEvent>> {
        self.get("approvals/latest", &[("agent_id", agent_id.to_string())])
            .await
    }

    async fn get_pending_approvals(&self) -> Result<Vec<ApprovalEvent>> {
        self.get("approvals/pending", &[]).await
    }

    async fn get_rejected_approvals(&self) -> Result<Vec<ApprovalEvent>> {
        self.get("approvals/rejected", &[]).await
    }

    async fn write_healing_event(&self, event: &HealingEvent) -> Result<()> {
        self.post("healings", event).await
    }

    async fn get_failed_actions(
        &self,
        agent_id: &str,
        diagnosis: DiagnosisKind,
    ) -> Result<Vec<HealingAction>> {
        self.get(
            "healings/failed",
            &[
                ("agent_id", agent_id.to_string()),
                ("diagnosis", diagnosis.to_string()),
            ],
        )
        .await
    }

    async fn write_action_log(&self, entry: &ActionLogEntry) -> Result<()> {
        self.post("actions", entry).await
    }

    async fn get_recent_action_log(&self, limit: usize) -> Result<Vec<ActionLogEntry>> {
        self.get("actions/recent", &[("limit", limit.to_string())])
            .await
    }
}
