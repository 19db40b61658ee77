//! In-memory reference store.
//!
//! Backs tests and single-node runs. A shared backend can be cloned into
//! handles with different run ids to exercise run isolation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cordon_core::prelude::*;

use crate::Store;

#[derive(Debug, Default)]
struct RunData {
    vitals: HashMap<String, Vec<AgentVitals>>,
    total_executions: u64,
    baselines: HashMap<String, serde_json::Value>,
    infections: Vec<InfectionReport>,
    quarantine_events: Vec<QuarantineEvent>,
    approval_events: Vec<ApprovalEvent>,
    healing_events: Vec<HealingEvent>,
    action_log: Vec<ActionLogEntry>,
}

#[derive(Debug, Default)]
struct Backend {
    runs: HashMap<String, RunData>,
}

/// In-memory store handle scoped to one run id.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    backend: Arc<Mutex<Backend>>,
    run_id: String,
}

impl MemoryStore {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Backend::default())),
            run_id: run_id.into(),
        }
    }

    /// A handle onto the same backend under a different run id.
    pub fn with_run_id(&self, run_id: impl Into<String>) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            run_id: run_id.into(),
        }
    }

    fn with_run<T>(&self, f: impl FnOnce(&mut RunData) -> T) -> T {
        let mut backend = self.backend.lock().expect("memory store poisoned");
        let run = backend.runs.entry(self.run_id.clone()).or_default();
        f(run)
    }

    /// Number of infection reports written under this run id.
    pub fn infection_count(&self) -> usize {
        self.with_run(|r| r.infections.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("run-local")
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn write_agent_vitals(&self, vitals: &AgentVitals) -> Result<()> {
        self.with_run(|r| {
            r.vitals
                .entry(vitals.agent_id.clone())
                .or_default()
                .push(vitals.clone());
            r.total_executions += 1;
        });
        Ok(())
    }

    async fn get_recent_agent_vitals(
        &self,
        agent_id: &str,
        window: Duration,
    ) -> Result<Vec<AgentVitals>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(10));
        Ok(self.with_run(|r| {
            r.vitals
                .get(agent_id)
                .map(|v| {
                    v.iter()
                        .filter(|s| s.timestamp >= cutoff)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn get_latest_agent_vitals(&self, agent_id: &str) -> Result<Option<AgentVitals>> {
        Ok(self.with_run(|r| r.vitals.get(agent_id).and_then(|v| v.last().cloned())))
    }

    async fn get_total_executions(&self) -> Result<u64> {
        Ok(self.with_run(|r| r.total_executions))
    }

    async fn write_baseline_profile(&self, profile: &serde_json::Value) -> Result<()> {
        let agent_id = profile
            .get("agent_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::bad_input("baseline profile missing agent_id"))?
            .to_string();
        self.with_run(|r| r.baselines.insert(agent_id, profile.clone()));
        Ok(())
    }

    async fn get_baseline_profile(&self, agent_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.with_run(|r| r.baselines.get(agent_id).cloned()))
    }

    async fn write_infection_event(&self, report: &InfectionReport) -> Result<()> {
        self.with_run(|r| r.infections.push(report.clone()));
        Ok(())
    }

    async fn write_quarantine_event(&self, event: &QuarantineEvent) -> Result<()> {
        self.with_run(|r| r.quarantine_events.push(event.clone()));
        Ok(())
    }

    async fn write_approval_event(&self, event: &ApprovalEvent) -> Result<()> {
        self.with_run(|r| r.approval_events.push(event.clone()));
        Ok(())
    }

    async fn get_latest_approval_state(&self, agent_id: &str) -> Result<Option<ApprovalEvent>> {
        Ok(self.with_run(|r| {
            r.approval_events
                .iter()
                .rev()
                .find(|e| e.agent_id == agent_id)
                .cloned()
        }))
    }

    async fn get_pending_approvals(&self) -> Result<Vec<ApprovalEvent>> {
        Ok(self.latest_with_status(ApprovalStatus::Pending))
    }

    async fn get_rejected_approvals(&self) -> Result<Vec<ApprovalEvent>> {
        Ok(self.latest_with_status(ApprovalStatus::Rejected))
    }

    async fn write_healing_event(&self, event: &HealingEvent) -> Result<()> {
        self.with_run(|r| r.healing_events.push(event.clone()));
        Ok(())
    }

    async fn get_failed_actions(
        &self,
        agent_id: &str,
        diagnosis: DiagnosisKind,
    ) -> Result<Vec<HealingAction>> {
        Ok(self.with_run(|r| {
            let mut out = Vec::new();
            for e in &r.healing_events {
                if e.agent_id == agent_id && e.diagnosis == diagnosis && !e.success {
                    if !out.contains(&e.action) {
                        out.push(e.action);
                    }
                }
            }
            out
        }))
    }

    async fn write_action_log(&self, entry: &ActionLogEntry) -> Result<()> {
        self.with_run(|r| r.action_log.push(entry.clone()));
        Ok(())
    }

    async fn get_recent_action_log(&self, limit: usize) -> Result<Vec<ActionLogEntry>> {
        Ok(self.with_run(|r| {
            let start = r.action_log.len().saturating_sub(limit);
            r.action_log[start..].to_vec()
        }))
    }
}

impl MemoryStore {
    /// Latest-per-agent approval events currently in `status`.
    fn latest_with_status(&self, status: ApprovalStatus) -> Vec<ApprovalEvent> {
        self.with_run(|r| {
            let mut latest: HashMap<String, &ApprovalEvent> = HashMap::new();
            for e in &r.approval_events {
                latest.insert(e.agent_id.clone(), e);
            }
            let mut out: Vec<ApprovalEvent> = latest
                .into_values()
                .filter(|e| e.status == status)
                .cloned()
                .collect();
            out.sort_by_key(|e| e.created_at);
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    fn vitals(agent: &str) -> AgentVitals {
        AgentVitals {
            agent_id: agent.to_string(),
            timestamp: Utc::now(),
            latency_ms: 100.0,
            input_tokens: 500,
            output_tokens: 500,
            token_count: 1000,
            tool_calls: 2,
            retries: 0,
            success: true,
            cost: 0.01,
            model: "gpt-4o".to_string(),
            error_type: VitalError::None,
            prompt_hash: "ab12cd34".to_string(),
            agent_type: None,
            mcp_servers: Vec::new(),
        }
    }

    fn report(agent: &str) -> InfectionReport {
        InfectionReport {
            agent_id: agent.to_string(),
            deviations: BTreeMap::new(),
            max_deviation: 6.0,
            anomalies: BTreeSet::from([AnomalyKind::TokenSpike]),
            prompt_changed: false,
            at: Utc::now(),
        }
    }

    fn approval(agent: &str, status: ApprovalStatus) -> ApprovalEvent {
        ApprovalEvent {
            agent_id: agent.to_string(),
            status,
            max_deviation: 6.0,
            report: report(agent),
            diagnosis: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    #[tokio::test]
    async fn vitals_round_trip() {
        let store = MemoryStore::new("run-a");
        store.write_agent_vitals(&vitals("a1")).await.unwrap();
        store.write_agent_vitals(&vitals("a1")).await.unwrap();

        let recent = store
            .get_recent_agent_vitals("a1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(store.get_total_executions().await.unwrap(), 2);
        assert!(store.get_latest_agent_vitals("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn runs_are_isolated() {
        let a = MemoryStore::new("run-a");
        let b = a.with_run_id("run-b");

        a.write_agent_vitals(&vitals("a1")).await.unwrap();
        assert_eq!(a.get_total_executions().await.unwrap(), 1);
        assert_eq!(b.get_total_executions().await.unwrap(), 0);
        assert!(b.get_latest_agent_vitals("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approval_state_is_latest_event() {
        let store = MemoryStore::new("run-a");
        store
            .write_approval_event(&approval("a1", ApprovalStatus::Pending))
            .await
            .unwrap();
        assert_eq!(store.get_pending_approvals().await.unwrap().len(), 1);

        store
            .write_approval_event(&approval("a1", ApprovalStatus::Rejected))
            .await
            .unwrap();
        assert!(store.get_pending_approvals().await.unwrap().is_empty());
        assert_eq!(store.get_rejected_approvals().await.unwrap().len(), 1);

        let latest = store.get_latest_approval_state("a1").await.unwrap().unwrap();
        assert_eq!(latest.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn failed_actions_are_per_agent_and_diagnosis() {
        let store = MemoryStore::new("run-a");
        let mut event = HealingEvent {
            agent_id: "a1".to_string(),
            diagnosis: DiagnosisKind::PromptInjection,
            action: HealingAction::RevokeTools,
            success: false,
            message: "failed".to_string(),
            at: Utc::now(),
        };
        store.write_healing_event(&event).await.unwrap();
        event.action = HealingAction::ResetMemory;
        store.write_healing_event(&event).await.unwrap();
        event.action = HealingAction::RollbackPrompt;
        event.success = true;
        store.write_healing_event(&event).await.unwrap();

        let failed = store
            .get_failed_actions("a1", DiagnosisKind::PromptInjection)
            .await
            .unwrap();
        assert_eq!(
            failed,
            vec![HealingAction::RevokeTools, HealingAction::ResetMemory]
        );
        assert!(store
            .get_failed_actions("a1", DiagnosisKind::PromptDrift)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_failed_actions("a2", DiagnosisKind::PromptInjection)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn action_log_is_bounded_by_limit() {
        let store = MemoryStore::new("run-a");
        for i in 0..10 {
            store
                .write_action_log(&ActionLogEntry::new(format!("k{i}"), "a1"))
                .await
                .unwrap();
        }
        let recent = store.get_recent_action_log(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].kind, "k9");
    }
}
