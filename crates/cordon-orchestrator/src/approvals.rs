//! Approval queue operations and operator feedback.
//!
//! Workflow state is event-sourced through the store: the latest approval
//! event per agent is its current state. Decisions never fail silently; a
//! rejected decision always lands the agent in the rejected set, still
//! quarantined, until an operator triggers heal-now.

use std::sync::Arc;

use chrono::Utc;
use cordon_core::prelude::*;
use tracing::info;

use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Severe infections awaiting an operator decision.
    pub async fn pending_approvals(&self) -> Result<Vec<ApprovalEvent>> {
        self.store.get_pending_approvals().await
    }

    /// Agents whose healing was rejected; they stay quarantined.
    pub async fn rejected_approvals(&self) -> Result<Vec<ApprovalEvent>> {
        self.store.get_rejected_approvals().await
    }

    /// Approve healing for one agent. Returns false when the agent has no
    /// pending approval.
    pub async fn approve(self: &Arc<Self>, agent_id: &str) -> Result<bool> {
        let Some(latest) = self.store.get_latest_approval_state(agent_id).await? else {
            return Ok(false);
        };
        if latest.status != ApprovalStatus::Pending {
            return Ok(false);
        }

        let mut event = latest.clone();
        event.status = ApprovalStatus::Approved;
        event.decided_at = Some(Utc::now());
        self.store.write_approval_event(&event).await?;
        self.log_action("user_approved", agent_id, serde_json::Value::Null)
            .await;
        info!(agent = agent_id, "healing approved");

        let orchestrator = Arc::clone(self);
        let agent = agent_id.to_string();
        let report = latest.report;
        self.spawn_task(async move {
            orchestrator.heal_agent(agent, report, "user_approved").await;
        });
        Ok(true)
    }

    /// Reject healing for one agent; it stays quarantined until heal-now.
    pub async fn reject(&self, agent_id: &str) -> Result<bool> {
        let Some(latest) = self.store.get_latest_approval_state(agent_id).await? else {
            return Ok(false);
        };
        if latest.status != ApprovalStatus::Pending {
            return Ok(false);
        }

        let mut event = latest;
        event.status = ApprovalStatus::Rejected;
        event.decided_at = Some(Utc::now());
        self.store.write_approval_event(&event).await?;
        self.log_action("user_rejected", agent_id, serde_json::Value::Null)
            .await;
        info!(agent = agent_id, "healing rejected, agent stays quarantined");
        Ok(true)
    }

    /// Explicit operator heal: lifts a rejection, or restarts the ladder
    /// walk for an EXHAUSTED agent.
    pub async fn heal_now(self: &Arc<Self>, agent_id: &str) -> Result<bool> {
        let latest = self.store.get_latest_approval_state(agent_id).await?;
        let report = match latest {
            Some(event) if event.status == ApprovalStatus::Rejected => {
                let mut heal_event = event.clone();
                heal_event.status = ApprovalStatus::HealNow;
                heal_event.decided_at = Some(Utc::now());
                self.store.write_approval_event(&heal_event).await?;
                event.report
            }
            _ if self.lifecycle.phase(agent_id) == AgentPhase::Exhausted => {
                match self.session_report(agent_id) {
                    Some(report) => report,
                    None => return Ok(false),
                }
            }
            _ => return Ok(false),
        };

        self.log_action("heal_now", agent_id, serde_json::Value::Null)
            .await;
        info!(agent = agent_id, "explicit heal requested");

        let orchestrator = Arc::clone(self);
        let agent = agent_id.to_string();
        self.spawn_task(async move {
            orchestrator.heal_agent(agent, report, "heal_now").await;
        });
        Ok(true)
    }

    /// Approve every pending agent, in queue order. Returns the agent ids
    /// scheduled for healing.
    pub async fn approve_all(self: &Arc<Self>) -> Result<Vec<String>> {
        let pending = self.pending_approvals().await?;
        let mut approved = Vec::new();
        for event in pending {
            if self.approve(&event.agent_id).await? {
                approved.push(event.agent_id);
            }
        }
        Ok(approved)
    }

    /// Reject every pending agent.
    pub async fn reject_all(self: &Arc<Self>) -> Result<Vec<String>> {
        let pending = self.pending_approvals().await?;
        let mut rejected = Vec::new();
        for event in pending {
            if self.reject(&event.agent_id).await? {
                rejected.push(event.agent_id);
            }
        }
        Ok(rejected)
    }

    /// Heal-now every rejected agent.
    pub async fn heal_all_rejected(self: &Arc<Self>) -> Result<Vec<String>> {
        let rejected = self.rejected_approvals().await?;
        let mut healed = Vec::new();
        for event in rejected {
            if self.heal_now(&event.agent_id).await? {
                healed.push(event.agent_id);
            }
        }
        Ok(healed)
    }

    /// Operator feedback on a past diagnosis, forwarded to the
    /// Diagnostician.
    pub async fn submit_feedback(&self, feedback: DiagnosisFeedback) {
        self.log_action(
            "feedback",
            &feedback.agent_id.clone(),
            serde_json::json!({
                "diagnosis": feedback.kind.as_str(),
                "label": feedback.label,
            }),
        )
        .await;
        self.healer.memory().record_feedback(feedback.clone());
        self.diagnostician.record_feedback(feedback);
    }

    /// Recent healing/approval actions for the dashboard.
    pub async fn recent_actions(&self, limit: usize) -> Result<Vec<ActionLogEntry>> {
        self.store.get_recent_action_log(limit).await
    }

    /// Learned healing patterns: best action per diagnosis.
    pub fn learned_patterns(&self) -> Vec<(DiagnosisKind, HealingAction, u64)> {
        let mut out: Vec<(DiagnosisKind, HealingAction, u64)> = self
            .healer
            .memory()
            .pattern_summary()
            .into_iter()
            .map(|(diagnosis, (action, successes))| (diagnosis, action, successes))
            .collect();
        out.sort_by(|a, b| b.2.cmp(&a.2));
        out
    }
}
