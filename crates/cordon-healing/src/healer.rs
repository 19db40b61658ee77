//! Healer: policy ladders and action selection.
//!
//! Each diagnosis kind has a default ladder of progressively stronger
//! actions, always terminating in `ResetAgent`. Selection removes actions
//! that already failed for the agent, then reorders the remainder by global
//! success count (ties keep ladder order), and returns the head.

use std::sync::Arc;
use std::time::Duration;

use cordon_core::prelude::*;
use tracing::{info, warn};

use crate::executor::{ExecutionOutcome, HealingExecutor};
use crate::memory::ImmuneMemory;

use cordon_core::types::HealingAction::*;

/// Default policy ladder for a diagnosis kind. Every ladder ends in
/// `ResetAgent`.
pub fn policy_ladder(kind: DiagnosisKind) -> &'static [HealingAction] {
    match kind {
        DiagnosisKind::PromptDrift => &[ResetMemory, RollbackPrompt, ReduceAutonomy, ResetAgent],
        DiagnosisKind::PromptInjection => &[RevokeTools, ResetMemory, RollbackPrompt, ResetAgent],
        DiagnosisKind::InfiniteLoop => &[RevokeTools, ReduceAutonomy, ResetMemory, ResetAgent],
        DiagnosisKind::ToolInstability => &[ReduceAutonomy, RollbackPrompt, ResetAgent],
        DiagnosisKind::MemoryCorruption => &[ResetMemory, ResetAgent],
        DiagnosisKind::CostOverrun => &[ReduceAutonomy, RollbackPrompt, ResetMemory, ResetAgent],
        DiagnosisKind::ExternalCause => &[ReduceAutonomy, ResetAgent],
        DiagnosisKind::Unknown => &[ResetMemory, ReduceAutonomy, ResetAgent],
    }
}

/// Applies healing actions through an executor, consulting immune memory.
#[derive(Debug)]
pub struct Healer {
    memory: Arc<ImmuneMemory>,
    executor: Arc<dyn HealingExecutor>,
    action_timeout: Duration,
}

impl Healer {
    pub fn new(
        memory: Arc<ImmuneMemory>,
        executor: Arc<dyn HealingExecutor>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            memory,
            executor,
            action_timeout,
        }
    }

    pub fn memory(&self) -> &Arc<ImmuneMemory> {
        &self.memory
    }

    /// Next action for (agent, diagnosis): ladder minus failed actions,
    /// reordered by descending global success. `None` means this ladder is
    /// exhausted for the agent.
    pub async fn next_action(
        &self,
        agent_id: &str,
        diagnosis: DiagnosisKind,
    ) -> Option<HealingAction> {
        let failed = self.memory.failed_actions(agent_id, diagnosis).await;
        let ladder = policy_ladder(diagnosis);

        let mut candidates: Vec<HealingAction> = ladder
            .iter()
            .copied()
            .filter(|a| !failed.contains(a))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let ranked = self.memory.global_success(diagnosis);
        let success_count = |action: HealingAction| -> u64 {
            ranked
                .iter()
                .find(|(a, _)| *a == action)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        // Stable sort keeps ladder order among equal counts.
        candidates.sort_by(|a, b| success_count(*b).cmp(&success_count(*a)));
        Some(candidates[0])
    }

    /// Execute one action with the per-action deadline. Timeouts and
    /// transport failures come back as failed outcomes; the caller records
    /// the result and advances the ladder.
    pub async fn apply(&self, agent_id: &str, action: HealingAction) -> ExecutionOutcome {
        info!(agent = agent_id, %action, executor = self.executor.name(), "applying healing action");
        metrics::counter!(
            "cordon_healing_attempts_total",
            "action" => action.as_str()
        )
        .increment(1);

        match tokio::time::timeout(self.action_timeout, self.executor.execute(agent_id, action))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(agent = agent_id, %action, error = %e, "healing action errored");
                ExecutionOutcome::failed(e.to_string())
            }
            Err(_) => {
                let e = Error::ExecutorTimeout(self.action_timeout);
                warn!(agent = agent_id, %action, error = %e, "healing action timed out");
                ExecutionOutcome::failed(e.to_string())
            }
        }
    }
}
