//! # Cordon Store
//!
//! Persistence for the control plane:
//! - the [`Store`] trait — the only wire protocol the core requires
//! - an in-memory reference implementation for tests and single-node runs
//! - a remote HTTP binding
//! - the restart-resilience cache (local JSON snapshot)
//!
//! Every operation is scoped by a `run_id` so repeated runs are isolated.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod cache;
pub mod http;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use cordon_core::prelude::*;

/// Abstract persistence contract.
///
/// All writes are best-effort from the pipeline's point of view: callers log
/// and continue on failure. Workflow state (approvals, quarantine, healing)
/// is event-sourced; the latest event per agent is the current state.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Run id this handle writes and reads under.
    fn run_id(&self) -> &str;

    async fn write_agent_vitals(&self, vitals: &AgentVitals) -> Result<()>;
    async fn get_recent_agent_vitals(
        &self,
        agent_id: &str,
        window: Duration,
    ) -> Result<Vec<AgentVitals>>;
    async fn get_latest_agent_vitals(&self, agent_id: &str) -> Result<Option<AgentVitals>>;
    async fn get_total_executions(&self) -> Result<u64>;

    async fn write_baseline_profile(&self, profile: &serde_json::Value) -> Result<()>;
    async fn get_baseline_profile(&self, agent_id: &str) -> Result<Option<serde_json::Value>>;

    async fn write_infection_event(&self, report: &InfectionReport) -> Result<()>;
    async fn write_quarantine_event(&self, event: &QuarantineEvent) -> Result<()>;

    async fn write_approval_event(&self, event: &ApprovalEvent) -> Result<()>;
    async fn get_latest_approval_state(&self, agent_id: &str) -> Result<Option<ApprovalEvent>>;
    async fn get_pending_approvals(&self) -> Result<Vec<ApprovalEvent>>;
    async fn get_rejected_approvals(&self) -> Result<Vec<ApprovalEvent>>;

    async fn write_healing_event(&self, event: &HealingEvent) -> Result<()>;
    async fn get_failed_actions(
        &self,
        agent_id: &str,
        diagnosis: DiagnosisKind,
    ) -> Result<Vec<HealingAction>>;

    async fn write_action_log(&self, entry: &ActionLogEntry) -> Result<()>;
    async fn get_recent_action_log(&self, limit: usize) -> Result<Vec<ActionLogEntry>>;
}

/// Re-export of commonly used items.
pub mod prelude {
    pub use crate::cache::{CacheManager, CacheSnapshot};
    pub use crate::http::{HttpStore, HttpStoreConfig};
    pub use crate::memory::MemoryStore;
    pub use crate::Store;
}
