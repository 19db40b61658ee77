//! Agent lifecycle state machine.
//!
//! Transitions move only along allowed edges; every transition is recorded
//! in a bounded history ring. The per-agent record carries the current
//! phase, entry time and the suspect/clean/probation tick counters the
//! orchestrator consults on each scan.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cordon_core::prelude::*;
use dashmap::DashMap;
use tracing::{info, warn};

const HISTORY_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
struct AgentRecord {
    phase: AgentPhase,
    entered_at: DateTime<Utc>,
    /// Consecutive anomalous scans in SUSPECTED.
    anomaly_ticks: u32,
    /// Consecutive clean scans in SUSPECTED.
    clean_ticks: u32,
    /// Clean scans accumulated in PROBATION.
    probation_ticks: u32,
}

impl Default for AgentRecord {
    fn default() -> Self {
        Self {
            phase: AgentPhase::Initializing,
            entered_at: Utc::now(),
            anomaly_ticks: 0,
            clean_ticks: 0,
            probation_ticks: 0,
        }
    }
}

fn allowed(from: AgentPhase, to: AgentPhase) -> bool {
    use cordon_core::types::AgentPhase::*;
    matches!(
        (from, to),
        (Initializing, Healthy)
            | (Healthy, Suspected)
            | (Healthy, Draining)
            | (Suspected, Healthy)
            | (Suspected, Draining)
            | (Draining, Quarantined)
            | (Quarantined, Healing)
            | (Healing, Probation)
            | (Healing, Exhausted)
            | (Probation, Healthy)
            | (Probation, Healing)
            | (Exhausted, Healing)
    )
}

/// Lifecycle phases for every known agent.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    records: DashMap<String, AgentRecord>,
    history: Mutex<VecDeque<TransitionEvent>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent in INITIALIZING if unknown.
    pub fn register(&self, agent_id: &str) {
        self.records
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::default);
    }

    pub fn phase(&self, agent_id: &str) -> AgentPhase {
        self.records
            .get(agent_id)
            .map(|r| r.phase)
            .unwrap_or(AgentPhase::Initializing)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    pub fn agents_in(&self, phase: AgentPhase) -> Vec<String> {
        self.records
            .iter()
            .filter(|e| e.value().phase == phase)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Attempt a transition. Disallowed edges return `Error::Lifecycle` and
    /// leave the record untouched.
    pub fn transition(
        &self,
        agent_id: &str,
        to: AgentPhase,
        reason: &str,
    ) -> Result<TransitionEvent> {
        let mut record = self
            .records
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::default);

        let from = record.phase;
        if !allowed(from, to) {
            warn!(agent = agent_id, %from, %to, reason, "transition denied");
            return Err(Error::Lifecycle(format!(
                "{agent_id}: {from} -> {to} is not an allowed edge"
            )));
        }

        record.phase = to;
        record.entered_at = Utc::now();
        match to {
            AgentPhase::Suspected => {
                record.anomaly_ticks = 1;
                record.clean_ticks = 0;
            }
            AgentPhase::Probation => record.probation_ticks = 0,
            _ => {}
        }
        drop(record);

        let event = TransitionEvent {
            agent_id: agent_id.to_string(),
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        info!(agent = agent_id, %from, %to, reason, "lifecycle transition");
        metrics::counter!(
            "cordon_lifecycle_transitions_total",
            "to" => to.as_str()
        )
        .increment(1);

        let mut history = self.history.lock().expect("lifecycle history poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(event.clone());
        Ok(event)
    }

    /// Record one anomalous scan for a SUSPECTED agent; returns the
    /// consecutive anomalous count.
    pub fn record_anomaly_tick(&self, agent_id: &str) -> u32 {
        let mut record = self
            .records
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::default);
        record.clean_ticks = 0;
        record.anomaly_ticks = record.anomaly_ticks.saturating_add(1);
        record.anomaly_ticks
    }

    /// Record a fleet-attributed anomalous scan for a SUSPECTED agent:
    /// the clean streak restarts, but nothing accrues toward the
    /// suspect-tick escalation. Fleet-wide noise is never evidence
    /// against an individual agent.
    pub fn record_fleet_wide_tick(&self, agent_id: &str) {
        let mut record = self
            .records
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::default);
        record.clean_ticks = 0;
    }

    /// Record one clean scan for a SUSPECTED agent; returns the consecutive
    /// clean count.
    pub fn record_clean_tick(&self, agent_id: &str) -> u32 {
        let mut record = self
            .records
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::default);
        record.anomaly_ticks = 0;
        record.clean_ticks = record.clean_ticks.saturating_add(1);
        record.clean_ticks
    }

    /// Record one clean probation scan; returns the accumulated count.
    pub fn record_probation_tick(&self, agent_id: &str) -> u32 {
        let mut record = self
            .records
            .entry(agent_id.to_string())
            .or_insert_with(AgentRecord::default);
        record.probation_ticks = record.probation_ticks.saturating_add(1);
        record.probation_ticks
    }

    /// Transition history, optionally filtered by agent.
    pub fn history(&self, agent_id: Option<&str>) -> Vec<TransitionEvent> {
        let history = self.history.lock().expect("lifecycle history poisoned");
        match agent_id {
            Some(id) => history.iter().filter(|e| e.agent_id == id).cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }

    /// Time the agent entered its current phase.
    pub fn entered_at(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.records.get(agent_id).map(|r| r.entered_at)
    }
}
