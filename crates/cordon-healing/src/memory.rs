//! Immune memory.
//!
//! Remembers every healing outcome so the system never repeats an action
//! that already failed for the same agent and diagnosis, and prefers
//! actions that worked across the fleet. Outcomes are written through to
//! the store as healing events; the local maps are a mirror that can be
//! rebuilt from those events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use cordon_core::prelude::*;
use cordon_store::Store;
use dashmap::DashMap;
use tracing::warn;

/// Aggregate outcome counts for one (diagnosis, action) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeCounts {
    pub success: u64,
    pub failure: u64,
}

impl OutcomeCounts {
    pub fn rate(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            0.0
        } else {
            self.success as f64 / total as f64
        }
    }
}

/// Fleet-wide healing memory.
#[derive(Debug)]
pub struct ImmuneMemory {
    store: Option<Arc<dyn Store>>,
    /// (agent, diagnosis) -> actions that failed there.
    failed: DashMap<(String, DiagnosisKind), Vec<HealingAction>>,
    /// (diagnosis, action) -> global counts.
    global: Mutex<HashMap<(DiagnosisKind, HealingAction), OutcomeCounts>>,
    records: Mutex<Vec<HealingEvent>>,
    feedback: Mutex<Vec<DiagnosisFeedback>>,
}

impl ImmuneMemory {
    pub fn new(store: Option<Arc<dyn Store>>) -> Self {
        Self {
            store,
            failed: DashMap::new(),
            global: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            feedback: Mutex::new(Vec::new()),
        }
    }

    /// Keep operator feedback alongside healing outcomes so the full
    /// learning history lives in one place.
    pub fn record_feedback(&self, feedback: DiagnosisFeedback) {
        self.feedback
            .lock()
            .expect("immune memory poisoned")
            .push(feedback);
    }

    pub fn feedback_history(&self) -> Vec<DiagnosisFeedback> {
        self.feedback
            .lock()
            .expect("immune memory poisoned")
            .clone()
    }

    /// Record one healing outcome.
    pub async fn record_outcome(
        &self,
        agent_id: &str,
        diagnosis: DiagnosisKind,
        action: HealingAction,
        success: bool,
        message: impl Into<String>,
    ) {
        let event = HealingEvent {
            agent_id: agent_id.to_string(),
            diagnosis,
            action,
            success,
            message: message.into(),
            at: Utc::now(),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.write_healing_event(&event).await {
                warn!(agent = agent_id, error = %e, "healing event write failed");
            }
        }

        if !success {
            let mut entry = self
                .failed
                .entry((agent_id.to_string(), diagnosis))
                .or_default();
            if !entry.contains(&action) {
                entry.push(action);
            }
        }
        {
            let mut global = self.global.lock().expect("immune memory poisoned");
            let counts = global.entry((diagnosis, action)).or_default();
            if success {
                counts.success += 1;
            } else {
                counts.failure += 1;
            }
        }
        self.records
            .lock()
            .expect("immune memory poisoned")
            .push(event);

        metrics::counter!(
            "cordon_healing_outcomes_total",
            "diagnosis" => diagnosis.as_str(),
            "action" => action.as_str(),
            "success" => if success { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Actions that previously failed for this agent and diagnosis.
    /// Prefers the store (shared across restarts); falls back to the local
    /// mirror when the store is unreachable.
    pub async fn failed_actions(
        &self,
        agent_id: &str,
        diagnosis: DiagnosisKind,
    ) -> Vec<HealingAction> {
        if let Some(store) = &self.store {
            match store.get_failed_actions(agent_id, diagnosis).await {
                Ok(actions) => return actions,
                Err(e) => {
                    warn!(agent = agent_id, error = %e, "failed-action read failed, using mirror")
                }
            }
        }
        self.failed
            .get(&(agent_id.to_string(), diagnosis))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Actions with at least one global success for this diagnosis, sorted
    /// by success count descending.
    pub fn global_success(&self, diagnosis: DiagnosisKind) -> Vec<(HealingAction, u64)> {
        let global = self.global.lock().expect("immune memory poisoned");
        let mut out: Vec<(HealingAction, u64)> = global
            .iter()
            .filter(|((d, _), counts)| *d == diagnosis && counts.success > 0)
            .map(|((_, a), counts)| (*a, counts.success))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    /// Success rate for one (diagnosis, action) pair across all agents.
    pub fn success_rate(&self, diagnosis: DiagnosisKind, action: HealingAction) -> f64 {
        self.global
            .lock()
            .expect("immune memory poisoned")
            .get(&(diagnosis, action))
            .copied()
            .unwrap_or_default()
            .rate()
    }

    /// Best learned action per diagnosis, for the dashboard.
    pub fn pattern_summary(&self) -> HashMap<DiagnosisKind, (HealingAction, u64)> {
        let global = self.global.lock().expect("immune memory poisoned");
        let mut out: HashMap<DiagnosisKind, (HealingAction, u64)> = HashMap::new();
        for ((diagnosis, action), counts) in global.iter() {
            if counts.success == 0 {
                continue;
            }
            let entry = out.entry(*diagnosis).or_insert((*action, counts.success));
            if counts.success > entry.1 {
                *entry = (*action, counts.success);
            }
        }
        out
    }

    pub fn total_outcomes(&self) -> usize {
        self.records.lock().expect("immune memory poisoned").len()
    }

    pub fn overall_success_rate(&self) -> f64 {
        let records = self.records.lock().expect("immune memory poisoned");
        if records.is_empty() {
            return 0.0;
        }
        records.iter().filter(|r| r.success).count() as f64 / records.len() as f64
    }

    /// Healing history for one agent.
    pub fn history(&self, agent_id: &str) -> Vec<HealingEvent> {
        self.records
            .lock()
            .expect("immune memory poisoned")
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }
}
