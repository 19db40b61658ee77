//! Event and report records shared across the pipeline and the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AnomalyKind, DiagnosisKind, FeedbackLabel, HealingAction, Metric};

/// Sentinel output: at least one metric exceeded the sigma threshold, or the
/// prompt hash changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfectionReport {
    pub agent_id: String,
    /// Deviation in sigma units for every tracked metric.
    pub deviations: BTreeMap<Metric, f64>,
    /// Maximum deviation across metrics, in sigma units.
    pub max_deviation: f64,
    pub anomalies: BTreeSet<AnomalyKind>,
    pub prompt_changed: bool,
    pub at: DateTime<Utc>,
}

impl InfectionReport {
    /// Anomaly carried by the metric with the largest deviation, falling
    /// back to `PromptChange` for hash-only reports. Used by the fleet
    /// correlator to compare incidents across agents.
    pub fn primary_anomaly(&self) -> Option<AnomalyKind> {
        let metric_primary = self
            .deviations
            .iter()
            .filter(|(m, _)| self.anomalies.contains(&m.anomaly_kind()))
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(m, _)| m.anomaly_kind());
        metric_primary.or(if self.prompt_changed {
            Some(AnomalyKind::PromptChange)
        } else {
            None
        })
    }

    pub fn has(&self, kind: AnomalyKind) -> bool {
        self.anomalies.contains(&kind)
    }
}

impl std::fmt::Display for InfectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.anomalies.iter().map(|a| a.as_str()).collect();
        write!(
            f,
            "infection[{}] max_dev={:.2}σ anomalies=[{}]",
            self.agent_id,
            self.max_deviation,
            kinds.join(", ")
        )
    }
}

/// One ranked root-cause hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub kind: DiagnosisKind,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// Ordered diagnosis: hypotheses sorted confidence-descending, one entry per
/// kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub agent_id: String,
    pub hypotheses: Vec<Hypothesis>,
    pub at: DateTime<Utc>,
}

impl DiagnosisResult {
    /// The highest-confidence hypothesis.
    pub fn primary(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }
}

/// Operator feedback on a past diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisFeedback {
    pub agent_id: String,
    pub kind: DiagnosisKind,
    pub label: FeedbackLabel,
    pub at: DateTime<Utc>,
}

/// Approval workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    HealNow,
}

/// One approval workflow event. The latest event per agent is the current
/// workflow state; the sequence is the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub agent_id: String,
    pub status: ApprovalStatus,
    pub max_deviation: f64,
    pub report: InfectionReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<DiagnosisKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

/// Quarantine enter/release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineAction {
    Enter,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEvent {
    pub agent_id: String,
    pub action: QuarantineAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    pub at: DateTime<Utc>,
}

/// Outcome of one healing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingEvent {
    pub agent_id: String,
    pub diagnosis: DiagnosisKind,
    pub action: HealingAction,
    pub success: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Unified log of user and system actions shown on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub kind: String,
    pub agent_id: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ActionLogEntry {
    pub fn new(kind: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            agent_id: agent_id.into(),
            at: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Immutable record of a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub agent_id: String,
    pub from: crate::types::AgentPhase,
    pub to: crate::types::AgentPhase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} -> {} ({})",
            self.agent_id, self.from, self.to, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(devs: &[(Metric, f64)], anomalies: &[AnomalyKind], prompt: bool) -> InfectionReport {
        let deviations: BTreeMap<Metric, f64> = devs.iter().copied().collect();
        let max_deviation = deviations.values().cloned().fold(0.0, f64::max);
        InfectionReport {
            agent_id: "a1".to_string(),
            deviations,
            max_deviation,
            anomalies: anomalies.iter().copied().collect(),
            prompt_changed: prompt,
            at: Utc::now(),
        }
    }

    #[test]
    fn primary_anomaly_follows_max_deviation() {
        let r = report(
            &[(Metric::Latency, 3.0), (Metric::Tokens, 7.5)],
            &[AnomalyKind::LatencySpike, AnomalyKind::TokenSpike],
            false,
        );
        assert_eq!(r.primary_anomaly(), Some(AnomalyKind::TokenSpike));
    }

    #[test]
    fn primary_anomaly_falls_back_to_prompt_change() {
        let r = report(&[(Metric::Latency, 0.2)], &[AnomalyKind::PromptChange], true);
        assert_eq!(r.primary_anomaly(), Some(AnomalyKind::PromptChange));
    }

    #[test]
    fn max_deviation_matches_map() {
        let r = report(
            &[(Metric::Latency, 2.7), (Metric::Cost, 6.1)],
            &[AnomalyKind::CostSpike],
            false,
        );
        let expected = r.deviations.values().cloned().fold(0.0, f64::max);
        assert_eq!(r.max_deviation, expected);
    }
}
