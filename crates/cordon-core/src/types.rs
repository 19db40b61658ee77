//! Shared enums for the detection, diagnosis and healing pipeline.

use serde::{Deserialize, Serialize};

/// Tracked per-agent metrics.
///
/// `RetryRate` and `ErrorRate` are per-sample indicators (retries > 0,
/// error present) whose EWMA mean is the baseline rate; all metrics share
/// the same deviation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Latency,
    Tokens,
    InputTokens,
    OutputTokens,
    Cost,
    ToolCalls,
    RetryRate,
    ErrorRate,
}

impl Metric {
    /// All tracked metrics, in the order they are reported.
    pub const ALL: [Metric; 8] = [
        Metric::Latency,
        Metric::Tokens,
        Metric::InputTokens,
        Metric::OutputTokens,
        Metric::Cost,
        Metric::ToolCalls,
        Metric::RetryRate,
        Metric::ErrorRate,
    ];

    /// The anomaly kind raised when this metric deviates.
    pub fn anomaly_kind(self) -> AnomalyKind {
        match self {
            Metric::Latency => AnomalyKind::LatencySpike,
            Metric::Tokens => AnomalyKind::TokenSpike,
            Metric::InputTokens => AnomalyKind::InputTokenSpike,
            Metric::OutputTokens => AnomalyKind::OutputTokenSpike,
            Metric::Cost => AnomalyKind::CostSpike,
            Metric::ToolCalls => AnomalyKind::ToolExplosion,
            Metric::RetryRate => AnomalyKind::HighRetryRate,
            Metric::ErrorRate => AnomalyKind::ErrorRateSpike,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Latency => "latency",
            Metric::Tokens => "tokens",
            Metric::InputTokens => "input_tokens",
            Metric::OutputTokens => "output_tokens",
            Metric::Cost => "cost",
            Metric::ToolCalls => "tool_calls",
            Metric::RetryRate => "retry_rate",
            Metric::ErrorRate => "error_rate",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly classes a Sentinel report can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TokenSpike,
    LatencySpike,
    ToolExplosion,
    HighRetryRate,
    InputTokenSpike,
    OutputTokenSpike,
    CostSpike,
    PromptChange,
    ErrorRateSpike,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::TokenSpike => "token_spike",
            AnomalyKind::LatencySpike => "latency_spike",
            AnomalyKind::ToolExplosion => "tool_explosion",
            AnomalyKind::HighRetryRate => "high_retry_rate",
            AnomalyKind::InputTokenSpike => "input_token_spike",
            AnomalyKind::OutputTokenSpike => "output_token_spike",
            AnomalyKind::CostSpike => "cost_spike",
            AnomalyKind::PromptChange => "prompt_change",
            AnomalyKind::ErrorRateSpike => "error_rate_spike",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root-cause hypotheses the Diagnostician can rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisKind {
    PromptDrift,
    PromptInjection,
    InfiniteLoop,
    ToolInstability,
    MemoryCorruption,
    CostOverrun,
    ExternalCause,
    Unknown,
}

impl DiagnosisKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosisKind::PromptDrift => "prompt_drift",
            DiagnosisKind::PromptInjection => "prompt_injection",
            DiagnosisKind::InfiniteLoop => "infinite_loop",
            DiagnosisKind::ToolInstability => "tool_instability",
            DiagnosisKind::MemoryCorruption => "memory_corruption",
            DiagnosisKind::CostOverrun => "cost_overrun",
            DiagnosisKind::ExternalCause => "external_cause",
            DiagnosisKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DiagnosisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Healing actions, ordered from least to most disruptive.
///
/// Every policy ladder terminates in `ResetAgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingAction {
    ResetMemory,
    RollbackPrompt,
    ReduceAutonomy,
    RevokeTools,
    ResetAgent,
}

impl HealingAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HealingAction::ResetMemory => "reset_memory",
            HealingAction::RollbackPrompt => "rollback_prompt",
            HealingAction::ReduceAutonomy => "reduce_autonomy",
            HealingAction::RevokeTools => "revoke_tools",
            HealingAction::ResetAgent => "reset_agent",
        }
    }
}

impl std::fmt::Display for HealingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent lifecycle phases.
///
/// INITIALIZING  registered, learning baseline, no detection
/// HEALTHY       normal operation
/// SUSPECTED     anomaly observed, under watch
/// DRAINING      containment ordered, in-flight work may finish
/// QUARANTINED   fully isolated
/// HEALING       a healing action is being applied
/// PROBATION     healed, running under observation
/// EXHAUSTED     every action failed, operator required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Initializing,
    Healthy,
    Suspected,
    Draining,
    Quarantined,
    Healing,
    Probation,
    Exhausted,
}

impl AgentPhase {
    /// Whether the agent may execute new work in this phase.
    pub fn execution_allowed(self) -> bool {
        matches!(
            self,
            AgentPhase::Initializing
                | AgentPhase::Healthy
                | AgentPhase::Suspected
                | AgentPhase::Probation
        )
    }

    /// Whether samples observed in this phase may train the baseline.
    ///
    /// Suspicion phases are excluded so the baseline stays anchored on
    /// normal behavior instead of chasing the anomaly.
    pub fn learning_allowed(self) -> bool {
        matches!(
            self,
            AgentPhase::Initializing | AgentPhase::Healthy | AgentPhase::Probation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Initializing => "initializing",
            AgentPhase::Healthy => "healthy",
            AgentPhase::Suspected => "suspected",
            AgentPhase::Draining => "draining",
            AgentPhase::Quarantined => "quarantined",
            AgentPhase::Healing => "healing",
            AgentPhase::Probation => "probation",
            AgentPhase::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error class attached to a vitals record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalError {
    #[default]
    None,
    RateLimit,
    Timeout,
    ContentFilter,
    Other,
}

impl VitalError {
    /// True when the record carries any error.
    pub fn is_error(self) -> bool {
        !matches!(self, VitalError::None)
    }
}

/// Fleet correlation verdict for a detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationVerdict {
    AgentSpecific,
    PartialFleet,
    FleetWide,
}

impl std::fmt::Display for CorrelationVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CorrelationVerdict::AgentSpecific => "agent_specific",
            CorrelationVerdict::PartialFleet => "partial_fleet",
            CorrelationVerdict::FleetWide => "fleet_wide",
        };
        f.write_str(s)
    }
}

/// Operator feedback labels for a past diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLabel {
    Correct,
    FalsePositive,
    WrongDiagnosis,
    ProviderOutage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_maps_to_anomaly_kind() {
        assert_eq!(Metric::Latency.anomaly_kind(), AnomalyKind::LatencySpike);
        assert_eq!(Metric::ToolCalls.anomaly_kind(), AnomalyKind::ToolExplosion);
        assert_eq!(Metric::RetryRate.anomaly_kind(), AnomalyKind::HighRetryRate);
    }

    #[test]
    fn phase_gates() {
        assert!(AgentPhase::Probation.execution_allowed());
        assert!(!AgentPhase::Quarantined.execution_allowed());
        assert!(!AgentPhase::Suspected.learning_allowed());
        assert!(AgentPhase::Healthy.learning_allowed());
    }

    #[test]
    fn enums_serialize_snake_case() {
        let s = serde_json::to_string(&AnomalyKind::TokenSpike).unwrap();
        assert_eq!(s, "\"token_spike\"");
        let d: DiagnosisKind = serde_json::from_str("\"prompt_injection\"").unwrap();
        assert_eq!(d, DiagnosisKind::PromptInjection);
    }
}
