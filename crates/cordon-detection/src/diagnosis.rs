//! Diagnostician: ranked root-cause hypotheses from anomaly patterns.
//!
//! A rule table maps anomaly combinations onto hypotheses with baseline
//! confidences; operator feedback shifts those confidences over time.

use chrono::Utc;
use cordon_core::prelude::*;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::correlator::CorrelationResult;

const CONFIDENCE_FLOOR: f64 = 0.05;
const CONFIDENCE_CEILING: f64 = 0.99;

/// Diagnoses the likely root cause of an infection.
#[derive(Debug, Default)]
pub struct Diagnostician {
    feedback: RwLock<Vec<DiagnosisFeedback>>,
}

impl Diagnostician {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record operator feedback for future rankings.
    pub fn record_feedback(&self, feedback: DiagnosisFeedback) {
        info!(
            agent = %feedback.agent_id,
            kind = %feedback.kind,
            label = ?feedback.label,
            "diagnosis feedback recorded"
        );
        self.feedback
            .write()
            .expect("feedback lock poisoned")
            .push(feedback);
    }

    pub fn feedback_history(&self) -> Vec<DiagnosisFeedback> {
        self.feedback
            .read()
            .expect("feedback lock poisoned")
            .clone()
    }

    /// Rank hypotheses for an infection report.
    ///
    /// `correlation` carries the fleet verdict when the caller has one; a
    /// fleet-wide latency+error pattern points at an external cause.
    pub fn diagnose(
        &self,
        report: &InfectionReport,
        correlation: Option<&CorrelationResult>,
    ) -> DiagnosisResult {
        let mut hypotheses = self.match_patterns(report, correlation);

        // Operator feedback adjustments.
        let feedback = self.feedback.read().expect("feedback lock poisoned");
        for hypothesis in &mut hypotheses {
            for fb in feedback.iter() {
                if fb.kind != hypothesis.kind {
                    continue;
                }
                match fb.label {
                    FeedbackLabel::FalsePositive => {
                        hypothesis.confidence =
                            (hypothesis.confidence - 0.1).max(CONFIDENCE_FLOOR);
                    }
                    FeedbackLabel::Correct => {
                        hypothesis.confidence =
                            (hypothesis.confidence + 0.05).min(CONFIDENCE_CEILING);
                    }
                    FeedbackLabel::WrongDiagnosis => {
                        hypothesis.confidence = (hypothesis.confidence / 2.0).max(CONFIDENCE_FLOOR);
                    }
                    FeedbackLabel::ProviderOutage => {}
                }
            }
        }
        let outage_reported = feedback
            .iter()
            .any(|fb| fb.agent_id == report.agent_id && fb.label == FeedbackLabel::ProviderOutage);
        drop(feedback);

        if outage_reported {
            push_hypothesis(&mut hypotheses, DiagnosisKind::ExternalCause, 0.95);
        }

        if hypotheses.is_empty() {
            hypotheses.push(Hypothesis {
                kind: DiagnosisKind::Unknown,
                confidence: 0.4,
            });
        }

        hypotheses.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(
            agent = %report.agent_id,
            primary = %hypotheses[0].kind,
            confidence = hypotheses[0].confidence,
            "diagnosis"
        );

        DiagnosisResult {
            agent_id: report.agent_id.clone(),
            hypotheses,
            at: Utc::now(),
        }
    }

    fn match_patterns(
        &self,
        report: &InfectionReport,
        correlation: Option<&CorrelationResult>,
    ) -> Vec<Hypothesis> {
        use cordon_core::types::AnomalyKind::*;
        let mut out: Vec<Hypothesis> = Vec::new();

        if report.has(PromptChange) {
            push_hypothesis(&mut out, DiagnosisKind::PromptInjection, 0.9);
            push_hypothesis(&mut out, DiagnosisKind::PromptDrift, 0.6);
        }

        if report.has(TokenSpike) && report.has(ToolExplosion) {
            push_hypothesis(&mut out, DiagnosisKind::InfiniteLoop, 0.85);
            push_hypothesis(&mut out, DiagnosisKind::ToolInstability, 0.6);
        }

        if report.has(ToolExplosion) && report.has(HighRetryRate) {
            push_hypothesis(&mut out, DiagnosisKind::ToolInstability, 0.85);
        }

        if report.has(CostSpike) && report.has(TokenSpike) {
            push_hypothesis(&mut out, DiagnosisKind::CostOverrun, 0.8);
            push_hypothesis(&mut out, DiagnosisKind::PromptDrift, 0.6);
        }

        let fleet_wide = correlation
            .map(|c| c.verdict == CorrelationVerdict::FleetWide)
            .unwrap_or(false);
        if report.has(LatencySpike) && report.has(ErrorRateSpike) && fleet_wide {
            push_hypothesis(&mut out, DiagnosisKind::ExternalCause, 0.9);
        }

        let noise_only = !report.anomalies.is_empty()
            && report
                .anomalies
                .iter()
                .all(|a| matches!(a, HighRetryRate | ErrorRateSpike));
        if noise_only {
            push_hypothesis(&mut out, DiagnosisKind::ToolInstability, 0.6);
            push_hypothesis(&mut out, DiagnosisKind::ExternalCause, 0.5);
        }

        // Context growth without a prompt change reads as state corruption.
        if report.has(InputTokenSpike) && !report.has(PromptChange) {
            push_hypothesis(&mut out, DiagnosisKind::MemoryCorruption, 0.7);
        }

        // Runaway generation: token volume up while cost and tool usage
        // give no alternative explanation.
        if (report.has(TokenSpike) || report.has(OutputTokenSpike))
            && !report.has(CostSpike)
            && !report.has(ToolExplosion)
        {
            push_hypothesis(&mut out, DiagnosisKind::PromptDrift, 0.85);
        }

        if report.has(LatencySpike) && report.anomalies.len() == 1 {
            push_hypothesis(&mut out, DiagnosisKind::ToolInstability, 0.6);
        }

        out
    }
}

/// Insert keeping one entry per kind with the maximum confidence.
fn push_hypothesis(out: &mut Vec<Hypothesis>, kind: DiagnosisKind, confidence: f64) {
    match out.iter_mut().find(|h| h.kind == kind) {
        Some(existing) => existing.confidence = existing.confidence.max(confidence),
        None => out.push(Hypothesis { kind, confidence }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::types::Metric;
    use std::collections::{BTreeMap, BTreeSet};

    fn report(anomalies: &[AnomalyKind]) -> InfectionReport {
        let prompt_changed = anomalies.contains(&AnomalyKind::PromptChange);
        InfectionReport {
            agent_id: "a1".to_string(),
            deviations: BTreeMap::from([(Metric::Latency, 3.0)]),
            max_deviation: 3.0,
            anomalies: anomalies.iter().copied().collect(),
            prompt_changed,
            at: Utc::now(),
        }
    }

    fn fleet_wide() -> CorrelationResult {
        CorrelationResult {
            verdict: CorrelationVerdict::FleetWide,
            affected_fraction: 0.5,
            affected_agents: vec!["a2".to_string()],
            detail: String::new(),
        }
    }

    fn kinds(result: &DiagnosisResult) -> Vec<DiagnosisKind> {
        result.hypotheses.iter().map(|h| h.kind).collect()
    }

    #[test]
    fn prompt_change_ranks_injection_over_drift() {
        let d = Diagnostician::new();
        let result = d.diagnose(&report(&[AnomalyKind::PromptChange]), None);
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::PromptInjection);
        assert!((result.primary().unwrap().confidence - 0.9).abs() < 1e-9);
        assert!(kinds(&result).contains(&DiagnosisKind::PromptDrift));
    }

    #[test]
    fn token_and_tool_spike_is_infinite_loop() {
        let d = Diagnostician::new();
        let result = d.diagnose(
            &report(&[AnomalyKind::TokenSpike, AnomalyKind::ToolExplosion]),
            None,
        );
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::InfiniteLoop);
    }

    #[test]
    fn cost_and_token_spike_is_cost_overrun() {
        let d = Diagnostician::new();
        let result = d.diagnose(
            &report(&[AnomalyKind::CostSpike, AnomalyKind::TokenSpike]),
            None,
        );
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::CostOverrun);
        // The runaway-generation row is suppressed by the cost spike, so
        // drift stays at its pattern confidence 0.6.
        let drift = result
            .hypotheses
            .iter()
            .find(|h| h.kind == DiagnosisKind::PromptDrift)
            .unwrap();
        assert!((drift.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn token_spike_without_cost_is_prompt_drift() {
        let d = Diagnostician::new();
        let result = d.diagnose(
            &report(&[AnomalyKind::TokenSpike, AnomalyKind::OutputTokenSpike]),
            None,
        );
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::PromptDrift);
        assert!((result.primary().unwrap().confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn fleet_wide_latency_errors_is_external() {
        let d = Diagnostician::new();
        let anomalies = [AnomalyKind::LatencySpike, AnomalyKind::ErrorRateSpike];
        let with_fleet = d.diagnose(&report(&anomalies), Some(&fleet_wide()));
        assert_eq!(with_fleet.primary().unwrap().kind, DiagnosisKind::ExternalCause);

        let without = d.diagnose(&report(&anomalies), None);
        assert_ne!(without.primary().unwrap().kind, DiagnosisKind::ExternalCause);
    }

    #[test]
    fn unmatched_pattern_is_unknown() {
        let d = Diagnostician::new();
        let result = d.diagnose(&report(&[]), None);
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::Unknown);
        assert!((result.primary().unwrap().confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn hypotheses_are_deduplicated_and_sorted() {
        let d = Diagnostician::new();
        let result = d.diagnose(
            &report(&[
                AnomalyKind::PromptChange,
                AnomalyKind::TokenSpike,
                AnomalyKind::CostSpike,
            ]),
            None,
        );
        let mut seen = std::collections::HashSet::new();
        for h in &result.hypotheses {
            assert!(seen.insert(h.kind), "duplicate kind {}", h.kind);
        }
        let confidences: Vec<f64> = result.hypotheses.iter().map(|h| h.confidence).collect();
        let mut sorted = confidences.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(confidences, sorted);
    }

    #[test]
    fn false_positive_feedback_lowers_confidence() {
        let d = Diagnostician::new();
        d.record_feedback(DiagnosisFeedback {
            agent_id: "a1".to_string(),
            kind: DiagnosisKind::ToolInstability,
            label: FeedbackLabel::FalsePositive,
            at: Utc::now(),
        });
        let result = d.diagnose(
            &report(&[AnomalyKind::HighRetryRate, AnomalyKind::ErrorRateSpike]),
            None,
        );
        let tool = result
            .hypotheses
            .iter()
            .find(|h| h.kind == DiagnosisKind::ToolInstability)
            .unwrap();
        assert!((tool.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wrong_diagnosis_feedback_halves_confidence() {
        let d = Diagnostician::new();
        d.record_feedback(DiagnosisFeedback {
            agent_id: "a9".to_string(),
            kind: DiagnosisKind::PromptInjection,
            label: FeedbackLabel::WrongDiagnosis,
            at: Utc::now(),
        });
        let result = d.diagnose(&report(&[AnomalyKind::PromptChange]), None);
        let injection = result
            .hypotheses
            .iter()
            .find(|h| h.kind == DiagnosisKind::PromptInjection)
            .unwrap();
        assert!((injection.confidence - 0.45).abs() < 1e-9);
        // Drift (0.6) now outranks the halved injection.
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::PromptDrift);
    }

    #[test]
    fn provider_outage_feedback_injects_external_cause() {
        let d = Diagnostician::new();
        d.record_feedback(DiagnosisFeedback {
            agent_id: "a1".to_string(),
            kind: DiagnosisKind::ToolInstability,
            label: FeedbackLabel::ProviderOutage,
            at: Utc::now(),
        });
        let result = d.diagnose(&report(&[AnomalyKind::LatencySpike]), None);
        assert_eq!(result.primary().unwrap().kind, DiagnosisKind::ExternalCause);
        assert!((result.primary().unwrap().confidence - 0.95).abs() < 1e-9);

        // Scoped to the agent the feedback names.
        let mut other = report(&[AnomalyKind::LatencySpike]);
        other.agent_id = "a2".to_string();
        let result = d.diagnose(&other, None);
        assert_ne!(result.primary().unwrap().kind, DiagnosisKind::ExternalCause);
    }

    #[test]
    fn confidence_floor_holds() {
        let d = Diagnostician::new();
        for _ in 0..20 {
            d.record_feedback(DiagnosisFeedback {
                agent_id: "a1".to_string(),
                kind: DiagnosisKind::ToolInstability,
                label: FeedbackLabel::FalsePositive,
                at: Utc::now(),
            });
        }
        let result = d.diagnose(&report(&[AnomalyKind::HighRetryRate]), None);
        let tool = result
            .hypotheses
            .iter()
            .find(|h| h.kind == DiagnosisKind::ToolInstability)
            .unwrap();
        assert!((tool.confidence - CONFIDENCE_FLOOR).abs() < 1e-9);
    }
}
