//! Fleet correlator.
//!
//! When one agent trips the Sentinel, the correlator re-runs detection over
//! the rest of the fleet's recent windows. If enough agents show the same
//! primary anomaly the incident is almost certainly external (provider
//! outage, network, infrastructure) and quarantining individuals would only
//! add downtime.

use cordon_core::prelude::*;
use tracing::{info, warn};

use crate::baseline::BaselineProfile;
use crate::sentinel::Sentinel;

/// Correlation output.
#[derive(Debug, Clone)]
pub struct CorrelationResult {
    pub verdict: CorrelationVerdict,
    /// Fraction of other monitored agents showing the same primary anomaly.
    pub affected_fraction: f64,
    pub affected_agents: Vec<String>,
    pub detail: String,
}

impl CorrelationResult {
    fn agent_specific(detail: impl Into<String>) -> Self {
        Self {
            verdict: CorrelationVerdict::AgentSpecific,
            affected_fraction: 0.0,
            affected_agents: Vec::new(),
            detail: detail.into(),
        }
    }
}

/// Classifies a fresh infection as agent-specific, partial or fleet-wide.
#[derive(Debug)]
pub struct FleetCorrelator {
    fleet_wide_fraction: f64,
    partial_fraction: f64,
}

impl FleetCorrelator {
    pub fn new(fleet_wide_fraction: f64, partial_fraction: f64) -> Self {
        Self {
            fleet_wide_fraction,
            partial_fraction,
        }
    }

    /// Compare `report` against the rest of the fleet.
    ///
    /// `peers` holds, for every other monitored agent, its recent window and
    /// ready baseline. Agents without a ready baseline are excluded by the
    /// caller.
    pub fn classify(
        &self,
        report: &InfectionReport,
        peers: &[(String, Vec<AgentVitals>, BaselineProfile)],
        sentinel: &Sentinel,
        min_samples: u64,
    ) -> CorrelationResult {
        let Some(primary) = report.primary_anomaly() else {
            return CorrelationResult::agent_specific("report carries no primary anomaly");
        };

        let mut monitored = 0usize;
        let mut affected: Vec<String> = Vec::new();

        for (agent_id, window, baseline) in peers {
            if agent_id == &report.agent_id {
                continue;
            }
            monitored += 1;
            if window.is_empty() {
                continue;
            }
            match sentinel.detect(window, baseline, min_samples) {
                Ok(Some(other)) => {
                    if other.anomalies.contains(&primary) {
                        affected.push(agent_id.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(agent = %agent_id, error = %e, "peer scan skipped"),
            }
        }

        if monitored == 0 {
            return CorrelationResult::agent_specific("no other monitored agents");
        }

        let fraction = affected.len() as f64 / monitored as f64;
        let (verdict, detail) = if fraction >= self.fleet_wide_fraction {
            let detail = format!(
                "{}/{} agents share {primary} — likely external cause",
                affected.len(),
                monitored
            );
            warn!(anomaly = %primary, %detail, "fleet-wide anomaly");
            (CorrelationVerdict::FleetWide, detail)
        } else if fraction >= self.partial_fraction {
            let detail = format!(
                "{}/{} agents share {primary} — possible partial outage",
                affected.len(),
                monitored
            );
            info!(anomaly = %primary, %detail, "partial-fleet anomaly");
            (CorrelationVerdict::PartialFleet, detail)
        } else {
            (
                CorrelationVerdict::AgentSpecific,
                format!("only {}/{} other agents affected", affected.len(), monitored),
            )
        };

        CorrelationResult {
            verdict,
            affected_fraction: fraction,
            affected_agents: affected,
            detail,
        }
    }
}

impl Default for FleetCorrelator {
    fn default() -> Self {
        let d = cordon_core::config::DetectionConfig::default();
        Self::new(d.fleet_wide_fraction, d.partial_fleet_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineLearner;
    use chrono::Utc;
    use cordon_core::config::BaselineConfig;

    fn vitals(agent: &str, latency: f64) -> AgentVitals {
        AgentVitals {
            agent_id: agent.to_string(),
            timestamp: Utc::now(),
            latency_ms: latency,
            input_tokens: 500,
            output_tokens: 500,
            token_count: 1000,
            tool_calls: 2,
            retries: 0,
            success: true,
            cost: 0.01,
            model: "gpt-4o".to_string(),
            error_type: VitalError::None,
            prompt_hash: "h1".to_string(),
            agent_type: None,
            mcp_servers: Vec::new(),
        }
    }

    /// Build a fleet of warm agents; `spiking` agents show latency 300.
    fn fleet(
        n: usize,
        spiking: usize,
    ) -> (
        InfectionReport,
        Vec<(String, Vec<AgentVitals>, BaselineProfile)>,
    ) {
        let learner = BaselineLearner::new(BaselineConfig::default(), None);
        let sentinel = Sentinel::default();
        let mut peers = Vec::new();
        let mut target_report = None;

        for i in 0..n {
            let id = format!("agent-{i}");
            for _ in 0..15 {
                learner.fold(&vitals(&id, 100.0));
            }
            let baseline = learner.profile(&id).unwrap();
            let latency = if i < spiking { 300.0 } else { 100.0 };
            let window: Vec<_> = (0..5).map(|_| vitals(&id, latency)).collect();
            if i == 0 {
                target_report = sentinel.detect(&window, &baseline, 15).unwrap();
            }
            peers.push((id, window, baseline));
        }
        (target_report.expect("target must be anomalous"), peers)
    }

    #[test]
    fn all_agents_spiking_is_fleet_wide() {
        let (report, peers) = fleet(10, 10);
        let result =
            FleetCorrelator::default().classify(&report, &peers, &Sentinel::default(), 15);
        assert_eq!(result.verdict, CorrelationVerdict::FleetWide);
        assert_eq!(result.affected_agents.len(), 9);
        assert!((result.affected_fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lone_spike_is_agent_specific() {
        let (report, peers) = fleet(10, 1);
        let result =
            FleetCorrelator::default().classify(&report, &peers, &Sentinel::default(), 15);
        assert_eq!(result.verdict, CorrelationVerdict::AgentSpecific);
        assert!(result.affected_agents.is_empty());
    }

    #[test]
    fn partial_band_between_thresholds() {
        // 2 of 9 other agents affected: fraction 0.22 in [0.1, 0.3).
        let (report, peers) = fleet(10, 3);
        let result =
            FleetCorrelator::default().classify(&report, &peers, &Sentinel::default(), 15);
        assert_eq!(result.verdict, CorrelationVerdict::PartialFleet);
        assert_eq!(result.affected_agents.len(), 2);
    }

    #[test]
    fn empty_fleet_is_agent_specific() {
        let (report, peers) = fleet(1, 1);
        let peers_without_target: Vec<_> = peers
            .into_iter()
            .filter(|(id, _, _)| id != "agent-0")
            .collect();
        let result = FleetCorrelator::default().classify(
            &report,
            &peers_without_target,
            &Sentinel::default(),
            15,
        );
        assert_eq!(result.verdict, CorrelationVerdict::AgentSpecific);
    }
}
