//! Sentinel: pure window-vs-baseline deviation detector.
//!
//! Compares the mean of the most recent samples against the agent's EWMA
//! baseline, metric by metric, in sigma units. The detection stddev is
//! floored at a fraction of |mean| so constant-metric baselines still flag
//! meaningful shifts. The Sentinel mutates nothing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use cordon_core::config::DetectionConfig;
use cordon_core::prelude::*;

use crate::baseline::BaselineProfile;

const FLOOR_EPSILON: f64 = 1e-6;

/// Anomaly detector.
#[derive(Debug, Clone)]
pub struct Sentinel {
    config: DetectionConfig,
}

impl Sentinel {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Detection stddev: `max(σ, floor_frac · max(|μ|, ε))`.
    fn effective_stddev(&self, stat: crate::baseline::EwmaStat) -> f64 {
        let floor = self.config.stddev_floor_frac * stat.mean.abs().max(FLOOR_EPSILON);
        stat.var.sqrt().max(floor)
    }

    /// Compare a recent window against the baseline.
    ///
    /// `recent` is the windowed read (oldest first); only the last
    /// `window_samples` entries are evaluated. Returns a report iff at
    /// least one anomaly was emitted, `None` for a clean window, and
    /// `Err(NotReady)` while the baseline is still warming up.
    pub fn detect(
        &self,
        recent: &[AgentVitals],
        baseline: &BaselineProfile,
        min_samples: u64,
    ) -> Result<Option<InfectionReport>> {
        if !baseline.ready(min_samples) {
            return Err(Error::NotReady(baseline.agent_id.clone()));
        }
        if recent.is_empty() {
            return Ok(None);
        }

        let start = recent.len().saturating_sub(self.config.window_samples);
        let window = &recent[start..];

        let mut deviations: BTreeMap<Metric, f64> = BTreeMap::new();
        let mut anomalies: BTreeSet<AnomalyKind> = BTreeSet::new();

        for metric in Metric::ALL {
            let mean: f64 = window.iter().map(|v| v.metric_value(metric)).sum::<f64>()
                / window.len() as f64;
            let stat = baseline.stat(metric);
            let sigma = self.effective_stddev(stat);
            let deviation = (mean - stat.mean).abs() / sigma;
            deviations.insert(metric, deviation);
            if deviation >= self.config.threshold_sigma {
                anomalies.insert(metric.anomaly_kind());
            }
        }

        // Prompt hash comparison: latest sample vs the pinned baseline hash.
        let latest_hash = window
            .last()
            .map(|v| v.prompt_hash.as_str())
            .unwrap_or_default();
        let prompt_changed = !baseline.prompt_hash.is_empty()
            && !latest_hash.is_empty()
            && latest_hash != baseline.prompt_hash;
        if prompt_changed {
            anomalies.insert(AnomalyKind::PromptChange);
        }

        if anomalies.is_empty() {
            return Ok(None);
        }

        let max_deviation = deviations.values().cloned().fold(0.0, f64::max);
        Ok(Some(InfectionReport {
            agent_id: baseline.agent_id.clone(),
            deviations,
            max_deviation,
            anomalies,
            prompt_changed,
            at: Utc::now(),
        }))
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}
