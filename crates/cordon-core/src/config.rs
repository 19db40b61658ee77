//! Runtime configuration.
//!
//! Thresholds are behavioral contract constants; the environment only
//! overrides deployment concerns (store endpoint, cache dir, API key).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Detection thresholds, in sigma units unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Deviation at or above which a metric is anomalous.
    pub threshold_sigma: f64,
    /// Deviation above which SUSPECTED is bypassed straight to DRAINING.
    pub severe_skip_sigma: f64,
    /// Deviation at or above which healing requires operator approval.
    pub approval_sigma: f64,
    /// Stddev floor as a fraction of |mean|.
    pub stddev_floor_frac: f64,
    /// Recent-window duration the Sentinel inspects.
    pub window: Duration,
    /// Number of most-recent samples evaluated inside the window.
    pub window_samples: usize,
    /// Fleet fraction at or above which an anomaly is FLEET_WIDE.
    pub fleet_wide_fraction: f64,
    /// Fleet fraction at or above which an anomaly is PARTIAL_FLEET.
    pub partial_fleet_fraction: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold_sigma: 2.5,
            severe_skip_sigma: 6.0,
            approval_sigma: 5.0,
            stddev_floor_frac: 0.05,
            window: Duration::from_secs(10),
            window_samples: 5,
            fleet_wide_fraction: 0.3,
            partial_fleet_fraction: 0.1,
        }
    }
}

/// EWMA baseline parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// EWMA span; alpha = 2 / (span + 1).
    pub span: u32,
    /// Samples required before the baseline is ready.
    pub min_samples: u64,
    /// Alpha multiplier while converging on a post-healing normal.
    pub accel_factor: f64,
    /// Number of accelerated folds after healing.
    pub accel_ticks: u32,
    /// Persist the profile to cache every N folds.
    pub persist_every: u64,
}

impl BaselineConfig {
    pub fn alpha(&self) -> f64 {
        2.0 / (self.span as f64 + 1.0)
    }
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            span: 50,
            min_samples: 15,
            accel_factor: 5.0,
            accel_ticks: 25,
            persist_every: 10,
        }
    }
}

/// Orchestrator cadence and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Agent / sentinel / probation loop tick interval.
    pub tick_interval: Duration,
    /// Consecutive anomalous scans before SUSPECTED escalates, and
    /// consecutive clean scans before SUSPECTED resolves.
    pub suspect_ticks: u32,
    /// Clean probation scans required before an agent returns to HEALTHY.
    pub probation_ticks: u32,
    /// Hard cap on DRAINING.
    pub drain_timeout: Duration,
    /// Per-healing-action deadline.
    pub action_timeout: Duration,
    /// Visible delay between healing steps.
    pub heal_step_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            suspect_ticks: 3,
            probation_ticks: 10,
            drain_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(10),
            heal_step_delay: Duration::from_millis(250),
        }
    }
}

/// Cache flush cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Coalesced flush interval for dirty state.
    pub flush_interval: Duration,
    /// Deadline for the final flush at shutdown.
    pub flush_deadline: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cordon");
        Self {
            dir,
            flush_interval: Duration::from_secs(30),
            flush_deadline: Duration::from_secs(2),
        }
    }
}

/// Top-level configuration assembled by the launcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CordonConfig {
    pub detection: DetectionConfig,
    pub baseline: BaselineConfig,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    /// Remote store base URL; in-memory store when absent.
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    /// Explicit ingest API key. Precedence: this value, then cached key,
    /// then auto-generated on first start.
    pub ingest_api_key: Option<String>,
    /// Recognized for deployment parity; export wiring is external.
    pub otel_endpoint: Option<String>,
}

impl CordonConfig {
    /// Read deployment settings from `CORDON_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = CordonConfig::default();
        if let Ok(url) = std::env::var("CORDON_STORE_URL") {
            if !url.is_empty() {
                cfg.store_url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("CORDON_STORE_TOKEN") {
            if !token.is_empty() {
                cfg.store_token = Some(token);
            }
        }
        if let Ok(key) = std::env::var("CORDON_INGEST_API_KEY") {
            if !key.is_empty() {
                cfg.ingest_api_key = Some(key);
            }
        }
        if let Ok(endpoint) = std::env::var("CORDON_OTEL_ENDPOINT") {
            if !endpoint.is_empty() {
                cfg.otel_endpoint = Some(endpoint);
            }
        }
        if let Ok(dir) = std::env::var("CORDON_CACHE_DIR") {
            if !dir.is_empty() {
                cfg.cache.dir = PathBuf::from(dir);
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_from_span() {
        let b = BaselineConfig::default();
        assert!((b.alpha() - 2.0 / 51.0).abs() < 1e-12);
    }

    #[test]
    fn defaults_match_contract() {
        let d = DetectionConfig::default();
        assert_eq!(d.threshold_sigma, 2.5);
        assert_eq!(d.approval_sigma, 5.0);
        assert_eq!(d.severe_skip_sigma, 6.0);
        let o = OrchestratorConfig::default();
        assert_eq!(o.suspect_ticks, 3);
        assert_eq!(o.probation_ticks, 10);
    }
}
