//! EWMA baseline learner.
//!
//! For every agent and every tracked metric the learner maintains an
//! exponentially weighted mean and variance:
//!
//! ```text
//! μ' = α·x + (1−α)·μ
//! σ²' = (1−α)·(σ² + α·(x−μ')²)
//! ```
//!
//! A profile is ready once `sample_count >= min_samples`. Profiles are
//! mirrored to the local cache opportunistically and pushed to the store so
//! a restarted node can resume without re-learning.

use std::collections::BTreeMap;
use std::sync::Arc;

use cordon_core::config::BaselineConfig;
use cordon_core::prelude::*;
use cordon_store::cache::CacheManager;
use cordon_store::Store;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One EWMA mean/variance pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct EwmaStat {
    pub mean: f64,
    pub var: f64,
}

impl EwmaStat {
    fn fold(&mut self, x: f64, alpha: f64, first: bool) {
        if first {
            self.mean = x;
            self.var = 0.0;
            return;
        }
        let mean = alpha * x + (1.0 - alpha) * self.mean;
        self.var = (1.0 - alpha) * (self.var + alpha * (x - mean).powi(2));
        self.mean = mean;
        debug_assert!(self.var >= 0.0);
    }
}

/// Learned behavioral profile for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub agent_id: String,
    pub stats: BTreeMap<Metric, EwmaStat>,
    pub sample_count: u64,
    /// Prompt hash pinned during warmup; re-pinned when an agent settles on
    /// a new normal after healing.
    pub prompt_hash: String,
}

impl BaselineProfile {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            stats: BTreeMap::new(),
            sample_count: 0,
            prompt_hash: String::new(),
        }
    }

    pub fn ready(&self, min_samples: u64) -> bool {
        self.sample_count >= min_samples
    }

    pub fn stat(&self, metric: Metric) -> EwmaStat {
        self.stats.get(&metric).copied().unwrap_or_default()
    }
}

/// Outcome of folding one sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldOutcome {
    /// The profile crossed the readiness threshold on this fold.
    pub became_ready: bool,
    /// The profile should be pushed to the store (periodic or readiness).
    pub persist: bool,
}

#[derive(Debug)]
struct LearnerState {
    profile: BaselineProfile,
    accel_remaining: u32,
}

/// EWMA baseline learner for the whole fleet.
#[derive(Debug)]
pub struct BaselineLearner {
    config: BaselineConfig,
    states: DashMap<String, LearnerState>,
    cache: Option<Arc<CacheManager>>,
}

impl BaselineLearner {
    pub fn new(config: BaselineConfig, cache: Option<Arc<CacheManager>>) -> Self {
        let learner = Self {
            config,
            states: DashMap::new(),
            cache: cache.clone(),
        };
        if let Some(cache) = cache {
            learner.restore_from_cache(&cache);
        }
        learner
    }

    fn restore_from_cache(&self, cache: &CacheManager) {
        for (agent_id, raw) in cache.baselines() {
            match serde_json::from_value::<BaselineProfile>(raw) {
                Ok(profile) => {
                    info!(agent = %agent_id, samples = profile.sample_count, "baseline restored from cache");
                    self.states.insert(
                        agent_id,
                        LearnerState {
                            profile,
                            accel_remaining: 0,
                        },
                    );
                }
                Err(e) => warn!(agent = %agent_id, error = %e, "discarding cached baseline"),
            }
        }
    }

    pub fn min_samples(&self) -> u64 {
        self.config.min_samples
    }

    /// Fold one sample into the agent's profile.
    pub fn fold(&self, vitals: &AgentVitals) -> FoldOutcome {
        let mut entry = self
            .states
            .entry(vitals.agent_id.clone())
            .or_insert_with(|| LearnerState {
                profile: BaselineProfile::new(&vitals.agent_id),
                accel_remaining: 0,
            });
        let state = entry.value_mut();

        let base_alpha = self.config.alpha();
        let alpha = if state.accel_remaining > 0 {
            state.accel_remaining -= 1;
            (base_alpha * self.config.accel_factor).min(0.5)
        } else {
            base_alpha
        };

        let first = state.profile.sample_count == 0;
        for metric in Metric::ALL {
            let x = vitals.metric_value(metric);
            state
                .profile
                .stats
                .entry(metric)
                .or_default()
                .fold(x, alpha, first);
        }
        state.profile.sample_count += 1;

        let was_ready = state.profile.sample_count - 1 >= self.config.min_samples;
        let ready = state.profile.ready(self.config.min_samples);
        if !ready && !vitals.prompt_hash.is_empty() {
            // Pin the hash while warming up; held afterwards.
            state.profile.prompt_hash = vitals.prompt_hash.clone();
        }

        let became_ready = ready && !was_ready;
        let persist = became_ready || state.profile.sample_count % self.config.persist_every == 0;

        if persist {
            self.mirror_to_cache(&state.profile, became_ready);
        }
        if became_ready {
            info!(agent = %vitals.agent_id, samples = state.profile.sample_count, "baseline ready");
            metrics::counter!("cordon_baselines_ready_total").increment(1);
        }

        FoldOutcome {
            became_ready,
            persist,
        }
    }

    fn mirror_to_cache(&self, profile: &BaselineProfile, force_flush: bool) {
        if let Some(cache) = &self.cache {
            match serde_json::to_value(profile) {
                Ok(raw) => {
                    cache.put_baseline(&profile.agent_id, raw);
                    if force_flush {
                        cache.flush_now();
                    }
                }
                Err(e) => warn!(agent = %profile.agent_id, error = %e, "baseline cache encode failed"),
            }
        }
    }

    /// Current profile for an agent.
    pub fn profile(&self, agent_id: &str) -> Option<BaselineProfile> {
        self.states.get(agent_id).map(|s| s.profile.clone())
    }

    /// Profile lookup with store fallback; a hit restores the local state.
    pub async fn profile_or_restore(
        &self,
        agent_id: &str,
        store: &Arc<dyn Store>,
    ) -> Option<BaselineProfile> {
        if let Some(profile) = self.profile(agent_id) {
            return Some(profile);
        }
        match store.get_baseline_profile(agent_id).await {
            Ok(Some(raw)) => match serde_json::from_value::<BaselineProfile>(raw) {
                Ok(profile) => {
                    debug!(agent = agent_id, "baseline restored from store");
                    self.states.insert(
                        agent_id.to_string(),
                        LearnerState {
                            profile: profile.clone(),
                            accel_remaining: 0,
                        },
                    );
                    Some(profile)
                }
                Err(e) => {
                    warn!(agent = agent_id, error = %e, "stored baseline undecodable");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(agent = agent_id, error = %e, "baseline store read failed");
                None
            }
        }
    }

    /// Push one agent's profile to the store, best effort.
    pub async fn push_to_store(&self, agent_id: &str, store: &Arc<dyn Store>) {
        if let Some(profile) = self.profile(agent_id) {
            match serde_json::to_value(&profile) {
                Ok(raw) => {
                    if let Err(e) = store.write_baseline_profile(&raw).await {
                        warn!(agent = agent_id, error = %e, "baseline store push failed");
                    }
                }
                Err(e) => warn!(agent = agent_id, error = %e, "baseline encode failed"),
            }
        }
    }

    pub fn ready(&self, agent_id: &str) -> bool {
        self.states
            .get(agent_id)
            .map(|s| s.profile.ready(self.config.min_samples))
            .unwrap_or(false)
    }

    /// Converge faster on a new normal: the next `accel_ticks` folds use
    /// `min(α·factor, 0.5)`. Invoked by the healer after an action lands.
    pub fn accelerate(&self, agent_id: &str) {
        if let Some(mut state) = self.states.get_mut(agent_id) {
            state.accel_remaining = self.config.accel_ticks;
            debug!(agent = agent_id, ticks = self.config.accel_ticks, "baseline acceleration on");
        }
    }

    /// Forget everything learned for an agent, locally and in the cache.
    pub fn hard_reset(&self, agent_id: &str) {
        self.states.remove(agent_id);
        if let Some(cache) = &self.cache {
            cache.remove_baseline(agent_id);
        }
        info!(agent = agent_id, "baseline hard reset");
    }

    /// Pin the baseline prompt hash to the latest observed value. Called
    /// when an agent settles back to HEALTHY so a healed prompt becomes the
    /// reference.
    pub fn adopt_prompt_hash(&self, agent_id: &str, hash: &str) {
        if hash.is_empty() {
            return;
        }
        if let Some(mut state) = self.states.get_mut(agent_id) {
            state.profile.prompt_hash = hash.to_string();
        }
    }

    /// Number of ready baselines across the fleet.
    pub fn ready_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.profile.ready(self.config.min_samples))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vitals(agent: &str, latency: f64, tokens: u64, hash: &str) -> AgentVitals {
        AgentVitals {
            agent_id: agent.to_string(),
            timestamp: Utc::now(),
            latency_ms: latency,
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            token_count: tokens,
            tool_calls: 2,
            retries: 0,
            success: true,
            cost: 0.01,
            model: "gpt-4o".to_string(),
            error_type: VitalError::None,
            prompt_hash: hash.to_string(),
            agent_type: None,
            mcp_servers: Vec::new(),
        }
    }

    fn learner() -> BaselineLearner {
        BaselineLearner::new(BaselineConfig::default(), None)
    }

    #[test]
    fn ready_flips_exactly_at_min_samples() {
        let l = learner();
        for i in 0..15 {
            let outcome = l.fold(&vitals("a1", 100.0, 1000, "h1"));
            if i < 14 {
                assert!(!outcome.became_ready);
                assert!(!l.ready("a1"));
            } else {
                assert!(outcome.became_ready);
                assert!(l.ready("a1"));
            }
        }
        // Ready flips once.
        assert!(!l.fold(&vitals("a1", 100.0, 1000, "h1")).became_ready);
    }

    #[test]
    fn constant_metric_has_zero_variance() {
        let l = learner();
        for _ in 0..20 {
            l.fold(&vitals("a1", 100.0, 1000, "h1"));
        }
        let p = l.profile("a1").unwrap();
        let stat = p.stat(Metric::Latency);
        assert_eq!(stat.mean, 100.0);
        assert_eq!(stat.var, 0.0);
    }

    #[test]
    fn variance_stays_non_negative_and_tracks_spread() {
        let l = learner();
        for i in 0..200 {
            let latency = if i % 2 == 0 { 90.0 } else { 110.0 };
            l.fold(&vitals("a1", latency, 1000, "h1"));
        }
        let stat = l.profile("a1").unwrap().stat(Metric::Latency);
        assert!(stat.var > 0.0);
        assert!((stat.mean - 100.0).abs() < 10.0);
        // stddev should be on the order of the oscillation amplitude.
        assert!(stat.var.sqrt() > 4.0 && stat.var.sqrt() < 20.0);
    }

    #[test]
    fn ewma_mean_follows_update_rule() {
        let l = learner();
        l.fold(&vitals("a1", 100.0, 1000, "h1"));
        l.fold(&vitals("a1", 151.0, 1000, "h1"));
        let alpha = 2.0 / 51.0;
        let expected = alpha * 151.0 + (1.0 - alpha) * 100.0;
        let stat = l.profile("a1").unwrap().stat(Metric::Latency);
        assert!((stat.mean - expected).abs() < 1e-9);
    }

    #[test]
    fn prompt_hash_pinned_during_warmup_only() {
        let l = learner();
        for _ in 0..15 {
            l.fold(&vitals("a1", 100.0, 1000, "warmup-hash"));
        }
        // Post-ready hashes do not move the pin.
        l.fold(&vitals("a1", 100.0, 1000, "changed-hash"));
        assert_eq!(l.profile("a1").unwrap().prompt_hash, "warmup-hash");

        l.adopt_prompt_hash("a1", "changed-hash");
        assert_eq!(l.profile("a1").unwrap().prompt_hash, "changed-hash");
    }

    #[test]
    fn accelerate_converges_faster() {
        let slow = learner();
        let fast = learner();
        for _ in 0..20 {
            slow.fold(&vitals("a1", 100.0, 1000, "h"));
            fast.fold(&vitals("a1", 100.0, 1000, "h"));
        }
        fast.accelerate("a1");
        for _ in 0..10 {
            slow.fold(&vitals("a1", 200.0, 1000, "h"));
            fast.fold(&vitals("a1", 200.0, 1000, "h"));
        }
        let slow_mean = slow.profile("a1").unwrap().stat(Metric::Latency).mean;
        let fast_mean = fast.profile("a1").unwrap().stat(Metric::Latency).mean;
        assert!(fast_mean > slow_mean);
    }

    #[test]
    fn hard_reset_clears_profile() {
        let l = learner();
        for _ in 0..20 {
            l.fold(&vitals("a1", 100.0, 1000, "h"));
        }
        l.hard_reset("a1");
        assert!(l.profile("a1").is_none());
        assert!(!l.ready("a1"));
    }

    #[test]
    fn cache_round_trip_restores_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheManager::new(dir.path()));
        cache.load();
        {
            let l = BaselineLearner::new(BaselineConfig::default(), Some(cache.clone()));
            for _ in 0..20 {
                l.fold(&vitals("a1", 100.0, 1000, "h1"));
            }
            cache.flush_now();
        }
        let cache2 = Arc::new(CacheManager::new(dir.path()));
        cache2.load();
        let restored = BaselineLearner::new(BaselineConfig::default(), Some(cache2));
        let p = restored.profile("a1").unwrap();
        assert!(p.ready(15));
        assert_eq!(p.stat(Metric::Latency).mean, 100.0);
    }
}
