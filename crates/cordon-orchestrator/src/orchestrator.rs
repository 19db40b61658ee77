//! The orchestrator: agent ticks, sentinel scans, containment, healing and
//! probation.
//!
//! Scheduling model: every logical loop is a tokio task ticking at the
//! configured interval, with a watch channel broadcasting shutdown. Each
//! tick body is a public method so tests drive the pipeline
//! deterministically without timers.
//!
//! Detection ordering: the sentinel screens a window *before* the learner
//! folds its samples, and the learner only folds samples from clean scans
//! in learning phases. A suspicion episode pins the first infection report;
//! that report's deviation decides the containment band (approval vs
//! auto-heal), because later scans of the same episode are mechanically
//! inflated as the window fills with anomalous samples.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cordon_core::prelude::*;
use cordon_detection::baseline::BaselineProfile;
use cordon_detection::prelude::*;
use cordon_healing::enforcement::EnforcementStrategy;
use cordon_healing::executor::HealingExecutor;
use cordon_healing::prelude::*;
use cordon_store::cache::CacheManager;
use cordon_store::Store;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lifecycle::LifecycleManager;
use crate::sim::{SimFleet, SimulatedAgent};

/// Result of one ingest call, mapped onto HTTP status by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Recorded locally and in the store.
    Stored,
    /// Recorded locally; the store was unreachable.
    Degraded,
}

/// One suspicion episode: from first detection until containment or
/// resolution.
#[derive(Debug, Clone)]
struct SuspicionEpisode {
    first_report: InfectionReport,
    fleet_wide: bool,
}

/// State of an in-progress healing walk for one agent.
#[derive(Debug, Clone)]
struct HealingSession {
    report: InfectionReport,
    hypotheses: Vec<Hypothesis>,
    hypothesis_index: usize,
    /// Action applied and awaiting its probation verdict.
    pending: Option<(DiagnosisKind, HealingAction)>,
}

#[derive(Debug)]
struct Stats {
    started_at: DateTime<Utc>,
    infections: AtomicU64,
    healed: AtomicU64,
    failed_healings: AtomicU64,
}

/// Fleet statistics for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FleetStats {
    pub run_id: String,
    pub total_agents: usize,
    pub total_executions: u64,
    pub baselines_ready: usize,
    pub currently_infected: usize,
    pub quarantined: usize,
    pub total_infections: u64,
    pub total_healed: u64,
    pub failed_healings: u64,
    pub success_rate: f64,
    pub runtime_s: f64,
    pub degraded: bool,
}

/// Per-agent summary row for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub phase: AgentPhase,
    pub baseline_ready: bool,
    pub sample_count: usize,
    pub quarantined: bool,
}

/// Coordinates the detection–diagnosis–containment–healing pipeline.
pub struct Orchestrator {
    pub(crate) config: CordonConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) telemetry: Arc<TelemetryCollector>,
    pub(crate) learner: Arc<BaselineLearner>,
    pub(crate) sentinel: Sentinel,
    pub(crate) correlator: FleetCorrelator,
    pub(crate) diagnostician: Arc<Diagnostician>,
    pub(crate) healer: Arc<Healer>,
    pub(crate) quarantine: Arc<QuarantineController>,
    pub(crate) lifecycle: Arc<LifecycleManager>,
    fleet: SimFleet,
    episodes: DashMap<String, SuspicionEpisode>,
    sessions: DashMap<String, HealingSession>,
    fold_cursors: DashMap<String, u64>,
    healing_guard: DashMap<String, ()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Stats,
    store_degraded: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.store.run_id())
            .field("agents", &self.lifecycle.agent_ids().len())
            .finish()
    }
}

impl Orchestrator {
    /// Build the pipeline. `fleet` is the simulated-agent registry shared
    /// with the simulated executor; externally-ingesting deployments pass
    /// an empty map.
    pub fn new(
        config: CordonConfig,
        store: Arc<dyn Store>,
        cache: Arc<CacheManager>,
        enforcement: Arc<dyn EnforcementStrategy>,
        executor: Arc<dyn HealingExecutor>,
        fleet: SimFleet,
    ) -> Arc<Self> {
        let telemetry = Arc::new(TelemetryCollector::new(Some(store.clone())));
        let learner = Arc::new(BaselineLearner::new(
            config.baseline.clone(),
            Some(cache.clone()),
        ));
        let memory = Arc::new(ImmuneMemory::new(Some(store.clone())));
        let healer = Arc::new(Healer::new(
            memory,
            executor,
            config.orchestrator.action_timeout,
        ));
        let quarantine = Arc::new(QuarantineController::new(
            enforcement,
            Some(cache.clone()),
            Some(store.clone()),
        ));
        let lifecycle = Arc::new(LifecycleManager::new());

        // Restart resilience: re-enter the cached quarantine set and
        // register agents with cached baselines.
        let cached_quarantine = cache.quarantine();
        quarantine.restore(&cached_quarantine);
        let orchestrator = Arc::new(Self {
            sentinel: Sentinel::new(config.detection.clone()),
            correlator: FleetCorrelator::new(
                config.detection.fleet_wide_fraction,
                config.detection.partial_fleet_fraction,
            ),
            diagnostician: Arc::new(Diagnostician::new()),
            config,
            store,
            cache,
            telemetry,
            learner,
            healer,
            quarantine,
            lifecycle,
            fleet,
            episodes: DashMap::new(),
            sessions: DashMap::new(),
            fold_cursors: DashMap::new(),
            healing_guard: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            stats: Stats {
                started_at: Utc::now(),
                infections: AtomicU64::new(0),
                healed: AtomicU64::new(0),
                failed_healings: AtomicU64::new(0),
            },
            store_degraded: AtomicBool::new(false),
        });

        for agent_id in orchestrator.cache.baselines().keys() {
            orchestrator.ensure_agent(agent_id);
            if orchestrator.learner.ready(agent_id) {
                let _ = orchestrator
                    .lifecycle
                    .transition(agent_id, AgentPhase::Healthy, "baseline_restored");
            }
        }
        orchestrator
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register an agent id; unknown ingest ids are auto-registered.
    pub fn ensure_agent(&self, agent_id: &str) {
        self.lifecycle.register(agent_id);
        self.fold_cursors.entry(agent_id.to_string()).or_insert(0);
    }

    /// Add a simulated agent driven by the agent loop.
    pub fn register_sim_agent(&self, agent: SimulatedAgent) {
        let agent_id = agent.agent_id.clone();
        self.ensure_agent(&agent_id);
        self.fleet
            .insert(agent_id, Arc::new(Mutex::new(agent)));
    }

    pub fn sim_fleet(&self) -> SimFleet {
        self.fleet.clone()
    }

    pub fn run_id(&self) -> &str {
        self.store.run_id()
    }

    // ── Ingest ───────────────────────────────────────────────────────

    /// Accept one vitals record (direct ingest or gateway extraction).
    pub async fn ingest(&self, vitals: AgentVitals) -> Result<IngestOutcome> {
        vitals.validate()?;
        self.ensure_agent(&vitals.agent_id);
        let agent_id = vitals.agent_id.clone();
        let phase = self.lifecycle.phase(&agent_id);

        let outcome = self.telemetry.record(vitals).await;
        self.store_degraded.store(!outcome.store_ok, Ordering::Relaxed);

        // Samples from blocked phases are recorded for the audit trail but
        // never train the baseline.
        if !phase.execution_allowed() {
            self.fold_cursors.insert(agent_id, outcome.seq + 1);
        }

        Ok(if outcome.store_ok {
            IngestOutcome::Stored
        } else {
            IngestOutcome::Degraded
        })
    }

    // ── Agent loop ───────────────────────────────────────────────────

    /// One scheduled tick for a simulated agent: execute if the lifecycle
    /// permits, then feed telemetry.
    pub async fn agent_tick(&self, agent_id: &str) {
        let phase = self.lifecycle.phase(agent_id);
        if !phase.execution_allowed() || self.quarantine.is_quarantined(agent_id) {
            return;
        }
        let Some(handle) = self.fleet.get(agent_id).map(|h| h.clone()) else {
            return;
        };
        let vitals = {
            let mut agent = handle.lock().expect("sim agent poisoned");
            agent.execute()
        };
        if let Err(e) = self.ingest(vitals).await {
            error!(agent = agent_id, error = %e, "agent tick ingest failed");
        }
    }

    // ── Baseline folding ─────────────────────────────────────────────

    /// Fold screened samples into the baseline and advance the cursor.
    async fn fold_pending(&self, agent_id: &str) {
        let cursor = self.fold_cursors.get(agent_id).map(|c| *c).unwrap_or(0);
        let (samples, next) = self.telemetry.samples_since(agent_id, cursor);
        for sample in &samples {
            let outcome = self.learner.fold(sample);
            if outcome.became_ready {
                if self
                    .lifecycle
                    .transition(agent_id, AgentPhase::Healthy, "baseline_ready")
                    .is_ok()
                {
                    self.learner.push_to_store(agent_id, &self.store).await;
                }
            } else if outcome.persist {
                self.learner.push_to_store(agent_id, &self.store).await;
            }
        }
        self.fold_cursors.insert(agent_id.to_string(), next);
    }

    /// Advance the cursor without learning (anomalous window).
    fn discard_pending(&self, agent_id: &str) {
        let cursor = self.fold_cursors.get(agent_id).map(|c| *c).unwrap_or(0);
        let (_, next) = self.telemetry.samples_since(agent_id, cursor);
        self.fold_cursors.insert(agent_id.to_string(), next);
    }

    // ── Sentinel loop ────────────────────────────────────────────────

    /// One sentinel scan over the fleet.
    pub async fn sentinel_tick(self: &Arc<Self>) {
        for agent_id in self.lifecycle.agent_ids() {
            let phase = self.lifecycle.phase(&agent_id);
            match phase {
                AgentPhase::Initializing => self.fold_pending(&agent_id).await,
                AgentPhase::Healthy | AgentPhase::Suspected => {
                    self.scan_agent(&agent_id, phase).await;
                }
                // Draining/quarantined/healing/exhausted agents are handled
                // by containment and healing tasks; probation has its own
                // loop.
                _ => {}
            }
        }
    }

    async fn scan_agent(self: &Arc<Self>, agent_id: &str, phase: AgentPhase) {
        // Local profile, or a store restore after cache loss.
        let Some(baseline) = self
            .learner
            .profile_or_restore(agent_id, &self.store)
            .await
        else {
            self.fold_pending(agent_id).await;
            return;
        };
        let window = self
            .telemetry
            .recent(agent_id, self.config.detection.window)
            .await;
        if window.is_empty() {
            return;
        }

        match self
            .sentinel
            .detect(&window, &baseline, self.learner.min_samples())
        {
            Err(Error::NotReady(_)) => self.fold_pending(agent_id).await,
            Err(e) => warn!(agent = agent_id, error = %e, "sentinel scan failed"),
            Ok(None) => {
                self.fold_pending(agent_id).await;
                if phase == AgentPhase::Suspected {
                    let clean = self.lifecycle.record_clean_tick(agent_id);
                    if clean >= self.config.orchestrator.suspect_ticks {
                        self.episodes.remove(agent_id);
                        let _ = self.lifecycle.transition(
                            agent_id,
                            AgentPhase::Healthy,
                            "anomaly_resolved",
                        );
                    }
                }
            }
            Ok(Some(report)) => self.handle_infection(agent_id, phase, report).await,
        }
    }

    async fn handle_infection(
        self: &Arc<Self>,
        agent_id: &str,
        phase: AgentPhase,
        report: InfectionReport,
    ) {
        // Anomalous samples never train the baseline.
        self.discard_pending(agent_id);

        let episode_started = !self.episodes.contains_key(agent_id);
        if episode_started {
            self.stats.infections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cordon_infections_total").increment(1);
            warn!(agent = agent_id, report = %report, "infection detected");
            if let Err(e) = self.store.write_infection_event(&report).await {
                warn!(agent = agent_id, error = %e, "infection event write failed");
            }
        }

        let correlation = self.correlate(&report).await;
        if correlation.verdict == CorrelationVerdict::FleetWide {
            // External cause: keep the agent under watch, never quarantine.
            info!(agent = agent_id, detail = %correlation.detail, "fleet-wide anomaly, containment suppressed");
            if phase == AgentPhase::Healthy {
                let _ = self
                    .lifecycle
                    .transition(agent_id, AgentPhase::Suspected, "fleet_wide_anomaly");
            } else {
                // The clean streak restarts, but a fleet-attributed scan
                // never counts toward this agent's own escalation.
                self.lifecycle.record_fleet_wide_tick(agent_id);
            }
            self.episodes
                .entry(agent_id.to_string())
                .or_insert(SuspicionEpisode {
                    first_report: report,
                    fleet_wide: true,
                });
            return;
        }

        let severe = report.max_deviation > self.config.detection.severe_skip_sigma;
        let first_report = {
            let mut episode = self
                .episodes
                .entry(agent_id.to_string())
                .or_insert_with(|| SuspicionEpisode {
                    first_report: report.clone(),
                    fleet_wide: false,
                });
            episode.fleet_wide = false;
            episode.first_report.clone()
        };

        let escalate = if phase == AgentPhase::Healthy {
            if severe {
                // Severe deviation bypasses SUSPECTED entirely.
                self.lifecycle
                    .transition(agent_id, AgentPhase::Draining, "severe_anomaly")
                    .is_ok()
            } else {
                let _ = self
                    .lifecycle
                    .transition(agent_id, AgentPhase::Suspected, "anomaly_detected");
                false
            }
        } else {
            let ticks = self.lifecycle.record_anomaly_tick(agent_id);
            if severe || ticks >= self.config.orchestrator.suspect_ticks {
                let reason = if severe { "severe_anomaly" } else { "anomaly_persisted" };
                self.lifecycle
                    .transition(agent_id, AgentPhase::Draining, reason)
                    .is_ok()
            } else {
                false
            }
        };

        if escalate {
            self.episodes.remove(agent_id);
            let orchestrator = Arc::clone(self);
            let agent = agent_id.to_string();
            self.spawn_task(async move {
                orchestrator.contain_agent(agent, first_report).await;
            });
        }
    }

    /// Build the peer set and classify the incident across the fleet.
    async fn correlate(&self, report: &InfectionReport) -> cordon_detection::correlator::CorrelationResult {
        let mut peers: Vec<(String, Vec<AgentVitals>, BaselineProfile)> = Vec::new();
        for agent_id in self.lifecycle.agent_ids() {
            if agent_id == report.agent_id {
                continue;
            }
            let phase = self.lifecycle.phase(&agent_id);
            if !matches!(phase, AgentPhase::Healthy | AgentPhase::Suspected) {
                continue;
            }
            if let Some(baseline) = self.learner.profile(&agent_id) {
                if baseline.ready(self.learner.min_samples()) {
                    let window = self
                        .telemetry
                        .recent_local(&agent_id, self.config.detection.window);
                    peers.push((agent_id, window, baseline));
                }
            }
        }
        self.correlator
            .classify(report, &peers, &self.sentinel, self.learner.min_samples())
    }

    // ── Containment ──────────────────────────────────────────────────

    /// Drain then quarantine, and decide approval vs auto-heal from the
    /// episode's first report.
    async fn contain_agent(self: Arc<Self>, agent_id: String, first_report: InfectionReport) {
        let outcome = self
            .quarantine
            .drain(&agent_id, self.config.orchestrator.drain_timeout)
            .await;
        let reason = match outcome {
            cordon_healing::enforcement::DrainOutcome::Drained => "drain_complete",
            cordon_healing::enforcement::DrainOutcome::TimedOut => "drain_timeout",
        };
        if self
            .lifecycle
            .transition(&agent_id, AgentPhase::Quarantined, reason)
            .is_err()
        {
            return;
        }
        self.quarantine.quarantine(&agent_id, "infection").await;

        if first_report.max_deviation >= self.config.detection.approval_sigma {
            // Severe: park in quarantine behind the approval queue.
            let diagnosis = self
                .diagnostician
                .diagnose(&first_report, None)
                .primary()
                .map(|h| h.kind);
            let event = ApprovalEvent {
                agent_id: agent_id.clone(),
                status: ApprovalStatus::Pending,
                max_deviation: first_report.max_deviation,
                report: first_report.clone(),
                diagnosis,
                created_at: Utc::now(),
                decided_at: None,
            };
            if let Err(e) = self.store.write_approval_event(&event).await {
                error!(agent = %agent_id, error = %e, "pending approval write failed");
            }
            self.log_action(
                "approval_requested",
                &agent_id,
                serde_json::json!({ "max_deviation": first_report.max_deviation }),
            )
            .await;
            info!(
                agent = %agent_id,
                max_deviation = first_report.max_deviation,
                "approval required before healing"
            );
        } else {
            let orchestrator = Arc::clone(&self);
            self.spawn_task(async move {
                orchestrator.heal_agent(agent_id, first_report, "auto").await;
            });
        }
    }

    // ── Healing ──────────────────────────────────────────────────────

    /// Diagnose and walk the policy ladders for an agent. `trigger` is the
    /// provenance recorded in the action log.
    pub(crate) async fn heal_agent(
        self: Arc<Self>,
        agent_id: String,
        report: InfectionReport,
        trigger: &'static str,
    ) {
        if self.healing_guard.insert(agent_id.clone(), ()).is_some() {
            return;
        }
        if self
            .lifecycle
            .transition(&agent_id, AgentPhase::Healing, trigger)
            .is_err()
        {
            self.healing_guard.remove(&agent_id);
            return;
        }

        let diagnosis = self.diagnostician.diagnose(&report, None);
        if let Some(primary) = diagnosis.primary() {
            info!(
                agent = %agent_id,
                diagnosis = %primary.kind,
                confidence = primary.confidence,
                "healing started"
            );
        }
        self.sessions.insert(
            agent_id.clone(),
            HealingSession {
                report,
                hypotheses: diagnosis.hypotheses,
                hypothesis_index: 0,
                pending: None,
            },
        );
        self.advance_healing(agent_id).await;
    }

    /// Try the next action for the current hypothesis; walk hypotheses in
    /// ranked order; park in EXHAUSTED when everything failed. The guard
    /// entry is held by the caller and released here.
    async fn advance_healing(self: Arc<Self>, agent_id: String) {
        loop {
            let (kind, exhausted) = {
                let Some(session) = self.sessions.get(&agent_id) else {
                    break;
                };
                match session.hypotheses.get(session.hypothesis_index) {
                    Some(h) => (h.kind, false),
                    None => (DiagnosisKind::Unknown, true),
                }
            };

            if exhausted {
                warn!(agent = %agent_id, "all healing hypotheses exhausted");
                let _ = self
                    .lifecycle
                    .transition(&agent_id, AgentPhase::Exhausted, "all_actions_exhausted");
                self.log_action("healing_exhausted", &agent_id, serde_json::Value::Null)
                    .await;
                break;
            }

            let Some(action) = self.healer.next_action(&agent_id, kind).await else {
                if let Some(mut session) = self.sessions.get_mut(&agent_id) {
                    session.hypothesis_index += 1;
                }
                continue;
            };

            tokio::time::sleep(self.config.orchestrator.heal_step_delay).await;
            let outcome = self.healer.apply(&agent_id, action).await;
            self.log_action(
                "healing_attempt",
                &agent_id,
                serde_json::json!({
                    "diagnosis": kind.as_str(),
                    "action": action.as_str(),
                    "executed": outcome.success,
                    "message": outcome.message,
                }),
            )
            .await;

            if outcome.success {
                if let Some(mut session) = self.sessions.get_mut(&agent_id) {
                    session.pending = Some((kind, action));
                }
                let _ = self.lifecycle.transition(
                    &agent_id,
                    AgentPhase::Probation,
                    "healing_action_applied",
                );
                // Probation runs the agent again; converge the baseline on
                // the healed normal. A full reset starts learning over.
                self.quarantine.release(&agent_id).await;
                if action == HealingAction::ResetAgent {
                    self.discard_pending(&agent_id);
                    self.learner.hard_reset(&agent_id);
                } else {
                    self.learner.accelerate(&agent_id);
                }
                break;
            }

            // Executor failure: remember it and stay on this hypothesis;
            // the next selection skips the failed action.
            self.stats.failed_healings.fetch_add(1, Ordering::Relaxed);
            self.healer
                .memory()
                .record_outcome(&agent_id, kind, action, false, outcome.message)
                .await;
        }
        self.healing_guard.remove(&agent_id);
    }

    // ── Probation loop ───────────────────────────────────────────────

    /// One probation scan: promote clean agents, relapse anomalous ones.
    pub async fn probation_tick(self: &Arc<Self>) {
        for agent_id in self.lifecycle.agents_in(AgentPhase::Probation) {
            // After RESET_AGENT the baseline re-learns from scratch; until
            // it is ready the agent gets the benefit of the doubt.
            let Some(baseline) = self.learner.profile(&agent_id) else {
                self.fold_pending(&agent_id).await;
                let ticks = self.lifecycle.record_probation_tick(&agent_id);
                if ticks >= self.config.orchestrator.probation_ticks {
                    self.complete_probation(&agent_id).await;
                }
                continue;
            };
            // The verdict must rest on vitals produced after healing;
            // pre-healing samples still sitting in the window don't count.
            let entered = self.lifecycle.entered_at(&agent_id).unwrap_or_else(Utc::now);
            let window: Vec<AgentVitals> = self
                .telemetry
                .recent(&agent_id, self.config.detection.window)
                .await
                .into_iter()
                .filter(|v| v.timestamp >= entered)
                .collect();
            if window.is_empty() {
                continue;
            }

            let verdict = self
                .sentinel
                .detect(&window, &baseline, self.learner.min_samples());
            match verdict {
                Ok(Some(report)) => self.handle_relapse(&agent_id, report).await,
                Ok(None) | Err(Error::NotReady(_)) => {
                    self.fold_pending(&agent_id).await;
                    let ticks = self.lifecycle.record_probation_tick(&agent_id);
                    if ticks >= self.config.orchestrator.probation_ticks {
                        self.complete_probation(&agent_id).await;
                    }
                }
                Err(e) => warn!(agent = %agent_id, error = %e, "probation scan failed"),
            }
        }
    }

    async fn complete_probation(&self, agent_id: &str) {
        if let Some((_, session)) = self.sessions.remove(agent_id) {
            if let Some((kind, action)) = session.pending {
                self.healer
                    .memory()
                    .record_outcome(agent_id, kind, action, true, "probation passed")
                    .await;
            }
        }
        self.stats.healed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cordon_healed_total").increment(1);
        let _ = self
            .lifecycle
            .transition(agent_id, AgentPhase::Healthy, "probation_passed");
        self.quarantine.release(agent_id).await;

        // The healed behavior is the new normal, including its prompt.
        if let Some(latest) = self.telemetry.latest(agent_id).await {
            self.learner.adopt_prompt_hash(agent_id, &latest.prompt_hash);
        }
        self.log_action("healed", agent_id, serde_json::Value::Null)
            .await;
        info!(agent = agent_id, "probation passed, agent healthy");
    }

    async fn handle_relapse(self: &Arc<Self>, agent_id: &str, report: InfectionReport) {
        warn!(agent = agent_id, report = %report, "anomaly returned during probation");
        self.discard_pending(agent_id);
        self.stats.failed_healings.fetch_add(1, Ordering::Relaxed);

        let pending = self
            .sessions
            .get_mut(agent_id)
            .and_then(|mut session| session.pending.take());
        if let Some((kind, action)) = pending {
            self.healer
                .memory()
                .record_outcome(agent_id, kind, action, false, "probation relapse")
                .await;
        }
        if self
            .lifecycle
            .transition(agent_id, AgentPhase::Healing, "probation_relapse")
            .is_err()
        {
            return;
        }
        self.quarantine.quarantine(agent_id, "probation_relapse").await;

        if self.healing_guard.insert(agent_id.to_string(), ()).is_none() {
            let orchestrator = Arc::clone(self);
            let agent = agent_id.to_string();
            self.spawn_task(async move {
                orchestrator.advance_healing(agent).await;
            });
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────

    pub(crate) async fn log_action(
        &self,
        kind: &str,
        agent_id: &str,
        payload: serde_json::Value,
    ) {
        let entry = ActionLogEntry::new(kind, agent_id).with_payload(payload);
        if let Err(e) = self.store.write_action_log(&entry).await {
            warn!(agent = agent_id, error = %e, "action log write failed");
        }
    }

    /// Infection report held by an agent's healing session, if any.
    pub(crate) fn session_report(&self, agent_id: &str) -> Option<InfectionReport> {
        self.sessions.get(agent_id).map(|s| s.report.clone())
    }

    pub(crate) fn spawn_task(
        self: &Arc<Self>,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let handle = tokio::spawn(fut);
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Await every outstanding containment/healing task, including tasks
    /// those tasks spawn. Used by tests and the shutdown drain.
    pub async fn quiesce(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().expect("task list poisoned");
                std::mem::take(&mut *tasks)
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    // ── Dashboard reads ──────────────────────────────────────────────

    pub fn degraded(&self) -> bool {
        self.store_degraded.load(Ordering::Relaxed)
    }

    pub async fn fleet_stats(&self) -> FleetStats {
        let total_executions = match self.store.get_total_executions().await {
            Ok(n) => n,
            Err(_) => self.telemetry.total(),
        };
        let infected = self
            .lifecycle
            .agent_ids()
            .iter()
            .filter(|id| {
                !matches!(
                    self.lifecycle.phase(id),
                    AgentPhase::Healthy | AgentPhase::Initializing
                )
            })
            .count();
        let infections = self.stats.infections.load(Ordering::Relaxed);
        let healed = self.stats.healed.load(Ordering::Relaxed);
        FleetStats {
            run_id: self.store.run_id().to_string(),
            total_agents: self.lifecycle.agent_ids().len(),
            total_executions,
            baselines_ready: self.learner.ready_count(),
            currently_infected: infected,
            quarantined: self.quarantine.count(),
            total_infections: infections,
            total_healed: healed,
            failed_healings: self.stats.failed_healings.load(Ordering::Relaxed),
            success_rate: if infections > 0 {
                healed as f64 / infections as f64
            } else {
                0.0
            },
            runtime_s: (Utc::now() - self.stats.started_at).num_milliseconds() as f64 / 1000.0,
            degraded: self.degraded(),
        }
    }

    pub fn agents_summary(&self) -> Vec<AgentSummary> {
        let mut out: Vec<AgentSummary> = self
            .lifecycle
            .agent_ids()
            .into_iter()
            .map(|agent_id| AgentSummary {
                phase: self.lifecycle.phase(&agent_id),
                baseline_ready: self.learner.ready(&agent_id),
                sample_count: self.telemetry.count(&agent_id),
                quarantined: self.quarantine.is_quarantined(&agent_id),
                agent_id,
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub async fn recent_vitals(&self, agent_id: &str) -> Vec<AgentVitals> {
        self.telemetry
            .recent(agent_id, self.config.detection.window)
            .await
    }

    pub fn baseline_profile(&self, agent_id: &str) -> Option<BaselineProfile> {
        self.learner.profile(agent_id)
    }

    pub fn lifecycle_history(&self, agent_id: Option<&str>) -> Vec<TransitionEvent> {
        self.lifecycle.history(agent_id)
    }

    /// Current lifecycle phase for an agent.
    pub fn phase(&self, agent_id: &str) -> AgentPhase {
        self.lifecycle.phase(agent_id)
    }

    pub fn is_quarantined(&self, agent_id: &str) -> bool {
        self.quarantine.is_quarantined(agent_id)
    }

    /// The fleet-wide immune memory.
    pub fn immune_memory(&self) -> &Arc<ImmuneMemory> {
        self.healer.memory()
    }

    // ── Run loops ────────────────────────────────────────────────────

    /// Spawn the agent, sentinel, probation and cache-flush loops; run for
    /// `duration` (or until shutdown), then drain and flush.
    pub async fn run(
        self: Arc<Self>,
        duration: Option<Duration>,
        shutdown: watch::Receiver<bool>,
    ) {
        let tick = self.config.orchestrator.tick_interval;
        let mut loops: Vec<JoinHandle<()>> = Vec::new();

        for entry in self.fleet.iter() {
            let agent_id = entry.key().clone();
            let orchestrator = Arc::clone(&self);
            let mut stop = shutdown.clone();
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => orchestrator.agent_tick(&agent_id).await,
                        _ = stop.changed() => return,
                    }
                }
            }));
        }

        {
            let orchestrator = Arc::clone(&self);
            let mut stop = shutdown.clone();
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => orchestrator.sentinel_tick().await,
                        _ = stop.changed() => return,
                    }
                }
            }));
        }
        {
            let orchestrator = Arc::clone(&self);
            let mut stop = shutdown.clone();
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => orchestrator.probation_tick().await,
                        _ = stop.changed() => return,
                    }
                }
            }));
        }
        loops.push(tokio::spawn(Arc::clone(&self.cache).run_flusher(
            self.config.cache.flush_interval,
            shutdown.clone(),
        )));

        let mut stop = shutdown.clone();
        match duration {
            Some(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(d) => info!("run duration elapsed"),
                    _ = stop.changed() => info!("shutdown requested"),
                }
            }
            None => {
                let _ = stop.changed().await;
                info!("shutdown requested");
            }
        }

        // Drain: resolve outstanding approvals so quarantined agents get a
        // chance to heal before the run closes.
        let approved = self.approve_all().await.unwrap_or_default();
        let healed_now = self.heal_all_rejected().await.unwrap_or_default();
        if !approved.is_empty() || !healed_now.is_empty() {
            info!(
                approved = approved.len(),
                healed_now = healed_now.len(),
                "shutdown drain scheduled healing"
            );
        }
        let drain = tokio::time::timeout(self.config.orchestrator.drain_timeout, self.quiesce());
        if drain.await.is_err() {
            warn!("shutdown drain timed out with healing in progress");
        }

        for handle in loops {
            handle.abort();
        }
        self.cache.save_if_dirty();
        self.log_summary().await;
    }

    async fn log_summary(&self) {
        let stats = self.fleet_stats().await;
        info!(
            runtime_s = stats.runtime_s,
            agents = stats.total_agents,
            executions = stats.total_executions,
            baselines = stats.baselines_ready,
            infections = stats.total_infections,
            healed = stats.total_healed,
            failed_healings = stats.failed_healings,
            success_rate = stats.success_rate,
            "run summary"
        );
        for (diagnosis, (action, successes)) in self.healer.memory().pattern_summary() {
            info!(
                diagnosis = diagnosis.as_str(),
                best_action = action.as_str(),
                successes,
                "learned healing pattern"
            );
        }
    }
}
