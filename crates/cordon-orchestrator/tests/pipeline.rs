//! End-to-end pipeline scenarios: warmup, detection, containment,
//! approvals, fleet correlation and multi-step healing.
//!
//! Every tick is driven explicitly so the scenarios are deterministic.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cordon_core::config::CordonConfig;
use cordon_core::prelude::*;
use cordon_healing::enforcement::NoopEnforcement;
use cordon_healing::executor::{ExecutionOutcome, HealingExecutor};
use cordon_orchestrator::prelude::*;
use cordon_store::cache::CacheManager;
use cordon_store::memory::MemoryStore;
use cordon_store::Store;

/// Executor that records calls and fails a scripted set of actions.
#[derive(Debug, Default)]
struct ScriptedExecutor {
    fail: Mutex<HashSet<HealingAction>>,
    calls: Mutex<Vec<HealingAction>>,
}

impl ScriptedExecutor {
    fn failing(actions: &[HealingAction]) -> Self {
        Self {
            fail: Mutex::new(actions.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<HealingAction> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealingExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        _agent_id: &str,
        action: HealingAction,
    ) -> cordon_core::Result<ExecutionOutcome> {
        self.calls.lock().unwrap().push(action);
        if self.fail.lock().unwrap().contains(&action) {
            Ok(ExecutionOutcome::failed("scripted failure"))
        } else {
            Ok(ExecutionOutcome::ok("scripted success"))
        }
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<MemoryStore>,
    executor: Arc<ScriptedExecutor>,
    _cache_dir: tempfile::TempDir,
}

fn harness(executor: ScriptedExecutor) -> Harness {
    let mut config = CordonConfig::default();
    config.orchestrator.heal_step_delay = Duration::from_millis(0);
    config.orchestrator.drain_timeout = Duration::from_secs(1);
    config.orchestrator.action_timeout = Duration::from_secs(1);

    let store = Arc::new(MemoryStore::new("run-e2e"));
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::new(cache_dir.path()));
    cache.load();
    let executor = Arc::new(executor);

    let orchestrator = Orchestrator::new(
        config,
        store.clone() as Arc<dyn Store>,
        cache,
        Arc::new(NoopEnforcement::new()),
        executor.clone(),
        cordon_orchestrator::sim::empty_fleet(),
    );
    Harness {
        orchestrator,
        store,
        executor,
        _cache_dir: cache_dir,
    }
}

fn vitals(agent: &str, latency: f64, tokens: u64, tools: u32, hash: &str) -> AgentVitals {
    AgentVitals {
        agent_id: agent.to_string(),
        timestamp: Utc::now(),
        latency_ms: latency,
        input_tokens: tokens / 2,
        output_tokens: tokens - tokens / 2,
        token_count: tokens,
        tool_calls: tools,
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

fn clean(agent: &str) -> AgentVitals {
    vitals(agent, 100.0, 1000, 2, "h1")
}

/// Feed 15 clean samples and run one sentinel scan: baseline ready,
/// lifecycle HEALTHY.
async fn warm_up(h: &Harness, agent: &str) {
    for _ in 0..15 {
        h.orchestrator.ingest(clean(agent)).await.unwrap();
    }
    h.orchestrator.sentinel_tick().await;
    assert_eq!(h.orchestrator.phase(agent), AgentPhase::Healthy);
}

/// Run `n` clean probation rounds.
async fn pass_probation(h: &Harness, agent: &str, n: u32) {
    for _ in 0..n {
        h.orchestrator.ingest(clean(agent)).await.unwrap();
        h.orchestrator.probation_tick().await;
    }
}

// ── Scenario 1: baseline warmup + clean traffic ─────────────────────

#[tokio::test]
async fn warmup_then_clean_traffic_stays_healthy() {
    let h = harness(ScriptedExecutor::default());
    warm_up(&h, "a1").await;

    for _ in 0..5 {
        h.orchestrator.ingest(clean("a1")).await.unwrap();
        h.orchestrator.sentinel_tick().await;
    }
    h.orchestrator.quiesce().await;

    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Healthy);
    assert_eq!(h.store.infection_count(), 0);
    assert!(h.orchestrator.pending_approvals().await.unwrap().is_empty());

    let baseline = h.orchestrator.baseline_profile("a1").unwrap();
    assert!(baseline.ready(15));
}

// ── Scenario 2: mild latency spike → auto-heal → probation ──────────

#[tokio::test]
async fn mild_latency_spike_auto_heals() {
    let h = harness(ScriptedExecutor::default());
    warm_up(&h, "a1").await;

    // First spiked sample: window mean 120, floor 5 → 4σ. Mild band.
    h.orchestrator
        .ingest(vitals("a1", 200.0, 1000, 2, "h1"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Suspected);

    // Second spiked sample inflates the window past the severe-skip bar;
    // the containment decision still uses the episode's first report (4σ).
    h.orchestrator
        .ingest(vitals("a1", 200.0, 1000, 2, "h1"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    h.orchestrator.quiesce().await;

    // Below the approval bar: healed directly, no pending entry.
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Probation);
    assert!(h.orchestrator.pending_approvals().await.unwrap().is_empty());
    assert_eq!(h.executor.calls().len(), 1);

    pass_probation(&h, "a1", 10).await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Healthy);
    assert!(!h.orchestrator.is_quarantined("a1"));
}

// ── Scenario 3: severe token spike → pending approval → approve ─────

#[tokio::test]
async fn severe_token_spike_requires_approval() {
    let h = harness(ScriptedExecutor::default());
    warm_up(&h, "a1").await;

    // 10x tokens: (2800-1000)/50 = 36σ on the first scan. Severe skip
    // bypasses SUSPECTED; the report lands in the approval queue.
    h.orchestrator
        .ingest(vitals("a1", 100.0, 10_000, 2, "h1"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    h.orchestrator.quiesce().await;

    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Quarantined);
    assert!(h.orchestrator.is_quarantined("a1"));
    let pending = h.orchestrator.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].agent_id, "a1");
    assert!(pending[0].max_deviation >= 5.0);
    assert!(pending[0].report.has(AnomalyKind::TokenSpike));

    // Approve: healing starts with RESET_MEMORY (prompt-drift ladder head).
    assert!(h.orchestrator.approve("a1").await.unwrap());
    h.orchestrator.quiesce().await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Probation);
    assert_eq!(h.executor.calls()[0], HealingAction::ResetMemory);
    assert!(h.orchestrator.pending_approvals().await.unwrap().is_empty());

    pass_probation(&h, "a1", 10).await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Healthy);
}

// ── Scenario 4: reject, then heal-now ───────────────────────────────

#[tokio::test]
async fn reject_keeps_quarantine_until_heal_now() {
    let h = harness(ScriptedExecutor::default());
    warm_up(&h, "a1").await;

    h.orchestrator
        .ingest(vitals("a1", 100.0, 10_000, 2, "h1"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    h.orchestrator.quiesce().await;

    assert!(h.orchestrator.reject("a1").await.unwrap());
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Quarantined);
    assert!(h.orchestrator.is_quarantined("a1"));
    let rejected = h.orchestrator.rejected_approvals().await.unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].agent_id, "a1");
    assert!(h.orchestrator.pending_approvals().await.unwrap().is_empty());

    // More scans while rejected: the agent stays parked.
    h.orchestrator.sentinel_tick().await;
    h.orchestrator.quiesce().await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Quarantined);

    // Heal-now lifts the rejection and healing proceeds.
    assert!(h.orchestrator.heal_now("a1").await.unwrap());
    h.orchestrator.quiesce().await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Probation);
    assert!(h.orchestrator.rejected_approvals().await.unwrap().is_empty());

    pass_probation(&h, "a1", 10).await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Healthy);
}

// ── Scenario 5: fleet-wide spike → no quarantine ────────────────────

#[tokio::test]
async fn fleet_wide_spike_suppresses_quarantine() {
    let h = harness(ScriptedExecutor::default());
    let agents: Vec<String> = (0..10).map(|i| format!("agent-{i}")).collect();
    for agent in &agents {
        warm_up(&h, agent).await;
    }

    // Three rounds of a simultaneous latency spike across the fleet.
    for _ in 0..3 {
        for agent in &agents {
            h.orchestrator
                .ingest(vitals(agent, 300.0, 1000, 2, "h1"))
                .await
                .unwrap();
        }
        h.orchestrator.sentinel_tick().await;
    }
    h.orchestrator.quiesce().await;

    for agent in &agents {
        assert_eq!(
            h.orchestrator.phase(agent),
            AgentPhase::Suspected,
            "{agent} must stay suspected"
        );
        assert!(!h.orchestrator.is_quarantined(agent));
    }
    assert!(h.orchestrator.pending_approvals().await.unwrap().is_empty());
    // Every agent's episode was logged as an infection event.
    assert_eq!(h.store.infection_count(), 10);

    // The spike ends; after the window clears and three clean scans the
    // fleet returns to healthy.
    for _ in 0..9 {
        for agent in &agents {
            h.orchestrator.ingest(clean(agent)).await.unwrap();
        }
        h.orchestrator.sentinel_tick().await;
    }
    for agent in &agents {
        assert_eq!(h.orchestrator.phase(agent), AgentPhase::Healthy);
    }
}

// ── Fleet-wide episode narrowing to one agent ───────────────────────

#[tokio::test]
async fn fleet_episode_narrowing_to_one_agent_contains_only_it() {
    let h = harness(ScriptedExecutor::default());
    let agents: Vec<String> = (0..10).map(|i| format!("agent-{i}")).collect();
    for agent in &agents {
        warm_up(&h, agent).await;
    }

    // Phase one: the whole fleet spikes. Held in SUSPECTED, nothing
    // contained; fleet-attributed scans never accrue suspect ticks.
    for _ in 0..3 {
        for agent in &agents {
            h.orchestrator
                .ingest(vitals(agent, 300.0, 1000, 2, "h1"))
                .await
                .unwrap();
        }
        h.orchestrator.sentinel_tick().await;
    }
    h.orchestrator.quiesce().await;
    for agent in &agents {
        assert_eq!(h.orchestrator.phase(agent), AgentPhase::Suspected);
        assert!(!h.orchestrator.is_quarantined(agent));
    }

    // Phase two: the external cause clears everywhere except agent-0.
    // While the recovering agents' windows still carry spike samples the
    // verdict stays fleet-wide, so nobody is contained off those scans.
    for round in 0..7 {
        for agent in &agents {
            let latency = if agent == "agent-0" { 300.0 } else { 100.0 };
            h.orchestrator
                .ingest(vitals(agent, latency, 1000, 2, "h1"))
                .await
                .unwrap();
        }
        h.orchestrator.sentinel_tick().await;
        h.orchestrator.quiesce().await;
        if round < 4 {
            for agent in &agents {
                assert!(!h.orchestrator.is_quarantined(agent), "{agent} round {round}");
            }
        }
    }

    // Once its peers scan clean, agent-0's anomaly is agent-specific and
    // containment proceeds from the episode's first report (8σ → queue).
    assert_eq!(h.orchestrator.phase("agent-0"), AgentPhase::Quarantined);
    assert!(h.orchestrator.is_quarantined("agent-0"));
    let pending = h.orchestrator.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].agent_id, "agent-0");
    assert!(pending[0].max_deviation >= 5.0);

    for agent in agents.iter().filter(|a| *a != "agent-0") {
        assert_eq!(h.orchestrator.phase(agent), AgentPhase::Healthy);
        assert!(!h.orchestrator.is_quarantined(agent));
    }
}

// ── Scenario 6: primary actions fail → secondary succeeds ───────────

#[tokio::test]
async fn failed_actions_advance_ladder_and_feed_immune_memory() {
    let h = harness(ScriptedExecutor::failing(&[
        HealingAction::RevokeTools,
        HealingAction::ResetMemory,
    ]));
    warm_up(&h, "a1").await;

    // Prompt change + tool explosion: the prompt-injection pattern.
    h.orchestrator
        .ingest(vitals("a1", 100.0, 1000, 12, "evil-hash"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    h.orchestrator.quiesce().await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Quarantined);

    assert!(h.orchestrator.approve("a1").await.unwrap());
    h.orchestrator.quiesce().await;

    // REVOKE_TOOLS and RESET_MEMORY failed, ROLLBACK_PROMPT applied.
    assert_eq!(
        h.executor.calls(),
        vec![
            HealingAction::RevokeTools,
            HealingAction::ResetMemory,
            HealingAction::RollbackPrompt,
        ]
    );
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Probation);

    pass_probation(&h, "a1", 10).await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Healthy);

    // Immune memory: two failures, one success for this agent/diagnosis.
    let memory = h.orchestrator.immune_memory();
    let failed = memory
        .failed_actions("a1", DiagnosisKind::PromptInjection)
        .await;
    assert_eq!(
        failed,
        vec![HealingAction::RevokeTools, HealingAction::ResetMemory]
    );
    assert!(
        (memory.success_rate(DiagnosisKind::PromptInjection, HealingAction::RollbackPrompt) - 1.0)
            .abs()
            < 1e-9
    );
    let history = memory.history("a1");
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|r| r.success).count(), 1);
}

// ── Approval band: deviation at/above the threshold goes to the queue ─

#[tokio::test]
async fn approval_band_deviation_requires_approval() {
    let h = harness(ScriptedExecutor::default());
    warm_up(&h, "a1").await;

    // Latency 230 in one sample: window mean 126, floor 5 → 5.2σ. At or
    // above the (inclusive) approval threshold but under the severe-skip
    // bar, so the episode runs through SUSPECTED before containment.
    h.orchestrator
        .ingest(vitals("a1", 230.0, 1000, 2, "h1"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Suspected);
    h.orchestrator
        .ingest(vitals("a1", 230.0, 1000, 2, "h1"))
        .await
        .unwrap();
    h.orchestrator.sentinel_tick().await;
    h.orchestrator.quiesce().await;

    assert_eq!(h.orchestrator.phase("a1"), AgentPhase::Quarantined);
    let pending = h.orchestrator.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].max_deviation >= 5.0 && pending[0].max_deviation < 6.0);
}

// ── Run isolation ───────────────────────────────────────────────────

#[tokio::test]
async fn events_are_scoped_by_run_id() {
    let h = harness(ScriptedExecutor::default());
    warm_up(&h, "a1").await;
    assert!(h.store.get_total_executions().await.unwrap() >= 15);

    let other_run = h.store.with_run_id("run-other");
    assert_eq!(other_run.get_total_executions().await.unwrap(), 0);
    assert!(other_run
        .get_latest_agent_vitals("a1")
        .await
        .unwrap()
        .is_none());
}
