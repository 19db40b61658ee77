//! Simulated fleet: agents, chaos injection and the simulated executor.
//!
//! The simulated agent models the behavioral surface the control plane
//! observes (latency, tokens, tool calls, retries, cost, prompt hash) plus
//! the internal state healing actions manipulate. The chaos injector
//! plants faults; the simulated executor is the reference implementation of
//! the executor contract.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use cordon_core::prelude::*;
use cordon_healing::executor::{ExecutionOutcome, HealingExecutor};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::info;

/// Approximate USD cost per 1K tokens by model.
fn cost_per_1k(model: &str) -> f64 {
    match model {
        "gpt-5" => 0.03,
        "gpt-4o" => 0.005,
        "claude-sonnet-4" => 0.003,
        "claude-opus-4" => 0.015,
        "gemini-2.0" => 0.00125,
        _ => 0.005,
    }
}

/// Internal agent state the healing actions operate on.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub memory_entries: u32,
    pub prompt_version: u32,
    pub temperature: f64,
    pub max_tools: u32,
    pub tools_revoked: bool,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            memory_entries: 0,
            prompt_version: 1,
            temperature: 0.7,
            max_tools: 5,
            tools_revoked: false,
        }
    }
}

impl AgentState {
    pub fn reset_memory(&mut self) {
        self.memory_entries = 0;
    }

    pub fn rollback_prompt(&mut self) {
        if self.prompt_version > 1 {
            self.prompt_version -= 1;
        }
    }

    pub fn reduce_autonomy(&mut self) {
        self.temperature = (self.temperature * 0.5).max(0.1);
        self.max_tools = self.max_tools.saturating_sub(2).max(1);
    }

    pub fn revoke_tools(&mut self) {
        self.tools_revoked = true;
        self.max_tools = 0;
    }
}

/// Faults the chaos injector can plant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    TokenExplosion,
    ToolLoop,
    LatencySpike,
    RetryStorm,
    PromptDrift,
    CostBlowup,
    Meltdown,
}

impl FaultKind {
    pub const ALL: [FaultKind; 7] = [
        FaultKind::TokenExplosion,
        FaultKind::ToolLoop,
        FaultKind::LatencySpike,
        FaultKind::RetryStorm,
        FaultKind::PromptDrift,
        FaultKind::CostBlowup,
        FaultKind::Meltdown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::TokenExplosion => "token_explosion",
            FaultKind::ToolLoop => "tool_loop",
            FaultKind::LatencySpike => "latency_spike",
            FaultKind::RetryStorm => "retry_storm",
            FaultKind::PromptDrift => "prompt_drift",
            FaultKind::CostBlowup => "cost_blowup",
            FaultKind::Meltdown => "meltdown",
        }
    }
}

/// One simulated agent with a stable behavioral baseline.
#[derive(Debug)]
pub struct SimulatedAgent {
    pub agent_id: String,
    pub agent_type: String,
    pub model: String,
    base_latency_ms: f64,
    base_tokens: u64,
    base_tools: u32,
    pub state: AgentState,
    fault: Option<FaultKind>,
    pub execution_count: u64,
}

impl SimulatedAgent {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, model: &str) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            model: model.to_string(),
            base_latency_ms: rng.gen_range(200.0..400.0),
            base_tokens: rng.gen_range(1000..1500),
            base_tools: rng.gen_range(2..5),
            state: AgentState::default(),
            fault: None,
            execution_count: 0,
        }
    }

    /// Deterministic agent for tests: fixed behavioral baseline.
    pub fn fixed(
        agent_id: impl Into<String>,
        base_latency_ms: f64,
        base_tokens: u64,
        base_tools: u32,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: "worker".to_string(),
            model: "gpt-4o".to_string(),
            base_latency_ms,
            base_tokens,
            base_tools,
            state: AgentState::default(),
            fault: None,
            execution_count: 0,
        }
    }

    pub fn prompt_hash(&self) -> String {
        let digest = Sha256::digest(
            format!("system-prompt-v{}-{}", self.state.prompt_version, self.agent_id).as_bytes(),
        );
        hex::encode(&digest[..8])
    }

    pub fn infect(&mut self, fault: FaultKind) {
        self.fault = Some(fault);
        if fault == FaultKind::PromptDrift {
            self.state.prompt_version += 1;
        }
    }

    pub fn cure(&mut self) {
        self.fault = None;
    }

    pub fn fault(&self) -> Option<FaultKind> {
        self.fault
    }

    /// Produce one vitals sample under the current state and fault.
    pub fn execute(&mut self) -> AgentVitals {
        self.execution_count += 1;
        let mut rng = rand::thread_rng();
        let variance = rng.gen_range(0.9..1.1);

        let mut latency = self.base_latency_ms * variance;
        let mut tokens = (self.base_tokens as f64 * variance) as u64;
        let mut tools = if self.state.tools_revoked {
            0
        } else {
            self.base_tools.min(self.state.max_tools)
        };
        let mut retries = if rng.gen_bool(0.05) { 1 } else { 0 };
        let mut error_type = VitalError::None;

        match self.fault {
            Some(FaultKind::TokenExplosion) => tokens *= 8,
            Some(FaultKind::ToolLoop) => {
                tools = tools.saturating_mul(6).max(12);
                tokens *= 3;
            }
            Some(FaultKind::LatencySpike) => latency *= 5.0,
            Some(FaultKind::RetryStorm) => {
                retries = rng.gen_range(2..5);
                error_type = VitalError::Timeout;
            }
            Some(FaultKind::PromptDrift) => tokens = (tokens as f64 * 2.5) as u64,
            Some(FaultKind::CostBlowup) => tokens *= 6,
            Some(FaultKind::Meltdown) => {
                latency *= 6.0;
                tokens *= 8;
                tools = tools.saturating_mul(5).max(10);
                retries = 3;
                error_type = VitalError::Other;
            }
            None => {}
        }

        let input_tokens = (tokens as f64 * 0.65) as u64;
        let output_tokens = tokens - input_tokens;
        let cost = tokens as f64 * cost_per_1k(&self.model) / 1000.0;

        AgentVitals {
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now(),
            latency_ms: latency,
            input_tokens,
            output_tokens,
            token_count: tokens,
            tool_calls: tools,
            retries,
            success: error_type == VitalError::None,
            cost,
            model: self.model.clone(),
            error_type,
            prompt_hash: self.prompt_hash(),
            agent_type: Some(self.agent_type.clone()),
            mcp_servers: Vec::new(),
        }
    }
}

/// Shared handle map for the simulated fleet.
pub type SimFleet = Arc<DashMap<String, Arc<Mutex<SimulatedAgent>>>>;

/// An empty fleet, for deployments driven purely by external ingest.
pub fn empty_fleet() -> SimFleet {
    Arc::new(DashMap::new())
}

/// Executor that applies healing actions to simulated agent state.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    fleet: SimFleet,
}

impl SimulatedExecutor {
    pub fn new(fleet: SimFleet) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl HealingExecutor for SimulatedExecutor {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn execute(&self, agent_id: &str, action: HealingAction) -> Result<ExecutionOutcome> {
        let Some(handle) = self.fleet.get(agent_id).map(|h| h.clone()) else {
            return Ok(ExecutionOutcome::failed("unknown simulated agent"));
        };
        let mut agent = handle.lock().expect("sim agent poisoned");
        let message = match action {
            HealingAction::ResetMemory => {
                agent.state.reset_memory();
                "memory cleared".to_string()
            }
            HealingAction::RollbackPrompt => {
                agent.state.rollback_prompt();
                format!("prompt rolled back to v{}", agent.state.prompt_version)
            }
            HealingAction::ReduceAutonomy => {
                agent.state.reduce_autonomy();
                format!(
                    "autonomy reduced (temp={:.2}, max_tools={})",
                    agent.state.temperature, agent.state.max_tools
                )
            }
            HealingAction::RevokeTools => {
                agent.state.revoke_tools();
                "tool access revoked".to_string()
            }
            HealingAction::ResetAgent => {
                agent.state = AgentState::default();
                "agent reset to clean state".to_string()
            }
        };
        agent.cure();
        Ok(ExecutionOutcome::ok(message))
    }
}

/// Plants faults into healthy agents for demos and tests.
#[derive(Debug, Default)]
pub struct ChaosInjector;

impl ChaosInjector {
    pub fn new() -> Self {
        Self
    }

    /// Infect up to `count` currently-healthy agents with random faults.
    pub fn inject_random(&self, fleet: &SimFleet, count: usize) -> Vec<(String, FaultKind)> {
        let mut rng = rand::thread_rng();
        let mut healthy: Vec<Arc<Mutex<SimulatedAgent>>> = fleet
            .iter()
            .map(|e| e.value().clone())
            .filter(|h| h.lock().expect("sim agent poisoned").fault().is_none())
            .collect();
        healthy.shuffle(&mut rng);

        let mut injected = Vec::new();
        for handle in healthy.into_iter().take(count) {
            let fault = *FaultKind::ALL.choose(&mut rng).expect("faults non-empty");
            let mut agent = handle.lock().expect("sim agent poisoned");
            agent.infect(fault);
            info!(agent = %agent.agent_id, fault = fault.as_str(), "chaos fault injected");
            injected.push((agent.agent_id.clone(), fault));
        }
        injected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet_with(agent: SimulatedAgent) -> SimFleet {
        let fleet: SimFleet = Arc::new(DashMap::new());
        fleet.insert(agent.agent_id.clone(), Arc::new(Mutex::new(agent)));
        fleet
    }

    #[test]
    fn healthy_execution_stays_near_baseline() {
        let mut agent = SimulatedAgent::fixed("a1", 300.0, 1200, 3);
        for _ in 0..50 {
            let v = agent.execute();
            assert!(v.latency_ms >= 270.0 && v.latency_ms <= 330.0);
            assert!(v.token_count >= 1080 && v.token_count <= 1320);
            assert_eq!(v.token_count, v.input_tokens + v.output_tokens);
            assert!(v.validate().is_ok());
        }
    }

    #[test]
    fn prompt_drift_changes_hash_and_rollback_restores_it() {
        let mut agent = SimulatedAgent::fixed("a1", 300.0, 1200, 3);
        let original = agent.prompt_hash();
        agent.infect(FaultKind::PromptDrift);
        assert_ne!(agent.prompt_hash(), original);
        agent.state.rollback_prompt();
        assert_eq!(agent.prompt_hash(), original);
    }

    #[test]
    fn faults_shift_the_right_metrics() {
        let mut agent = SimulatedAgent::fixed("a1", 300.0, 1200, 3);
        agent.infect(FaultKind::TokenExplosion);
        let v = agent.execute();
        assert!(v.token_count > 6000);

        agent.cure();
        agent.infect(FaultKind::LatencySpike);
        let v = agent.execute();
        assert!(v.latency_ms > 1000.0);

        agent.cure();
        agent.infect(FaultKind::RetryStorm);
        let v = agent.execute();
        assert!(v.retries >= 2);
        assert!(v.error_type.is_error());
    }

    #[tokio::test]
    async fn simulated_executor_applies_actions_and_cures() {
        let mut agent = SimulatedAgent::fixed("a1", 300.0, 1200, 3);
        agent.infect(FaultKind::ToolLoop);
        let fleet = fleet_with(agent);
        let executor = SimulatedExecutor::new(fleet.clone());

        let outcome = executor
            .execute("a1", HealingAction::RevokeTools)
            .await
            .unwrap();
        assert!(outcome.success);

        let handle = fleet.get("a1").unwrap().clone();
        let agent = handle.lock().unwrap();
        assert!(agent.state.tools_revoked);
        assert!(agent.fault().is_none());
    }

    #[tokio::test]
    async fn simulated_executor_reset_restores_defaults() {
        let mut agent = SimulatedAgent::fixed("a1", 300.0, 1200, 3);
        agent.state.revoke_tools();
        agent.state.prompt_version = 4;
        let fleet = fleet_with(agent);
        let executor = SimulatedExecutor::new(fleet.clone());

        executor
            .execute("a1", HealingAction::ResetAgent)
            .await
            .unwrap();
        let handle = fleet.get("a1").unwrap().clone();
        let agent = handle.lock().unwrap();
        assert_eq!(agent.state.prompt_version, 1);
        assert!(!agent.state.tools_revoked);
    }

    #[test]
    fn chaos_injects_only_healthy_agents() {
        let fleet: SimFleet = Arc::new(DashMap::new());
        for i in 0..5 {
            let agent = SimulatedAgent::fixed(format!("a{i}"), 300.0, 1200, 3);
            fleet.insert(agent.agent_id.clone(), Arc::new(Mutex::new(agent)));
        }
        let injected = ChaosInjector::new().inject_random(&fleet, 3);
        assert_eq!(injected.len(), 3);
        let infected = fleet
            .iter()
            .filter(|e| e.value().lock().unwrap().fault().is_some())
            .count();
        assert_eq!(infected, 3);

        // A second wave only reaches the remaining healthy agents.
        let injected = ChaosInjector::new().inject_random(&fleet, 5);
        assert_eq!(injected.len(), 2);
    }
}
