//! Enforcement strategies.
//!
//! An enforcement strategy is the capability that actually stops an agent
//! from doing work: gateway policy injection, OS signals, container
//! pause, or a composite chain. Quarantine owns a strategy and dispatches
//! through it on every lifecycle boundary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cordon_core::prelude::*;
use tracing::{info, warn};

/// How a drain concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// In-flight work finished inside the deadline.
    Drained,
    /// The deadline elapsed; the caller proceeds to quarantine anyway.
    TimedOut,
}

/// Capability that blocks, unblocks and drains agents.
#[async_trait]
pub trait EnforcementStrategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Fully block the agent from executing.
    async fn block(&self, agent_id: &str, reason: &str) -> Result<()>;

    /// Remove the block.
    async fn unblock(&self, agent_id: &str) -> Result<()>;

    /// Block new work, let in-flight work finish, bounded by `timeout`.
    async fn drain(&self, agent_id: &str, timeout: Duration) -> Result<DrainOutcome>;
}

// ── No-op (simulations and tests) ────────────────────────────────────

/// In-memory enforcement for simulations. Draining completes immediately.
#[derive(Debug, Default)]
pub struct NoopEnforcement {
    blocked: Mutex<HashMap<String, String>>,
}

impl NoopEnforcement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self, agent_id: &str) -> bool {
        self.blocked
            .lock()
            .expect("noop enforcement poisoned")
            .contains_key(agent_id)
    }
}

#[async_trait]
impl EnforcementStrategy for NoopEnforcement {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn block(&self, agent_id: &str, reason: &str) -> Result<()> {
        self.blocked
            .lock()
            .expect("noop enforcement poisoned")
            .insert(agent_id.to_string(), reason.to_string());
        Ok(())
    }

    async fn unblock(&self, agent_id: &str) -> Result<()> {
        self.blocked
            .lock()
            .expect("noop enforcement poisoned")
            .remove(agent_id);
        Ok(())
    }

    async fn drain(&self, agent_id: &str, _timeout: Duration) -> Result<DrainOutcome> {
        self.block(agent_id, "draining").await?;
        Ok(DrainOutcome::Drained)
    }
}

// ── Gateway policy injection ─────────────────────────────────────────

/// Blocks agent traffic at the LLM gateway by posting policy rules to its
/// admin API.
#[derive(Debug)]
pub struct GatewayEnforcement {
    client: reqwest::Client,
    admin_url: String,
}

impl GatewayEnforcement {
    pub fn new(admin_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("gateway enforcement client: {e}")))?;
        Ok(Self {
            client,
            admin_url: admin_url.into(),
        })
    }

    fn rule_url(&self, agent_id: &str) -> String {
        format!(
            "{}/policies/quarantine:{agent_id}",
            self.admin_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl EnforcementStrategy for GatewayEnforcement {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn block(&self, agent_id: &str, reason: &str) -> Result<()> {
        let resp = self
            .client
            .put(self.rule_url(agent_id))
            .json(&serde_json::json!({
                "agent_pattern": agent_id,
                "action_on_violation": "block",
                "reason": reason,
            }))
            .send()
            .await
            .map_err(|e| Error::executor(format!("gateway block: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::executor(format!("gateway block: HTTP {}", resp.status())));
        }
        info!(agent = agent_id, reason, "gateway block installed");
        Ok(())
    }

    async fn unblock(&self, agent_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.rule_url(agent_id))
            .send()
            .await
            .map_err(|e| Error::executor(format!("gateway unblock: {e}")))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::executor(format!(
                "gateway unblock: HTTP {}",
                resp.status()
            )));
        }
        info!(agent = agent_id, "gateway block removed");
        Ok(())
    }

    async fn drain(&self, agent_id: &str, timeout: Duration) -> Result<DrainOutcome> {
        // The gateway can only stop new requests; give in-flight calls a
        // bounded grace period.
        self.block(agent_id, "draining").await?;
        tokio::time::sleep(timeout.min(Duration::from_secs(5))).await;
        Ok(DrainOutcome::Drained)
    }
}

// ── Process signals ──────────────────────────────────────────────────

/// OS-level control: SIGSTOP to block, SIGCONT to unblock. Agents register
/// their PID at startup.
#[derive(Debug, Default)]
pub struct ProcessEnforcement {
    pids: Mutex<HashMap<String, u32>>,
}

impl ProcessEnforcement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pid(&self, agent_id: &str, pid: u32) {
        self.pids
            .lock()
            .expect("process enforcement poisoned")
            .insert(agent_id.to_string(), pid);
    }

    fn pid(&self, agent_id: &str) -> Result<u32> {
        self.pids
            .lock()
            .expect("process enforcement poisoned")
            .get(agent_id)
            .copied()
            .ok_or_else(|| Error::executor(format!("no PID registered for {agent_id}")))
    }

    async fn signal(pid: u32, sig: &str) -> Result<()> {
        let output = tokio::process::Command::new("kill")
            .args([sig, &pid.to_string()])
            .output()
            .await
            .map_err(|e| Error::executor(format!("kill {sig} {pid}: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::executor(format!(
                "kill {sig} {pid}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl EnforcementStrategy for ProcessEnforcement {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn block(&self, agent_id: &str, reason: &str) -> Result<()> {
        let pid = self.pid(agent_id)?;
        Self::signal(pid, "-STOP").await?;
        info!(agent = agent_id, pid, reason, "process suspended");
        Ok(())
    }

    async fn unblock(&self, agent_id: &str) -> Result<()> {
        let pid = self.pid(agent_id)?;
        Self::signal(pid, "-CONT").await?;
        info!(agent = agent_id, pid, "process resumed");
        Ok(())
    }

    async fn drain(&self, agent_id: &str, timeout: Duration) -> Result<DrainOutcome> {
        // Ask the process to wind down, then suspend it at the deadline.
        let pid = self.pid(agent_id)?;
        let _ = Self::signal(pid, "-USR1").await;
        tokio::time::sleep(timeout.min(Duration::from_secs(30))).await;
        self.block(agent_id, "drain deadline").await?;
        Ok(DrainOutcome::TimedOut)
    }
}

// ── Container pause ──────────────────────────────────────────────────

/// Docker-level control: pause to block, unpause to unblock.
#[derive(Debug, Default)]
pub struct ContainerEnforcement {
    containers: Mutex<HashMap<String, String>>,
}

impl ContainerEnforcement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: &str, container_id: &str) {
        self.containers
            .lock()
            .expect("container enforcement poisoned")
            .insert(agent_id.to_string(), container_id.to_string());
    }

    fn container(&self, agent_id: &str) -> Result<String> {
        self.containers
            .lock()
            .expect("container enforcement poisoned")
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::executor(format!("no container registered for {agent_id}")))
    }

    async fn docker(cmd: &str, container: &str) -> Result<()> {
        let output = tokio::process::Command::new("docker")
            .args([cmd, container])
            .output()
            .await
            .map_err(|e| Error::executor(format!("docker {cmd}: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::executor(format!(
                "docker {cmd} {container}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl EnforcementStrategy for ContainerEnforcement {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn block(&self, agent_id: &str, reason: &str) -> Result<()> {
        let container = self.container(agent_id)?;
        Self::docker("pause", &container).await?;
        info!(agent = agent_id, %container, reason, "container paused");
        Ok(())
    }

    async fn unblock(&self, agent_id: &str) -> Result<()> {
        let container = self.container(agent_id)?;
        Self::docker("unpause", &container).await?;
        info!(agent = agent_id, %container, "container unpaused");
        Ok(())
    }

    async fn drain(&self, agent_id: &str, timeout: Duration) -> Result<DrainOutcome> {
        tokio::time::sleep(timeout.min(Duration::from_secs(30))).await;
        self.block(agent_id, "drain deadline").await?;
        Ok(DrainOutcome::TimedOut)
    }
}

// ── Composite ────────────────────────────────────────────────────────

/// Chains strategies: on block and drain the first success wins; unblock
/// runs every strategy so no layer is left holding a stale block.
#[derive(Debug, Default)]
pub struct CompositeEnforcement {
    strategies: Vec<Box<dyn EnforcementStrategy>>,
}

impl CompositeEnforcement {
    pub fn new(strategies: Vec<Box<dyn EnforcementStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn push(&mut self, strategy: Box<dyn EnforcementStrategy>) {
        self.strategies.push(strategy);
    }
}

#[async_trait]
impl EnforcementStrategy for CompositeEnforcement {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn block(&self, agent_id: &str, reason: &str) -> Result<()> {
        let mut last_err = None;
        for strategy in &self.strategies {
            match strategy.block(agent_id, reason).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(strategy = strategy.name(), agent = agent_id, error = %e, "block failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::executor("no enforcement strategies configured")))
    }

    async fn unblock(&self, agent_id: &str) -> Result<()> {
        let mut last_err = None;
        for strategy in &self.strategies {
            if let Err(e) = strategy.unblock(agent_id).await {
                warn!(strategy = strategy.name(), agent = agent_id, error = %e, "unblock failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) if self.strategies.len() == 1 => Err(e),
            _ => Ok(()),
        }
    }

    async fn drain(&self, agent_id: &str, timeout: Duration) -> Result<DrainOutcome> {
        let mut last_err = None;
        for strategy in &self.strategies {
            match strategy.drain(agent_id, timeout).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(strategy = strategy.name(), agent = agent_id, error = %e, "drain failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::executor("no enforcement strategies configured")))
    }
}
