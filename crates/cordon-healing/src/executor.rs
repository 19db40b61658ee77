//! Healing executors.
//!
//! An executor is the capability that applies one healing action to one
//! agent. The healer depends only on this contract; concrete bindings talk
//! to an agent control API, a container runtime, or a gateway policy
//! surface.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cordon_core::prelude::*;
use tracing::{info, warn};

/// Result of applying one action.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub message: String,
}

impl ExecutionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Capability that carries out healing actions.
#[async_trait]
pub trait HealingExecutor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Apply `action` to `agent_id`. Implementations report failure through
    /// the outcome rather than panicking; transport errors map to
    /// `Error::Executor`.
    async fn execute(&self, agent_id: &str, action: HealingAction) -> Result<ExecutionOutcome>;
}

// ── HTTP control API (process-level healing) ─────────────────────────

/// Heals agents through a control API exposed by the agent process:
///
/// ```text
/// POST {base}/control/reset-memory
/// POST {base}/control/rollback-prompt
/// POST {base}/control/reduce-autonomy
/// POST {base}/control/revoke-tools
/// POST {base}/control/restart
/// ```
#[derive(Debug)]
pub struct HttpControlExecutor {
    client: reqwest::Client,
    control_urls: Mutex<HashMap<String, String>>,
}

impl HttpControlExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("control client: {e}")))?;
        Ok(Self {
            client,
            control_urls: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, agent_id: &str, base_url: &str) {
        self.control_urls
            .lock()
            .expect("control urls poisoned")
            .insert(agent_id.to_string(), base_url.trim_end_matches('/').to_string());
    }

    fn endpoint(action: HealingAction) -> &'static str {
        match action {
            HealingAction::ResetMemory => "/control/reset-memory",
            HealingAction::RollbackPrompt => "/control/rollback-prompt",
            HealingAction::ReduceAutonomy => "/control/reduce-autonomy",
            HealingAction::RevokeTools => "/control/revoke-tools",
            HealingAction::ResetAgent => "/control/restart",
        }
    }
}

#[async_trait]
impl HealingExecutor for HttpControlExecutor {
    fn name(&self) -> &'static str {
        "http_control"
    }

    async fn execute(&self, agent_id: &str, action: HealingAction) -> Result<ExecutionOutcome> {
        let base = self
            .control_urls
            .lock()
            .expect("control urls poisoned")
            .get(agent_id)
            .cloned();
        let Some(base) = base else {
            return Ok(ExecutionOutcome::failed("no control URL registered"));
        };
        let url = format!("{base}{}", Self::endpoint(action));
        match self.client.post(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(agent = agent_id, %action, %url, "control API accepted");
                Ok(ExecutionOutcome::ok(format!(
                    "{action} accepted (HTTP {})",
                    resp.status()
                )))
            }
            Ok(resp) => Ok(ExecutionOutcome::failed(format!(
                "control API returned HTTP {}",
                resp.status()
            ))),
            Err(e) => Err(Error::executor(format!("control API {url}: {e}"))),
        }
    }
}

// ── Container runtime ────────────────────────────────────────────────

/// Heals agents through container orchestration. `ResetAgent` maps to a
/// container restart; other actions delegate to a fallback executor.
#[derive(Debug)]
pub struct ContainerExecutor {
    containers: Mutex<HashMap<String, String>>,
    fallback: Option<Box<dyn HealingExecutor>>,
}

impl ContainerExecutor {
    pub fn new(fallback: Option<Box<dyn HealingExecutor>>) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    pub fn register(&self, agent_id: &str, container_id: &str) {
        self.containers
            .lock()
            .expect("containers poisoned")
            .insert(agent_id.to_string(), container_id.to_string());
    }
}

#[async_trait]
impl HealingExecutor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn execute(&self, agent_id: &str, action: HealingAction) -> Result<ExecutionOutcome> {
        let container = self
            .containers
            .lock()
            .expect("containers poisoned")
            .get(agent_id)
            .cloned();
        let Some(container) = container else {
            return Ok(ExecutionOutcome::failed("no container registered"));
        };

        if action != HealingAction::ResetAgent {
            if let Some(fallback) = &self.fallback {
                return fallback.execute(agent_id, action).await;
            }
            return Ok(ExecutionOutcome::failed(format!(
                "no container handler for {action}"
            )));
        }

        let output = tokio::process::Command::new("docker")
            .args(["restart", &container])
            .output()
            .await
            .map_err(|e| Error::executor(format!("docker restart: {e}")))?;
        if output.status.success() {
            info!(agent = agent_id, %container, "container restarted");
            Ok(ExecutionOutcome::ok(format!("docker restart {container}")))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(agent = agent_id, %container, %stderr, "container restart failed");
            Ok(ExecutionOutcome::failed(format!(
                "docker restart {container}: {stderr}"
            )))
        }
    }
}

// ── Gateway policy surface ───────────────────────────────────────────

/// Applies healing by posting policy rules to an LLM gateway admin API.
///
/// `ReduceAutonomy` injects a throttle rule, `RevokeTools` blocks
/// function-calling, `ResetAgent` installs a full block; memory and prompt
/// actions raise operator alerts since the gateway cannot reach agent
/// internals.
#[derive(Debug)]
pub struct GatewayExecutor {
    client: reqwest::Client,
    admin_url: String,
}

impl GatewayExecutor {
    pub fn new(admin_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("gateway client: {e}")))?;
        Ok(Self {
            client,
            admin_url: admin_url.into(),
        })
    }

    async fn post_rule(&self, rule: serde_json::Value) -> Result<()> {
        let url = format!("{}/policies", self.admin_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&rule)
            .send()
            .await
            .map_err(|e| Error::executor(format!("gateway policy: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::executor(format!(
                "gateway policy: HTTP {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl HealingExecutor for GatewayExecutor {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn execute(&self, agent_id: &str, action: HealingAction) -> Result<ExecutionOutcome> {
        let outcome = match action {
            HealingAction::ReduceAutonomy => {
                self.post_rule(serde_json::json!({
                    "name": format!("heal:throttle:{agent_id}"),
                    "agent_pattern": agent_id,
                    "max_requests_per_minute": 2,
                    "max_tokens_per_request": 500,
                    "action_on_violation": "throttle",
                }))
                .await?;
                ExecutionOutcome::ok("throttle rule injected (2 req/min, 500 tok/req)")
            }
            HealingAction::RevokeTools => {
                self.post_rule(serde_json::json!({
                    "name": format!("heal:no-tools:{agent_id}"),
                    "agent_pattern": agent_id,
                    "block_tool_calls": true,
                    "action_on_violation": "block",
                }))
                .await?;
                ExecutionOutcome::ok("tool-calling blocked via gateway policy")
            }
            HealingAction::ResetAgent => {
                self.post_rule(serde_json::json!({
                    "name": format!("heal:block:{agent_id}"),
                    "agent_pattern": agent_id,
                    "action_on_violation": "block",
                }))
                .await?;
                warn!(agent = agent_id, "full gateway block applied, operator restart required");
                ExecutionOutcome::ok("agent fully blocked at gateway")
            }
            HealingAction::ResetMemory | HealingAction::RollbackPrompt => {
                warn!(agent = agent_id, %action, "gateway cannot reach agent internals, operator alerted");
                ExecutionOutcome::failed(format!("{action} requires agent-side control"))
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_control_url_fails_cleanly() {
        let executor = HttpControlExecutor::new(Duration::from_millis(200)).unwrap();
        let outcome = executor
            .execute("ghost", HealingAction::ResetMemory)
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn unreachable_control_url_is_executor_error() {
        let executor = HttpControlExecutor::new(Duration::from_millis(200)).unwrap();
        executor.register("a1", "http://127.0.0.1:1");
        let err = executor
            .execute("a1", HealingAction::ResetMemory)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "executor_failure");
    }

    #[test]
    fn endpoints_cover_every_action() {
        for action in [
            HealingAction::ResetMemory,
            HealingAction::RollbackPrompt,
            HealingAction::ReduceAutonomy,
            HealingAction::RevokeTools,
            HealingAction::ResetAgent,
        ] {
            assert!(HttpControlExecutor::endpoint(action).starts_with("/control/"));
        }
    }
}
