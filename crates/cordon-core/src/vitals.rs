//! Vitals: one behavioral sample per agent task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Metric, VitalError};

/// A single behavioral sample emitted by an agent for one LLM invocation.
///
/// Immutable after record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVitals {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock latency of the task in milliseconds.
    pub latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `input_tokens + output_tokens`, kept explicit for wire compatibility.
    pub token_count: u64,
    pub tool_calls: u32,
    pub retries: u32,
    pub success: bool,
    /// Estimated cost in USD.
    pub cost: f64,
    pub model: String,
    #[serde(default)]
    pub error_type: VitalError,
    /// Fixed-width hex digest of the system prompt in effect.
    #[serde(default)]
    pub prompt_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
}

impl AgentVitals {
    /// Validate field constraints for records arriving over the wire.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            return Err(Error::bad_input("agent_id must not be empty"));
        }
        if self.latency_ms < 0.0 {
            return Err(Error::bad_input("latency_ms must be >= 0"));
        }
        if self.cost < 0.0 {
            return Err(Error::bad_input("cost must be >= 0"));
        }
        if self.token_count != self.input_tokens + self.output_tokens {
            return Err(Error::bad_input(
                "token_count must equal input_tokens + output_tokens",
            ));
        }
        Ok(())
    }

    /// Value of a tracked metric for this sample.
    ///
    /// Rate metrics are 0/1 indicators; their EWMA mean is the rate.
    pub fn metric_value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Latency => self.latency_ms,
            Metric::Tokens => self.token_count as f64,
            Metric::InputTokens => self.input_tokens as f64,
            Metric::OutputTokens => self.output_tokens as f64,
            Metric::Cost => self.cost,
            Metric::ToolCalls => self.tool_calls as f64,
            Metric::RetryRate => {
                if self.retries > 0 {
                    1.0
                } else {
                    0.0
                }
            }
            Metric::ErrorRate => {
                if self.error_type.is_error() {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// One LLM request/response pair as observed by an external reverse proxy.
///
/// The gateway extraction hook converts this into a vitals record; the
/// semantics downstream are identical to direct ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayExchange {
    pub agent_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: f64,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub retries: u32,
    pub status_code: u16,
    #[serde(default)]
    pub error_type: VitalError,
    #[serde(default)]
    pub prompt_hash: String,
    #[serde(default)]
    pub cost: f64,
}

impl From<GatewayExchange> for AgentVitals {
    fn from(x: GatewayExchange) -> Self {
        let success = (200..400).contains(&x.status_code) && !x.error_type.is_error();
        AgentVitals {
            agent_id: x.agent_id,
            timestamp: Utc::now(),
            latency_ms: x.latency_ms,
            input_tokens: x.input_tokens,
            output_tokens: x.output_tokens,
            token_count: x.input_tokens + x.output_tokens,
            tool_calls: x.tool_calls,
            retries: x.retries,
            success,
            cost: x.cost,
            model: x.model,
            error_type: x.error_type,
            prompt_hash: x.prompt_hash,
            agent_type: None,
            mcp_servers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(agent: &str, latency: f64, tokens: u64) -> AgentVitals {
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
            prompt_hash: "ab12cd34".to_string(),
            agent_type: None,
            mcp_servers: Vec::new(),
        }
    }

    #[test]
    fn validate_rejects_negative_latency() {
        let mut v = sample("a1", 100.0, 1000);
        v.latency_ms = -1.0;
        assert!(v.validate().is_err());
    }

    #[test]
    fn validate_rejects_token_mismatch() {
        let mut v = sample("a1", 100.0, 1000);
        v.token_count = 999;
        assert!(v.validate().is_err());
    }

    #[test]
    fn rate_metrics_are_indicators() {
        let mut v = sample("a1", 100.0, 1000);
        assert_eq!(v.metric_value(Metric::RetryRate), 0.0);
        v.retries = 3;
        assert_eq!(v.metric_value(Metric::RetryRate), 1.0);
        v.error_type = VitalError::Timeout;
        assert_eq!(v.metric_value(Metric::ErrorRate), 1.0);
    }

    #[test]
    fn gateway_exchange_converts() {
        let x = GatewayExchange {
            agent_id: "a1".to_string(),
            model: "gpt-4o".to_string(),
            input_tokens: 700,
            output_tokens: 300,
            latency_ms: 250.0,
            tool_calls: 1,
            retries: 0,
            status_code: 200,
            error_type: VitalError::None,
            prompt_hash: "deadbeef".to_string(),
            cost: 0.004,
        };
        let v: AgentVitals = x.into();
        assert!(v.success);
        assert_eq!(v.token_count, 1000);
        assert!(v.validate().is_ok());
    }
}
