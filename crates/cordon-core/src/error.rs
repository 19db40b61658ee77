//! Error taxonomy for the control plane.
//!
//! Every kind maps to a documented recovery policy: store and executor
//! failures are try-and-continue, cache corruption discards the snapshot,
//! drain timeouts proceed to quarantine, exhaustion parks the agent.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Control-plane error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Client payload is malformed or missing required fields.
    #[error("bad input: {0}")]
    BadInput(String),

    /// API key missing or invalid.
    #[error("unauthorized")]
    Unauthorized,

    /// Baseline not ready yet; detection intentionally skipped.
    #[error("baseline not ready for agent {0}")]
    NotReady(String),

    /// Store I/O failed; callers retry on the next tick.
    #[error("store failure: {0}")]
    Store(String),

    /// Cache snapshot invalid; discarded and the run continues.
    #[error("cache corrupt: {0}")]
    CacheCorrupt(String),

    /// A healing action failed; recorded and the ladder advances.
    #[error("executor failure: {0}")]
    Executor(String),

    /// A healing action exceeded its deadline; treated as a failure.
    #[error("executor timed out after {0:?}")]
    ExecutorTimeout(std::time::Duration),

    /// Drain did not complete in time; the agent proceeds to quarantine.
    #[error("drain timed out for agent {0}")]
    DrainTimeout(String),

    /// No healing actions remain for any hypothesis.
    #[error("healing exhausted for agent {0}")]
    Exhausted(String),

    /// A lifecycle transition was attempted along a disallowed edge.
    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),

    /// Invalid configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Construct a `BadInput` error.
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Error::BadInput(msg.into())
    }

    /// Construct a `Store` error.
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    /// Construct an `Executor` error.
    pub fn executor(msg: impl Into<String>) -> Self {
        Error::Executor(msg.into())
    }

    /// Construct a `Config` error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Stable kind label used in HTTP responses and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadInput(_) => "bad_input",
            Error::Unauthorized => "unauthorized",
            Error::NotReady(_) => "not_ready",
            Error::Store(_) => "transient_store_failure",
            Error::CacheCorrupt(_) => "cache_corrupt",
            Error::Executor(_) => "executor_failure",
            Error::ExecutorTimeout(_) => "executor_timeout",
            Error::DrainTimeout(_) => "drain_timeout",
            Error::Exhausted(_) => "exhaustion",
            Error::Lifecycle(_) => "lifecycle",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Serde(_) => "serde",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::bad_input("x").kind(), "bad_input");
        assert_eq!(Error::store("down").kind(), "transient_store_failure");
        assert_eq!(Error::Unauthorized.kind(), "unauthorized");
        assert_eq!(
            Error::ExecutorTimeout(std::time::Duration::from_secs(10)).kind(),
            "executor_timeout"
        );
    }
}
