//! # Cordon Core
//!
//! Shared vocabulary for the Cordon control plane:
//! - value records (vitals, baseline profiles, infection reports, diagnoses)
//! - the enums every other crate speaks (anomaly kinds, healing actions,
//!   lifecycle phases)
//! - the error taxonomy
//! - runtime configuration
//!
//! This crate has no I/O and no async surface; everything here is plain data.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod config;
pub mod error;
pub mod events;
pub mod types;
pub mod vitals;

pub use error::{Error, Result};

/// Re-export of commonly used items.
pub mod prelude {
    pub use crate::config::CordonConfig;
    pub use crate::error::{Error, Result};
    pub use crate::events::{
        ActionLogEntry, ApprovalEvent, ApprovalStatus, DiagnosisFeedback, DiagnosisResult,
        HealingEvent, Hypothesis, InfectionReport, QuarantineAction, QuarantineEvent,
        TransitionEvent,
    };
    pub use crate::types::{
        AgentPhase, AnomalyKind, CorrelationVerdict, DiagnosisKind, FeedbackLabel, HealingAction,
        Metric, VitalError,
    };
    pub use crate::vitals::{AgentVitals, GatewayExchange};
}
