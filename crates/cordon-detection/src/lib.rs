//! # Cordon Detection
//!
//! The observe-and-judge half of the pipeline:
//! - [`telemetry::TelemetryCollector`] — per-agent vitals rings with
//!   write-through to the store
//! - [`baseline::BaselineLearner`] — EWMA mean/variance per metric per agent
//! - [`sentinel::Sentinel`] — pure window-vs-baseline deviation detector
//! - [`correlator::FleetCorrelator`] — agent-specific vs fleet-wide triage
//! - [`diagnosis::Diagnostician`] — ranked root-cause hypotheses with
//!   operator feedback

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod baseline;
pub mod correlator;
pub mod diagnosis;
pub mod sentinel;
pub mod telemetry;

/// Re-export of commonly used items.
pub mod prelude {
    pub use crate::baseline::{BaselineLearner, BaselineProfile, EwmaStat};
    pub use crate::correlator::{CorrelationResult, FleetCorrelator};
    pub use crate::diagnosis::Diagnostician;
    pub use crate::sentinel::Sentinel;
    pub use crate::telemetry::TelemetryCollector;
}
