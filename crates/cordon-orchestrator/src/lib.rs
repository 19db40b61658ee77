//! # Cordon Orchestrator
//!
//! The scheduler that drives the detection–diagnosis–containment–healing
//! pipeline:
//! - [`lifecycle::LifecycleManager`] — the 8-state per-agent machine
//! - [`orchestrator::Orchestrator`] — agent ticks, sentinel scans,
//!   approvals, probation and healing tasks
//! - [`sim`] — simulated fleet, chaos injector and simulated executor

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod approvals;
pub mod lifecycle;
pub mod orchestrator;
pub mod sim;

/// Re-export of commonly used items.
pub mod prelude {
    pub use crate::lifecycle::LifecycleManager;
    pub use crate::orchestrator::{FleetStats, IngestOutcome, Orchestrator};
    pub use crate::sim::{ChaosInjector, FaultKind, SimulatedAgent, SimulatedExecutor};
}
