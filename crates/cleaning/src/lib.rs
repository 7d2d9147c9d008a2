//! # Cleaning and Maintenance
//!
//! Drives the same pump fleet as the recipe executor through multi-phase
//! rinse / clean / sanitize / dry cycles:
//!
//! * [`cycle`] — the four built-in cycle definitions and their invariants,
//!   overridable from a config file.
//! * [`controller`] — the phase state machine: circulation pulses, cleaning
//!   solution metering, progress reporting and abort semantics.
//! * [`history`] — the bounded ring of past cleaning runs.
//! * [`maintenance`] — when the next clean is due (per-cocktail and
//!   per-elapsed-time thresholds).
//!
//! A cleaning run claims the fleet's operation marker exactly like a recipe
//! does, so a drink and a clean can never overlap.

use thiserror::Error;

use dispense::{ConfigError, FleetError};

pub mod controller;
pub mod cycle;
pub mod history;
pub mod maintenance;

pub use controller::CleaningController;
pub use cycle::{CleaningCycle, CleaningMode, CleaningPhase, CycleLibrary, PhaseSpec};
pub use history::{CleaningHistory, CleaningRecord, HISTORY_CAPACITY};
pub use maintenance::MaintenanceLog;

/// Errors reported by the cleaning subsystem.
#[derive(Debug, Error)]
pub enum CleaningError {
    #[error("cycle for mode {0} has no phases")]
    EmptyCycle(CleaningMode),
    #[error("a dry phase must not meter cleaning solution")]
    DryPhaseWithSolution,
    #[error("no cycle is defined for mode {0}")]
    UnknownMode(CleaningMode),
    #[error("no pumps are targeted for cleaning")]
    NoTargets,
    #[error("cleaning cycle aborted")]
    Aborted,
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
