//! # Dispense Core
//!
//! Coordinates a fleet of peristaltic pumps behind TB6612FNG motor drivers:
//!
//! * [`topology`] — the hardware description (controller pinouts and pump
//!   bindings), validated at load time, persisted as JSON.
//! * [`pump`] — one pump: an ingredient identity, a calibrated flow rate and
//!   one H-bridge channel; volumetric dispensing is an open-loop timed run.
//! * [`fleet`] — the set of pumps plus the global emergency-stop latch and
//!   the single-owner operation marker.
//! * [`recipe`] / [`executor`] — drink recipes and the sequencer that turns
//!   them into ordered, progress-reporting pours.
//!
//! Long waits are tokio sleeps raced against a cancellation token, so an
//! emergency stop or a user cancel takes effect at the next suspension point
//! while the fleet mutex stays free for status queries.

use std::time::Duration;

pub mod error;
pub mod executor;
pub mod fleet;
pub mod progress;
pub mod pump;
pub mod recipe;
pub mod topology;

pub use error::{CalibrationError, ConfigError, DispenseError, ExecuteError, FleetError};
pub use executor::RecipeExecutor;
pub use fleet::{Fleet, FleetSnapshot, Operation, OperationGuard};
pub use progress::{ProgressEvent, ProgressListener};
pub use pump::{Pump, PumpState, PumpStatus};
pub use recipe::{PourCategory, Recipe, RecipeBook, RecipeIngredient};
pub use topology::{CalibrationOverlay, ControllerPinout, HardwareTopology, PumpBinding, PumpId};

/// Longest admissible single pour. Dispenses that would run longer are
/// rejected up front rather than timed out.
pub const MAX_POUR_TIME: Duration = Duration::from_secs(60);

/// Pump speed used when the caller does not specify one.
pub const DEFAULT_DISPENSE_SPEED: u8 = 80;

/// Settle time between consecutive pours of a recipe.
pub const INTER_POUR_SETTLE: Duration = Duration::from_millis(200);
