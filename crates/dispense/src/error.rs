//! Error taxonomy for the dispense core.
//!
//! Hardware faults propagate fully — they represent a real-world safety
//! state. Shape errors (unknown ingredient, bad volume, unsatisfiable
//! recipe) are recoverable by the caller. Nothing here ever clears the
//! emergency latch; only an explicit `reset_emergency` does.

use std::path::PathBuf;

use thiserror::Error;

use driver_tb6612::{Channel, DriverError};
use gpio::Pin;

use crate::fleet::Operation;
use crate::topology::PumpId;

/// Topology validation or persistence failure. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("direction pin {0} is assigned more than once")]
    DuplicateDirectionPin(Pin),
    #[error("pin {0} is outside the addressable range (0-27 or 100+)")]
    PinOutOfRange(Pin),
    #[error("pump {pump_id} references controller {controller_index}, which does not exist")]
    UnknownController {
        pump_id: PumpId,
        controller_index: usize,
    },
    #[error("controller {controller_index} channel {} is bound to more than one pump", .channel.as_str())]
    ChannelCollision {
        controller_index: usize,
        channel: Channel,
    },
    #[error("duplicate pump id {0}")]
    DuplicatePumpId(PumpId),
    #[error("ingredient {0:?} is bound to more than one pump")]
    DuplicateIngredient(String),
    #[error("pump {0} has a non-positive flow rate")]
    NonPositiveFlowRate(PumpId),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A single dispense refused or terminated early.
#[derive(Debug, Error)]
pub enum DispenseError {
    #[error("requested volume must be positive")]
    VolumeNonPositive,
    #[error("volume {volume_ml} ml would exceed the maximum pour time")]
    VolumeTooLarge { volume_ml: f64 },
    #[error("pump is disabled")]
    Disabled,
    #[error("pump is already running")]
    Busy,
    #[error("dispense aborted after {dispensed_ml:.1} ml")]
    Aborted { dispensed_ml: f64 },
    #[error("hardware fault: {0}")]
    HardwareFault(#[from] DriverError),
}

/// Calibration input rejected.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("measured volume must be positive")]
    InvalidMeasurement,
    #[error("calibration factor {0:.3} is outside the accepted range (0.5-2.0)")]
    OutOfBounds(f64),
}

/// Fleet-level coordination failure.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no pump is bound to ingredient {0:?}")]
    UnknownIngredient(String),
    #[error("no pump with id {0}")]
    UnknownPump(PumpId),
    #[error("emergency stop is latched")]
    EmergencyStopped,
    #[error("fleet is busy ({0})")]
    FleetBusy(Operation),
    #[error("pumps have not quiesced; emergency reset refused")]
    NotQuiesced,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Dispense(#[from] DispenseError),
    #[error(transparent)]
    Hardware(#[from] DriverError),
}

/// Recipe execution failure.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("missing ingredients: {}", .missing.join(", "))]
    UnsatisfiableRecipe { missing: Vec<String> },
    #[error("dose scalar {0} is outside the accepted range (0.5-3.0)")]
    InvalidDose(f64),
    #[error("pour of {ingredient:?} failed: {source}")]
    DispenseFailed {
        ingredient: String,
        #[source]
        source: FleetError,
    },
    #[error("execution cancelled after {} completed pours", .completed.len())]
    Cancelled { completed: Vec<String> },
    #[error(transparent)]
    Fleet(#[from] FleetError),
}
