//! The pump fleet: every pump in the machine, the emergency-stop latch and
//! the single-owner operation marker.
//!
//! At most one logical operation (a recipe, a cleaning cycle, a calibration)
//! owns the fleet at a time. Ownership is reified as an [`OperationGuard`]:
//! taking the guard marks the fleet busy, dropping it releases the marker on
//! every exit path. The guard carries the cancellation token the operation's
//! timed waits race against; the token is a child of a fleet-wide epoch
//! token, so one `emergency_stop` call aborts whatever is in flight.
//!
//! The fleet — not any single controller — owns the decision to deassert the
//! shared standby rail, which happens only on `shutdown`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driver_tb6612::Tb6612;
use gpio::GpioPort;

use crate::error::FleetError;
use crate::pump::{Pump, PumpState, PumpStatus};
use crate::topology::{HardwareTopology, PumpId};
use crate::DEFAULT_DISPENSE_SPEED;

/// What currently owns the fleet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    Idle,
    Dispensing { label: String },
    Cleaning { mode: String, phase: String },
    Calibrating { pump_id: PumpId },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Idle => write!(f, "idle"),
            Operation::Dispensing { label } => write!(f, "dispensing {label}"),
            Operation::Cleaning { mode, phase } => write!(f, "cleaning {mode}/{phase}"),
            Operation::Calibrating { pump_id } => write!(f, "calibrating pump {pump_id}"),
        }
    }
}

struct FleetCore {
    operation: Operation,
    /// Bumped whenever the marker changes owner, so a stale guard cannot
    /// clear an operation it no longer owns.
    seq: u64,
    /// Parent of every operation token; cancelled (and replaced on reset)
    /// by the emergency path.
    epoch: CancellationToken,
}

/// Read-only view of the fleet for UI and telemetry consumers.
#[derive(Clone, Debug, Serialize)]
pub struct FleetSnapshot {
    pub emergency_stop: bool,
    pub operation: Operation,
    pub available_ingredients: Vec<String>,
    pub pumps: Vec<PumpSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PumpSnapshot {
    pub pump_id: PumpId,
    pub ingredient: String,
    #[serde(flatten)]
    pub state: PumpState,
}

/// Exclusive ownership of the fleet's `current_operation` marker.
///
/// Dropping the guard releases the marker on every exit path.
pub struct OperationGuard {
    fleet: Arc<Fleet>,
    token: CancellationToken,
    seq: u64,
}

impl OperationGuard {
    /// Token the operation's timed waits must race against.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cooperatively cancels this operation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Replaces the operation marker, e.g. to advance a cleaning phase.
    pub fn update(&self, operation: Operation) {
        let mut core = self.fleet.core.lock();
        if core.seq == self.seq {
            core.operation = operation;
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut core = self.fleet.core.lock();
        if core.seq == self.seq {
            core.operation = Operation::Idle;
        }
    }
}

/// The fleet of pumps built over one GPIO port.
pub struct Fleet {
    port: Arc<dyn GpioPort>,
    controllers: Vec<Arc<Mutex<Tb6612>>>,
    pumps: BTreeMap<PumpId, Arc<Pump>>,
    /// Lowercased ingredient name to pump id.
    by_ingredient: HashMap<String, PumpId>,
    core: Mutex<FleetCore>,
    emergency: AtomicBool,
}

impl Fleet {
    /// Validates `topology`, initializes every controller and builds the
    /// pumps. Construction fails fast on a broken topology or a pin that
    /// cannot be configured.
    pub fn new(
        topology: &HardwareTopology,
        port: Arc<dyn GpioPort>,
    ) -> Result<Arc<Self>, FleetError> {
        topology.validate()?;

        let mut controllers = Vec::with_capacity(topology.controllers.len());
        for pinout in &topology.controllers {
            let mut controller = Tb6612::new(Arc::clone(&port), (*pinout).into());
            controller.init()?;
            controllers.push(Arc::new(Mutex::new(controller)));
        }

        let mut pumps = BTreeMap::new();
        let mut by_ingredient = HashMap::new();
        for binding in &topology.pumps {
            let controller = Arc::clone(&controllers[binding.controller_index]);
            by_ingredient.insert(binding.ingredient.to_lowercase(), binding.pump_id);
            pumps.insert(binding.pump_id, Arc::new(Pump::new(binding, controller)));
        }

        info!(
            controllers = controllers.len(),
            pumps = pumps.len(),
            "fleet ready"
        );
        Ok(Arc::new(Self {
            port,
            controllers,
            pumps,
            by_ingredient,
            core: Mutex::new(FleetCore {
                operation: Operation::Idle,
                seq: 0,
                epoch: CancellationToken::new(),
            }),
            emergency: AtomicBool::new(false),
        }))
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    fn check_emergency(&self) -> Result<(), FleetError> {
        if self.is_emergency_stopped() {
            Err(FleetError::EmergencyStopped)
        } else {
            Ok(())
        }
    }

    /// The pump with the given id.
    pub fn pump(&self, pump_id: PumpId) -> Result<Arc<Pump>, FleetError> {
        self.pumps
            .get(&pump_id)
            .cloned()
            .ok_or(FleetError::UnknownPump(pump_id))
    }

    /// All pumps, in id order.
    pub fn pumps(&self) -> impl Iterator<Item = &Arc<Pump>> {
        self.pumps.values()
    }

    pub fn pump_ids(&self) -> Vec<PumpId> {
        self.pumps.keys().copied().collect()
    }

    /// Resolves an ingredient name to its pump: exact (case-insensitive)
    /// first, then substring fallback in either direction.
    pub fn resolve_ingredient(&self, name: &str) -> Result<Arc<Pump>, FleetError> {
        let key = name.trim().to_lowercase();
        if let Some(pump_id) = self.by_ingredient.get(&key) {
            return self.pump(*pump_id);
        }
        for (ingredient, pump_id) in &self.by_ingredient {
            if ingredient.contains(&key) || key.contains(ingredient.as_str()) {
                return self.pump(*pump_id);
            }
        }
        Err(FleetError::UnknownIngredient(name.to_owned()))
    }

    /// Claims the fleet for `operation`.
    pub fn begin_operation(
        self: &Arc<Self>,
        operation: Operation,
    ) -> Result<OperationGuard, FleetError> {
        self.check_emergency()?;
        let mut core = self.core.lock();
        if core.operation != Operation::Idle {
            return Err(FleetError::FleetBusy(core.operation.clone()));
        }
        info!(%operation, "operation started");
        core.operation = operation;
        core.seq += 1;
        let token = core.epoch.child_token();
        Ok(OperationGuard {
            fleet: Arc::clone(self),
            token,
            seq: core.seq,
        })
    }

    /// One-shot pour: claims the fleet for the duration of a single
    /// dispense.
    pub async fn dispense_by_ingredient(
        self: &Arc<Self>,
        name: &str,
        volume_ml: f64,
    ) -> Result<(), FleetError> {
        let guard = self.begin_operation(Operation::Dispensing {
            label: name.to_owned(),
        })?;
        self.dispense_with(&guard, name, volume_ml, DEFAULT_DISPENSE_SPEED)
            .await
    }

    /// Dispenses under an operation guard the caller already holds, so a
    /// recipe can drive several pumps sequentially without releasing the
    /// fleet in between.
    pub async fn dispense_with(
        &self,
        guard: &OperationGuard,
        name: &str,
        volume_ml: f64,
        speed_percent: u8,
    ) -> Result<(), FleetError> {
        self.check_emergency()?;
        let pump = self.resolve_ingredient(name)?;
        pump.dispense(volume_ml, speed_percent, guard.token())
            .await
            .map_err(FleetError::from)
    }

    /// Volumetric dispense addressed by pump id (cleaning solution pump).
    pub async fn dispense_pump(
        &self,
        guard: &OperationGuard,
        pump_id: PumpId,
        volume_ml: f64,
        speed_percent: u8,
    ) -> Result<(), FleetError> {
        self.check_emergency()?;
        let pump = self.pump(pump_id)?;
        pump.dispense(volume_ml, speed_percent, guard.token())
            .await
            .map_err(FleetError::from)
    }

    /// Timed run addressed by pump id (cleaning circulation pulses).
    pub async fn pulse_pump(
        &self,
        guard: &OperationGuard,
        pump_id: PumpId,
        duration: Duration,
        speed_percent: u8,
    ) -> Result<(), FleetError> {
        self.check_emergency()?;
        let pump = self.pump(pump_id)?;
        pump.run_timed(duration, speed_percent, guard.token())
            .await
            .map_err(FleetError::from)
    }

    /// Latches the emergency flag, aborts the in-flight operation and
    /// synchronously stops every pump channel. Returns only after all pumps
    /// have been commanded stopped; any in-flight dispense observes the
    /// cancellation at its next suspension point and reports `Aborted`.
    pub fn emergency_stop(&self) {
        warn!("EMERGENCY STOP");
        self.emergency.store(true, Ordering::SeqCst);
        let epoch = self.core.lock().epoch.clone();
        epoch.cancel();
        for pump in self.pumps.values() {
            pump.halt();
        }
        let mut core = self.core.lock();
        core.operation = Operation::Idle;
        // Invalidate the aborted operation's guard so its eventual drop
        // cannot clear a later owner's marker.
        core.seq += 1;
    }

    /// Clears the emergency latch. Refused unless every pump has quiesced.
    pub fn reset_emergency(&self) -> Result<(), FleetError> {
        for pump in self.pumps.values() {
            match pump.state().status {
                PumpStatus::Idle | PumpStatus::Disabled => {}
                _ => return Err(FleetError::NotQuiesced),
            }
        }
        let mut core = self.core.lock();
        core.epoch = CancellationToken::new();
        self.emergency.store(false, Ordering::SeqCst);
        info!("emergency stop cleared");
        Ok(())
    }

    /// Re-initializes controllers after a hardware fault and clears latched
    /// `Error` pump states. Operator action; does not touch the emergency
    /// latch.
    pub fn reinitialize(&self) -> Result<(), FleetError> {
        for controller in &self.controllers {
            let mut controller = controller.lock();
            if controller.is_initialized() {
                controller.stop_all()?;
            } else {
                controller.init()?;
            }
        }
        for pump in self.pumps.values() {
            pump.clear_error();
        }
        info!("fleet re-initialized");
        Ok(())
    }

    /// Stops every pump channel without latching the emergency flag.
    pub fn stop_all_pumps(&self) {
        for pump in self.pumps.values() {
            pump.halt();
        }
    }

    /// Stops everything, closes the PWM channels, drives standby low and
    /// releases the port. Idempotent.
    pub fn shutdown(&self) -> Result<(), FleetError> {
        for controller in &self.controllers {
            controller.lock().shutdown()?;
        }
        self.port.release_all();
        info!("fleet shut down");
        Ok(())
    }

    /// Calibrates one pump from an operator measurement, persisting nothing;
    /// the caller owns the calibration overlay.
    pub fn calibrate_pump(
        self: &Arc<Self>,
        pump_id: PumpId,
        expected_ml: f64,
        measured_ml: f64,
    ) -> Result<f64, FleetError> {
        let _guard = self.begin_operation(Operation::Calibrating { pump_id })?;
        let pump = self.pump(pump_id)?;
        Ok(pump.calibrate(expected_ml, measured_ml)?)
    }

    /// Consistent read-only view of the whole fleet.
    pub fn snapshot(&self) -> FleetSnapshot {
        let operation = self.core.lock().operation.clone();
        let mut available: Vec<String> = self
            .pumps
            .values()
            .filter(|p| p.is_enabled())
            .map(|p| p.ingredient().to_owned())
            .collect();
        available.sort();
        FleetSnapshot {
            emergency_stop: self.is_emergency_stopped(),
            operation,
            available_ingredients: available,
            pumps: self
                .pumps
                .values()
                .map(|p| PumpSnapshot {
                    pump_id: p.id(),
                    ingredient: p.ingredient().to_owned(),
                    state: p.state(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ControllerPinout, PumpBinding};
    use driver_tb6612::Channel;
    use gpio::SimulatedPort;

    fn two_pump_topology() -> HardwareTopology {
        HardwareTopology {
            controllers: vec![ControllerPinout {
                ain1: 2,
                ain2: 3,
                bin1: 4,
                bin2: 17,
                pwma: 12,
                pwmb: 13,
                stby: 26,
            }],
            pumps: vec![
                PumpBinding {
                    pump_id: 1,
                    controller_index: 0,
                    channel: Channel::A,
                    ingredient: "Gin".into(),
                    flow_rate_ml_s: 2.5,
                    calibration_factor: 1.0,
                    capacity_ml: 750.0,
                    enabled: true,
                },
                PumpBinding {
                    pump_id: 2,
                    controller_index: 0,
                    channel: Channel::B,
                    ingredient: "Fresh lemon juice".into(),
                    flow_rate_ml_s: 3.0,
                    calibration_factor: 1.0,
                    capacity_ml: 1000.0,
                    enabled: true,
                },
            ],
        }
    }

    fn fleet() -> Arc<Fleet> {
        Fleet::new(&two_pump_topology(), Arc::new(SimulatedPort::new())).unwrap()
    }

    #[test]
    fn ingredient_lookup_is_case_insensitive_with_substring_fallback() {
        let fleet = fleet();
        assert_eq!(fleet.resolve_ingredient("GIN").unwrap().id(), 1);
        assert_eq!(fleet.resolve_ingredient("lemon").unwrap().id(), 2);
        assert!(matches!(
            fleet.resolve_ingredient("absinthe"),
            Err(FleetError::UnknownIngredient(_))
        ));
    }

    #[test]
    fn a_second_operation_is_refused() {
        let fleet = fleet();
        let _guard = fleet
            .begin_operation(Operation::Dispensing {
                label: "test".into(),
            })
            .unwrap();
        assert!(matches!(
            fleet.begin_operation(Operation::Cleaning {
                mode: "quick".into(),
                phase: "rinse".into(),
            }),
            Err(FleetError::FleetBusy(_))
        ));
    }

    #[test]
    fn dropping_the_guard_releases_the_marker() {
        let fleet = fleet();
        {
            let _guard = fleet
                .begin_operation(Operation::Calibrating { pump_id: 1 })
                .unwrap();
            assert_ne!(fleet.snapshot().operation, Operation::Idle);
        }
        assert_eq!(fleet.snapshot().operation, Operation::Idle);
    }

    #[test]
    fn emergency_latch_blocks_new_operations_until_reset() {
        let fleet = fleet();
        fleet.emergency_stop();
        assert!(matches!(
            fleet.begin_operation(Operation::Dispensing {
                label: "test".into(),
            }),
            Err(FleetError::EmergencyStopped)
        ));
        fleet.reset_emergency().unwrap();
        let _guard = fleet
            .begin_operation(Operation::Dispensing {
                label: "test".into(),
            })
            .unwrap();
    }

    #[test]
    fn snapshot_lists_available_ingredients() {
        let fleet = fleet();
        let snapshot = fleet.snapshot();
        assert_eq!(
            snapshot.available_ingredients,
            vec!["Fresh lemon juice".to_owned(), "Gin".to_owned()]
        );
        assert!(!snapshot.emergency_stop);
        assert_eq!(snapshot.pumps.len(), 2);
    }
}
