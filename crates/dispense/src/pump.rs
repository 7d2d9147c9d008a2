//! One peristaltic pump: an ingredient identity and a calibrated flow rate
//! bound to one H-bridge channel.
//!
//! Flow through a peristaltic pump is very nearly proportional to rotor
//! speed, so dispense volume is derived from open-loop timed runs: the
//! channel is driven forward for `volume / effective_flow_rate` seconds.
//! The wait is a tokio sleep raced against a cancellation token; neither the
//! pump state lock nor the controller lock is held across it, so emergency
//! stop and snapshots stay responsive while liquid is moving.

use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driver_tb6612::{Channel, Direction, Tb6612};

use crate::error::{CalibrationError, DispenseError};
use crate::topology::{PumpBinding, PumpId};
use crate::MAX_POUR_TIME;

/// Accepted range for a raw calibration factor. A factor outside this range
/// indicates an operator mis-measurement, not a real pump drift.
pub const CALIBRATION_RANGE: RangeInclusive<f64> = 0.5..=2.0;

/// Weight of the previous factor in the exponentially smoothed calibration
/// update. Smoothing keeps a single bad measurement from perturbing
/// subsequent pours.
const CALIBRATION_SMOOTHING: f64 = 0.7;

/// Lifecycle state of a pump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    Idle,
    Pumping,
    Error,
    Disabled,
    Calibrating,
}

/// Runtime state of one pump.
#[derive(Clone, Debug, Serialize)]
pub struct PumpState {
    pub status: PumpStatus,
    pub direction: Direction,
    pub speed_percent: u8,
    /// Total volume dispensed since process start.
    pub volume_dispensed_ml: f64,
    /// Total running time since process start.
    pub total_runtime_s: f64,
    pub calibration_factor: f64,
    #[serde(skip)]
    pub operation_started_at: Option<Instant>,
}

impl PumpState {
    fn new(calibration_factor: f64, enabled: bool) -> Self {
        Self {
            status: if enabled {
                PumpStatus::Idle
            } else {
                PumpStatus::Disabled
            },
            direction: Direction::Stopped,
            speed_percent: 0,
            volume_dispensed_ml: 0.0,
            total_runtime_s: 0.0,
            calibration_factor,
            operation_started_at: None,
        }
    }

    fn settle(&mut self) {
        self.direction = Direction::Stopped;
        self.speed_percent = 0;
        self.operation_started_at = None;
        if self.status == PumpStatus::Pumping {
            self.status = PumpStatus::Idle;
        }
    }
}

enum RunOutcome {
    Completed,
    Cancelled { elapsed: Duration },
}

/// One pump of the fleet.
pub struct Pump {
    id: PumpId,
    ingredient: String,
    flow_rate_ml_s: f64,
    capacity_ml: f64,
    channel: Channel,
    controller: Arc<Mutex<Tb6612>>,
    state: Mutex<PumpState>,
}

impl Pump {
    pub fn new(binding: &PumpBinding, controller: Arc<Mutex<Tb6612>>) -> Self {
        Self {
            id: binding.pump_id,
            ingredient: binding.ingredient.clone(),
            flow_rate_ml_s: binding.flow_rate_ml_s,
            capacity_ml: binding.capacity_ml,
            channel: binding.channel,
            controller,
            state: Mutex::new(PumpState::new(binding.calibration_factor, binding.enabled)),
        }
    }

    pub fn id(&self) -> PumpId {
        self.id
    }

    pub fn ingredient(&self) -> &str {
        &self.ingredient
    }

    pub fn capacity_ml(&self) -> f64 {
        self.capacity_ml
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn state(&self) -> PumpState {
        self.state.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().status != PumpStatus::Disabled
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().status == PumpStatus::Idle
    }

    /// Nominal flow corrected by the current calibration factor, in ml/s.
    pub fn effective_flow_rate(&self) -> f64 {
        self.flow_rate_ml_s * self.state.lock().calibration_factor
    }

    /// Dispenses `volume_ml` by running the channel forward for the computed
    /// duration.
    ///
    /// On cancellation the dispensed volume is credited by the elapsed
    /// fraction of the request and returned inside
    /// [`DispenseError::Aborted`].
    pub async fn dispense(
        &self,
        volume_ml: f64,
        speed_percent: u8,
        cancel: &CancellationToken,
    ) -> Result<(), DispenseError> {
        if !(volume_ml > 0.0) {
            return Err(DispenseError::VolumeNonPositive);
        }
        let duration = {
            let state = self.state.lock();
            let duration_s = volume_ml / (self.flow_rate_ml_s * state.calibration_factor);
            if duration_s > MAX_POUR_TIME.as_secs_f64() {
                return Err(DispenseError::VolumeTooLarge { volume_ml });
            }
            Duration::from_secs_f64(duration_s)
        };
        info!(
            pump = self.id,
            ingredient = %self.ingredient,
            volume_ml,
            duration_s = duration.as_secs_f64(),
            "dispensing"
        );
        match self.run(duration, speed_percent, cancel).await? {
            RunOutcome::Completed => {
                let mut state = self.state.lock();
                state.volume_dispensed_ml += volume_ml;
                state.total_runtime_s += duration.as_secs_f64();
                Ok(())
            }
            RunOutcome::Cancelled { elapsed } => {
                let fraction = (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0);
                let dispensed_ml = volume_ml * fraction;
                let mut state = self.state.lock();
                state.volume_dispensed_ml += dispensed_ml;
                state.total_runtime_s += elapsed.as_secs_f64();
                drop(state);
                warn!(pump = self.id, dispensed_ml, "dispense aborted");
                Err(DispenseError::Aborted { dispensed_ml })
            }
        }
    }

    /// Runs the channel for a fixed duration, regardless of volume. Used by
    /// the cleaning controller for circulation pulses; updates the runtime
    /// counter but not the dispensed-volume counter.
    pub async fn run_timed(
        &self,
        duration: Duration,
        speed_percent: u8,
        cancel: &CancellationToken,
    ) -> Result<(), DispenseError> {
        match self.run(duration, speed_percent, cancel).await? {
            RunOutcome::Completed => {
                self.state.lock().total_runtime_s += duration.as_secs_f64();
                Ok(())
            }
            RunOutcome::Cancelled { elapsed } => {
                self.state.lock().total_runtime_s += elapsed.as_secs_f64();
                Err(DispenseError::Aborted { dispensed_ml: 0.0 })
            }
        }
    }

    /// The common timed run: transition to Pumping, drive the channel, wait
    /// (cancellably), stop the channel, transition back.
    async fn run(
        &self,
        duration: Duration,
        speed_percent: u8,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, DispenseError> {
        if cancel.is_cancelled() {
            return Err(DispenseError::Aborted { dispensed_ml: 0.0 });
        }
        {
            let mut state = self.state.lock();
            match state.status {
                PumpStatus::Idle => {}
                PumpStatus::Disabled => return Err(DispenseError::Disabled),
                _ => return Err(DispenseError::Busy),
            }
            state.status = PumpStatus::Pumping;
            state.direction = Direction::Forward;
            state.operation_started_at = Some(Instant::now());
        }
        let driven = {
            let mut controller = self.controller.lock();
            controller
                .set_channel(self.channel, speed_percent, Direction::Forward)
                .map(|()| controller.channel_state(self.channel).duty_percent)
        };
        match driven {
            Ok(duty) => self.state.lock().speed_percent = duty,
            Err(err) => {
                let mut state = self.state.lock();
                state.settle();
                state.status = PumpStatus::Error;
                return Err(DispenseError::HardwareFault(err));
            }
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => RunOutcome::Cancelled { elapsed: started.elapsed() },
            _ = sleep(duration) => RunOutcome::Completed,
        };

        let stop_result = self.controller.lock().stop_channel(self.channel);
        let mut state = self.state.lock();
        state.settle();
        if let Err(err) = stop_result {
            state.status = PumpStatus::Error;
            return Err(DispenseError::HardwareFault(err));
        }
        Ok(outcome)
    }

    /// Updates the calibration factor from an operator measurement.
    ///
    /// The raw factor `expected / measured` is rejected outside
    /// [`CALIBRATION_RANGE`]; otherwise it is blended into the current
    /// factor with exponential smoothing and the result clamped to the same
    /// range. Returns the new factor.
    pub fn calibrate(&self, expected_ml: f64, measured_ml: f64) -> Result<f64, CalibrationError> {
        if !(measured_ml > 0.0) || !(expected_ml > 0.0) {
            return Err(CalibrationError::InvalidMeasurement);
        }
        let raw = expected_ml / measured_ml;
        if !CALIBRATION_RANGE.contains(&raw) {
            return Err(CalibrationError::OutOfBounds(raw));
        }
        let mut state = self.state.lock();
        let previous = state.status;
        if previous == PumpStatus::Idle {
            state.status = PumpStatus::Calibrating;
        }
        let old = state.calibration_factor;
        let blended = old * CALIBRATION_SMOOTHING + raw * (1.0 - CALIBRATION_SMOOTHING);
        state.calibration_factor =
            blended.clamp(*CALIBRATION_RANGE.start(), *CALIBRATION_RANGE.end());
        let factor = state.calibration_factor;
        state.status = previous;
        info!(pump = self.id, old, new = factor, "calibration updated");
        Ok(factor)
    }

    /// Best-effort synchronous stop: forces the channel off and settles the
    /// state. Never leaves the pump in `Pumping`.
    pub fn halt(&self) {
        if let Err(err) = self.controller.lock().stop_channel(self.channel) {
            warn!(pump = self.id, %err, "halt: channel stop failed");
        }
        self.state.lock().settle();
    }

    /// Clears a latched `Error` status after the operator has re-initialized
    /// the hardware.
    pub fn clear_error(&self) {
        let mut state = self.state.lock();
        if state.status == PumpStatus::Error {
            state.status = PumpStatus::Idle;
        }
    }
}
