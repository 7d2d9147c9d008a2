//! In-memory GPIO backend.
//!
//! Keeps the last written level per pin and the current duty cycle per PWM
//! channel, and appends every operation to a journal. Durations elapse on the
//! system clock, not on physical pulses, so the whole stack runs unmodified
//! on a development machine. Tests use the journal to assert the *order* of
//! electrical transitions, not just the final state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{pin_in_range, GpioError, GpioPort, Level, Pin, PwmChannel, PwmHandle};

/// One entry in the simulated port's operation journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortOp {
    Configure(Pin),
    Write(Pin, Level),
    PwmOpen(Pin, u32),
    PwmStart(Pin, u8),
    PwmDuty(Pin, u8),
    PwmStop(Pin),
    PwmClose(Pin),
    ReleaseAll,
}

#[derive(Clone, Copy, Debug)]
struct PwmState {
    frequency_hz: u32,
    duty_percent: u8,
    running: bool,
    open: bool,
}

#[derive(Default)]
struct SimState {
    outputs: HashMap<Pin, Level>,
    pwm: HashMap<Pin, PwmState>,
    journal: Vec<PortOp>,
    failing: HashSet<Pin>,
}

impl SimState {
    fn check_healthy(&self, pin: Pin) -> Result<(), GpioError> {
        if self.failing.contains(&pin) {
            Err(GpioError::Backend {
                pin,
                message: "injected failure".into(),
            })
        } else {
            Ok(())
        }
    }
}

/// The simulated [`GpioPort`].
#[derive(Default)]
pub struct SimulatedPort {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written level of `pin`, if it is configured.
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.state.lock().outputs.get(&pin).copied()
    }

    /// Current duty cycle on `pin`'s PWM channel, if one is open.
    pub fn duty(&self, pin: Pin) -> Option<u8> {
        let state = self.state.lock();
        state
            .pwm
            .get(&pin)
            .filter(|p| p.open)
            .map(|p| if p.running { p.duty_percent } else { 0 })
    }

    /// Whether the PWM carrier on `pin` is running.
    pub fn pwm_running(&self, pin: Pin) -> bool {
        self.state
            .lock()
            .pwm
            .get(&pin)
            .map(|p| p.open && p.running)
            .unwrap_or(false)
    }

    /// Snapshot of the operation journal.
    pub fn journal(&self) -> Vec<PortOp> {
        self.state.lock().journal.clone()
    }

    /// Drains the operation journal, returning what was recorded so far.
    pub fn take_journal(&self) -> Vec<PortOp> {
        std::mem::take(&mut self.state.lock().journal)
    }

    /// Makes every subsequent operation on `pin` fail, to exercise
    /// hardware-fault paths.
    pub fn fail_pin(&self, pin: Pin) {
        self.state.lock().failing.insert(pin);
    }

    /// Clears an injected failure on `pin`.
    pub fn heal_pin(&self, pin: Pin) {
        self.state.lock().failing.remove(&pin);
    }
}

impl GpioPort for SimulatedPort {
    fn configure_output(&self, pin: Pin) -> Result<(), GpioError> {
        if !pin_in_range(pin) {
            return Err(GpioError::InvalidPin(pin));
        }
        let mut state = self.state.lock();
        state.check_healthy(pin)?;
        state.outputs.insert(pin, Level::Low);
        state.journal.push(PortOp::Configure(pin));
        trace!(pin, "sim: configured output");
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        state.check_healthy(pin)?;
        if !state.outputs.contains_key(&pin) {
            return Err(GpioError::Unconfigured(pin));
        }
        state.outputs.insert(pin, level);
        state.journal.push(PortOp::Write(pin, level));
        trace!(pin, ?level, "sim: write");
        Ok(())
    }

    fn open_pwm(&self, pin: Pin, frequency_hz: u32) -> Result<PwmHandle, GpioError> {
        if !pin_in_range(pin) {
            return Err(GpioError::InvalidPin(pin));
        }
        let mut state = self.state.lock();
        state.check_healthy(pin)?;
        if let Some(existing) = state.pwm.get(&pin) {
            // Shared rail: a second open on the same pin joins the existing
            // channel instead of failing.
            if existing.open && existing.frequency_hz != frequency_hz {
                return Err(GpioError::FrequencyMismatch {
                    pin,
                    open_hz: existing.frequency_hz,
                    requested_hz: frequency_hz,
                });
            }
        }
        state
            .pwm
            .entry(pin)
            .and_modify(|p| {
                if !p.open {
                    // Fresh open on a released channel.
                    p.frequency_hz = frequency_hz;
                    p.duty_percent = 0;
                    p.running = false;
                }
                p.open = true;
            })
            .or_insert(PwmState {
                frequency_hz,
                duty_percent: 0,
                running: false,
                open: true,
            });
        state.journal.push(PortOp::PwmOpen(pin, frequency_hz));
        trace!(pin, frequency_hz, "sim: PWM open");
        Ok(PwmHandle::new(
            pin,
            Arc::new(SimPwm {
                pin,
                state: Arc::clone(&self.state),
            }),
        ))
    }

    fn release_all(&self) {
        let mut state = self.state.lock();
        state.outputs.clear();
        for pwm in state.pwm.values_mut() {
            pwm.open = false;
            pwm.running = false;
            pwm.duty_percent = 0;
        }
        state.journal.push(PortOp::ReleaseAll);
        trace!("sim: released all pins");
    }
}

struct SimPwm {
    pin: Pin,
    state: Arc<Mutex<SimState>>,
}

impl SimPwm {
    fn with_open_channel(
        &self,
        op: impl FnOnce(&mut PwmState, &mut Vec<PortOp>),
    ) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        state.check_healthy(self.pin)?;
        let SimState { pwm, journal, .. } = &mut *state;
        match pwm.get_mut(&self.pin) {
            Some(channel) if channel.open => {
                op(channel, journal);
                Ok(())
            }
            _ => Err(GpioError::Backend {
                pin: self.pin,
                message: "PWM channel is closed".into(),
            }),
        }
    }
}

impl PwmChannel for SimPwm {
    fn start(&self, duty_percent: u8) -> Result<(), GpioError> {
        self.with_open_channel(|channel, journal| {
            channel.running = true;
            channel.duty_percent = duty_percent;
            journal.push(PortOp::PwmStart(self.pin, duty_percent));
        })
    }

    fn set_duty(&self, duty_percent: u8) -> Result<(), GpioError> {
        self.with_open_channel(|channel, journal| {
            channel.duty_percent = duty_percent;
            journal.push(PortOp::PwmDuty(self.pin, duty_percent));
        })
    }

    fn stop(&self) -> Result<(), GpioError> {
        self.with_open_channel(|channel, journal| {
            channel.running = false;
            channel.duty_percent = 0;
            journal.push(PortOp::PwmStop(self.pin));
        })
    }

    fn close(&self) -> Result<(), GpioError> {
        self.with_open_channel(|channel, journal| {
            channel.running = false;
            channel.duty_percent = 0;
            channel.open = false;
            journal.push(PortOp::PwmClose(self.pin));
        })
    }
}
