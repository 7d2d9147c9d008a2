//! Raspberry Pi GPIO backend, built on `rppal`.
//!
//! Uses software PWM (`OutputPin::set_pwm_frequency`) so any on-board pin can
//! carry a duty-cycle signal at the 1 kHz the motor drivers expect. Only the
//! on-board BCM range (0–27) is wired; the optional expander range is
//! accepted by the topology validator but rejected here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rppal::gpio::{Gpio, OutputPin};
use tracing::debug;

use crate::{
    pin_in_range, GpioError, GpioPort, Level, Pin, PwmChannel, PwmHandle, MAX_ONBOARD_PIN,
};

fn backend_error(pin: Pin, err: rppal::gpio::Error) -> GpioError {
    GpioError::Backend {
        pin,
        message: err.to_string(),
    }
}

#[derive(Clone, Copy)]
struct RailState {
    frequency_hz: u32,
    open: bool,
}

#[derive(Default)]
struct RpiState {
    outputs: HashMap<Pin, OutputPin>,
    rails: HashMap<Pin, RailState>,
}

/// The real [`GpioPort`] for Raspberry Pi hosts.
pub struct RppalPort {
    gpio: Gpio,
    state: Arc<Mutex<RpiState>>,
}

impl RppalPort {
    /// Opens the host GPIO facility.
    pub fn new() -> Result<Self, GpioError> {
        let gpio = Gpio::new().map_err(|e| GpioError::Unavailable(e.to_string()))?;
        Ok(Self {
            gpio,
            state: Arc::new(Mutex::new(RpiState::default())),
        })
    }

    fn claim(&self, state: &mut RpiState, pin: Pin) -> Result<(), GpioError> {
        if !pin_in_range(pin) {
            return Err(GpioError::InvalidPin(pin));
        }
        if pin > MAX_ONBOARD_PIN {
            return Err(GpioError::Backend {
                pin,
                message: "expander range is not wired on this backend".into(),
            });
        }
        if state.outputs.contains_key(&pin) {
            return Ok(());
        }
        let output = self
            .gpio
            .get(pin as u8)
            .map_err(|e| backend_error(pin, e))?
            .into_output_low();
        state.outputs.insert(pin, output);
        Ok(())
    }
}

impl GpioPort for RppalPort {
    fn configure_output(&self, pin: Pin) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        self.claim(&mut state, pin)?;
        debug!(pin, "rppal: configured output");
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        let output = state
            .outputs
            .get_mut(&pin)
            .ok_or(GpioError::Unconfigured(pin))?;
        match level {
            Level::Low => output.set_low(),
            Level::High => output.set_high(),
        }
        Ok(())
    }

    fn open_pwm(&self, pin: Pin, frequency_hz: u32) -> Result<PwmHandle, GpioError> {
        let mut state = self.state.lock();
        self.claim(&mut state, pin)?;
        if let Some(rail) = state.rails.get(&pin) {
            if rail.open && rail.frequency_hz != frequency_hz {
                return Err(GpioError::FrequencyMismatch {
                    pin,
                    open_hz: rail.frequency_hz,
                    requested_hz: frequency_hz,
                });
            }
        }
        state.rails.insert(
            pin,
            RailState {
                frequency_hz,
                open: true,
            },
        );
        debug!(pin, frequency_hz, "rppal: PWM open");
        Ok(PwmHandle::new(
            pin,
            Arc::new(RpiPwm {
                pin,
                frequency_hz,
                state: Arc::clone(&self.state),
            }),
        ))
    }

    fn release_all(&self) {
        let mut state = self.state.lock();
        for output in state.outputs.values_mut() {
            let _ = output.clear_pwm();
            output.set_low();
        }
        // Dropping the rppal pins returns them to inputs.
        state.outputs.clear();
        state.rails.clear();
        debug!("rppal: released all pins");
    }
}

struct RpiPwm {
    pin: Pin,
    frequency_hz: u32,
    state: Arc<Mutex<RpiState>>,
}

impl RpiPwm {
    fn apply(&self, duty_percent: u8) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        if !state.rails.get(&self.pin).map(|r| r.open).unwrap_or(false) {
            return Err(GpioError::Backend {
                pin: self.pin,
                message: "PWM channel is closed".into(),
            });
        }
        let output = state
            .outputs
            .get_mut(&self.pin)
            .ok_or(GpioError::Unconfigured(self.pin))?;
        output
            .set_pwm_frequency(
                self.frequency_hz as f64,
                f64::from(duty_percent.min(100)) / 100.0,
            )
            .map_err(|e| backend_error(self.pin, e))
    }

    fn silence(&self, close: bool) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        if let Some(output) = state.outputs.get_mut(&self.pin) {
            output.clear_pwm().map_err(|e| backend_error(self.pin, e))?;
            output.set_low();
        }
        if close {
            if let Some(rail) = state.rails.get_mut(&self.pin) {
                rail.open = false;
            }
        }
        Ok(())
    }
}

impl PwmChannel for RpiPwm {
    fn start(&self, duty_percent: u8) -> Result<(), GpioError> {
        self.apply(duty_percent)
    }

    fn set_duty(&self, duty_percent: u8) -> Result<(), GpioError> {
        self.apply(duty_percent)
    }

    fn stop(&self) -> Result<(), GpioError> {
        self.silence(false)
    }

    fn close(&self) -> Result<(), GpioError> {
        self.silence(true)
    }
}
