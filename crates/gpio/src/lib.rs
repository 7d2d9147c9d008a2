//! # GPIO Port Abstraction
//!
//! The rest of the control stack talks to the outside world through the
//! [`GpioPort`] trait: digital outputs, PWM channels and a release hook for
//! shutdown. Two backends implement it:
//!
//! * [`SimulatedPort`] — pure bookkeeping, usable on any development machine
//!   and as the oracle in tests (it records every operation in a journal).
//! * `RppalPort` — the real Raspberry Pi binding, behind the `rppal` feature.
//!
//! The port is chosen when the pump fleet is constructed; nothing in the
//! stack selects a backend through globals or conditional imports.
//!
//! A port is a process-wide shared resource. Implementations serialize all
//! operations internally, so a port can be shared between controllers as an
//! `Arc<dyn GpioPort>`. PWM and standby rails are shared across controllers
//! on the real board; opening a PWM channel on an already-open pin must
//! therefore return a handle onto the *same* underlying channel rather than
//! fail.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub mod sim;

#[cfg(feature = "rppal")]
pub mod rpi;

pub use sim::SimulatedPort;

#[cfg(feature = "rppal")]
pub use rpi::RppalPort;

/// A BCM-style pin number.
///
/// On-board pins occupy `0..=27`; numbers of 100 and above address an
/// optional port expander.
pub type Pin = u16;

/// Highest on-board BCM pin number.
pub const MAX_ONBOARD_PIN: Pin = 27;

/// First pin number of the expander range.
pub const EXPANDER_BASE: Pin = 100;

/// PWM carrier frequency used for all pump channels.
pub const PWM_FREQUENCY_HZ: u32 = 1_000;

/// Whether `pin` falls in the addressable range (on-board or expander).
pub fn pin_in_range(pin: Pin) -> bool {
    pin <= MAX_ONBOARD_PIN || pin >= EXPANDER_BASE
}

/// Logic level of a digital output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Errors reported by a GPIO port.
#[derive(Debug, Error)]
pub enum GpioError {
    /// The pin number is outside the addressable range.
    #[error("pin {0} is outside the addressable range (0-27 or 100+)")]
    InvalidPin(Pin),
    /// The pin was used before `configure_output`.
    #[error("pin {0} has not been configured as an output")]
    Unconfigured(Pin),
    /// A PWM channel was reopened with a different carrier frequency.
    #[error("pin {pin} PWM already open at {open_hz} Hz, requested {requested_hz} Hz")]
    FrequencyMismatch {
        pin: Pin,
        open_hz: u32,
        requested_hz: u32,
    },
    /// The underlying GPIO facility reported a failure.
    #[error("pin {pin}: {message}")]
    Backend { pin: Pin, message: String },
    /// The GPIO facility itself could not be opened.
    #[error("gpio facility unavailable: {0}")]
    Unavailable(String),
}

/// One PWM channel as seen by a backend.
///
/// Duty cycles are integer percent in `[0, 100]`.
pub trait PwmChannel: Send + Sync {
    fn start(&self, duty_percent: u8) -> Result<(), GpioError>;
    fn set_duty(&self, duty_percent: u8) -> Result<(), GpioError>;
    fn stop(&self) -> Result<(), GpioError>;
    fn close(&self) -> Result<(), GpioError>;
}

/// A clonable handle onto a PWM channel.
///
/// Clones (and handles from repeated `open_pwm` calls on the same pin) share
/// one underlying channel, which is how the shared PWM rails on the board are
/// modeled: the last write wins for every consumer of the rail.
#[derive(Clone)]
pub struct PwmHandle {
    pin: Pin,
    channel: Arc<dyn PwmChannel>,
}

impl PwmHandle {
    pub fn new(pin: Pin, channel: Arc<dyn PwmChannel>) -> Self {
        Self { pin, channel }
    }

    /// The pin this handle drives.
    pub fn pin(&self) -> Pin {
        self.pin
    }

    /// Starts the carrier at the given duty cycle.
    pub fn start(&self, duty_percent: u8) -> Result<(), GpioError> {
        self.channel.start(duty_percent)
    }

    /// Changes the duty cycle of a running carrier.
    pub fn set_duty(&self, duty_percent: u8) -> Result<(), GpioError> {
        self.channel.set_duty(duty_percent)
    }

    /// Stops the carrier, leaving the line low.
    pub fn stop(&self) -> Result<(), GpioError> {
        self.channel.stop()
    }

    /// Stops the carrier and releases the channel.
    pub fn close(&self) -> Result<(), GpioError> {
        self.channel.close()
    }
}

impl fmt::Debug for PwmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PwmHandle").field("pin", &self.pin).finish()
    }
}

/// The capability set the control stack requires from a GPIO facility.
pub trait GpioPort: Send + Sync {
    /// Claims `pin` as a digital output, driven low initially.
    fn configure_output(&self, pin: Pin) -> Result<(), GpioError>;

    /// Drives a configured output pin to `level`.
    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError>;

    /// Opens (or re-opens) a PWM channel on `pin`.
    fn open_pwm(&self, pin: Pin, frequency_hz: u32) -> Result<PwmHandle, GpioError>;

    /// Releases every claimed pin and channel. Called on shutdown; idempotent.
    fn release_all(&self);
}
