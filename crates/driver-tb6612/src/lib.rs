//! # TB6612FNG Dual H-Bridge Driver
//!
//! One TB6612FNG drives two DC motor channels. Each channel has two direction
//! inputs and a PWM input; a single active-low standby input gates the whole
//! chip. The direction inputs encode:
//!
//! | IN1 | IN2 | Result  |
//! |-----|-----|---------|
//! | L   | L   | coast   |
//! | H   | L   | forward |
//! | L   | H   | reverse |
//! | H   | H   | brake   |
//!
//! The driver owns the electrical sequencing the chip mandates:
//!
//! * leaving standby requires a settle delay before the outputs are reliable;
//! * non-zero duty cycles below [`MIN_DUTY_PERCENT`] stall the pump motors
//!   and are raised to the floor;
//! * when stopping, duty is driven to zero *before* the direction pins are
//!   cleared, so the bridge never sees a powered direction transient.
//!
//! On the real board the PWM and standby rails are shared between several
//! controllers. The driver therefore never deasserts standby on its own
//! account during operation; the fleet decides when the rail may go down
//! (`shutdown`).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use gpio::{GpioError, GpioPort, Level, Pin, PwmHandle, PWM_FREQUENCY_HZ};

/// Duty-cycle floor below which the pump motors stall.
pub const MIN_DUTY_PERCENT: u8 = 30;

/// Settle time after the chip leaves standby.
pub const STARTUP_DELAY: Duration = Duration::from_millis(100);

/// One of the two motor channels on a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::A => "A",
            Channel::B => "B",
        }
    }
}

/// Rotation direction of a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    Forward,
    Reverse,
    #[default]
    Stopped,
}

/// The seven control pins of one controller.
///
/// `pwma`, `pwmb` and `stby` may be shared with other controllers on the same
/// rail; the four direction pins are exclusive to this chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tb6612Pinout {
    pub ain1: Pin,
    pub ain2: Pin,
    pub bin1: Pin,
    pub bin2: Pin,
    pub pwma: Pin,
    pub pwmb: Pin,
    pub stby: Pin,
}

impl Tb6612Pinout {
    /// The four direction pins, which must be globally unique.
    pub fn direction_pins(&self) -> [Pin; 4] {
        [self.ain1, self.ain2, self.bin1, self.bin2]
    }

    /// All seven pins of the controller.
    pub fn all_pins(&self) -> [Pin; 7] {
        [
            self.ain1, self.ain2, self.bin1, self.bin2, self.pwma, self.pwmb, self.stby,
        ]
    }

    fn direction_pair(&self, channel: Channel) -> (Pin, Pin) {
        match channel {
            Channel::A => (self.ain1, self.ain2),
            Channel::B => (self.bin1, self.bin2),
        }
    }
}

/// Electrical state of one channel, as last commanded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub direction: Direction,
    pub duty_percent: u8,
}

impl ChannelState {
    /// Whether the channel is actively driving its motor.
    pub fn is_driving(&self) -> bool {
        self.direction != Direction::Stopped && self.duty_percent > 0
    }
}

/// Errors reported by the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A pin could not be configured during `init`.
    #[error("pin {pin} failed to initialize: {source}")]
    InitFailed {
        pin: Pin,
        #[source]
        source: GpioError,
    },
    /// An operation was attempted before `init` (or after `shutdown`).
    #[error("controller is not initialized")]
    NotInitialized,
    /// A GPIO primitive failed mid-operation.
    #[error(transparent)]
    Gpio(#[from] GpioError),
}

/// One TB6612FNG controller.
///
/// Not internally synchronized; callers wrap it in a mutex and hold the lock
/// across each command.
pub struct Tb6612 {
    port: Arc<dyn GpioPort>,
    pinout: Tb6612Pinout,
    pwm_a: Option<PwmHandle>,
    pwm_b: Option<PwmHandle>,
    in_standby: bool,
    initialized: bool,
    channel_a: ChannelState,
    channel_b: ChannelState,
}

impl Tb6612 {
    pub fn new(port: Arc<dyn GpioPort>, pinout: Tb6612Pinout) -> Self {
        Self {
            port,
            pinout,
            pwm_a: None,
            pwm_b: None,
            in_standby: true,
            initialized: false,
            channel_a: ChannelState::default(),
            channel_b: ChannelState::default(),
        }
    }

    pub fn pinout(&self) -> Tb6612Pinout {
        self.pinout
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the chip is currently held in standby.
    pub fn in_standby(&self) -> bool {
        self.in_standby
    }

    /// Last commanded state of `channel`.
    pub fn channel_state(&self, channel: Channel) -> ChannelState {
        match channel {
            Channel::A => self.channel_a,
            Channel::B => self.channel_b,
        }
    }

    fn channel_state_mut(&mut self, channel: Channel) -> &mut ChannelState {
        match channel {
            Channel::A => &mut self.channel_a,
            Channel::B => &mut self.channel_b,
        }
    }

    /// Configures the seven pins, drives the direction pins low, starts both
    /// PWM carriers at duty 0 and takes the chip out of standby.
    ///
    /// Idempotent: a second call on an initialized controller is a no-op.
    pub fn init(&mut self) -> Result<(), DriverError> {
        if self.initialized {
            return Ok(());
        }
        for pin in self.pinout.all_pins() {
            self.port
                .configure_output(pin)
                .map_err(|source| DriverError::InitFailed { pin, source })?;
        }
        for pin in self.pinout.direction_pins() {
            self.port
                .write(pin, Level::Low)
                .map_err(|source| DriverError::InitFailed { pin, source })?;
        }
        let pwm_a = self
            .port
            .open_pwm(self.pinout.pwma, PWM_FREQUENCY_HZ)
            .map_err(|source| DriverError::InitFailed {
                pin: self.pinout.pwma,
                source,
            })?;
        let pwm_b = self
            .port
            .open_pwm(self.pinout.pwmb, PWM_FREQUENCY_HZ)
            .map_err(|source| DriverError::InitFailed {
                pin: self.pinout.pwmb,
                source,
            })?;
        pwm_a.start(0).map_err(|source| DriverError::InitFailed {
            pin: self.pinout.pwma,
            source,
        })?;
        pwm_b.start(0).map_err(|source| DriverError::InitFailed {
            pin: self.pinout.pwmb,
            source,
        })?;
        self.pwm_a = Some(pwm_a);
        self.pwm_b = Some(pwm_b);
        self.channel_a = ChannelState::default();
        self.channel_b = ChannelState::default();
        self.port
            .write(self.pinout.stby, Level::High)
            .map_err(|source| DriverError::InitFailed {
                pin: self.pinout.stby,
                source,
            })?;
        self.in_standby = false;
        thread::sleep(STARTUP_DELAY);
        self.initialized = true;
        debug!(stby = self.pinout.stby, "TB6612 initialized");
        Ok(())
    }

    /// Takes the chip out of standby and waits for the outputs to settle.
    fn wake(&mut self) -> Result<(), DriverError> {
        self.port.write(self.pinout.stby, Level::High)?;
        self.in_standby = false;
        thread::sleep(STARTUP_DELAY);
        Ok(())
    }

    /// Stops both channels and puts the chip in standby.
    ///
    /// Only call when no sibling controller is driving the shared standby
    /// rail; the fleet owns that decision.
    pub fn standby(&mut self) -> Result<(), DriverError> {
        self.stop_all()?;
        self.port.write(self.pinout.stby, Level::Low)?;
        self.in_standby = true;
        Ok(())
    }

    fn pwm(&self, channel: Channel) -> Result<&PwmHandle, DriverError> {
        let handle = match channel {
            Channel::A => self.pwm_a.as_ref(),
            Channel::B => self.pwm_b.as_ref(),
        };
        handle.ok_or(DriverError::NotInitialized)
    }

    /// Commands one channel.
    ///
    /// Non-zero speeds below [`MIN_DUTY_PERCENT`] are raised to the floor; a
    /// speed of zero is treated as [`Direction::Stopped`]. If the chip is in
    /// standby it is woken first, which blocks for [`STARTUP_DELAY`].
    pub fn set_channel(
        &mut self,
        channel: Channel,
        speed_percent: u8,
        direction: Direction,
    ) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        let direction = if speed_percent == 0 {
            Direction::Stopped
        } else {
            direction
        };
        if direction == Direction::Stopped {
            return self.stop_channel(channel);
        }
        if self.in_standby {
            self.wake()?;
        }
        let duty = speed_percent.clamp(MIN_DUTY_PERCENT, 100);
        let (in1, in2) = self.pinout.direction_pair(channel);
        let (lvl1, lvl2) = match direction {
            Direction::Forward => (Level::High, Level::Low),
            Direction::Reverse => (Level::Low, Level::High),
            Direction::Stopped => unreachable!("handled above"),
        };
        self.port.write(in1, lvl1)?;
        self.port.write(in2, lvl2)?;
        self.pwm(channel)?.set_duty(duty)?;
        *self.channel_state_mut(channel) = ChannelState {
            direction,
            duty_percent: duty,
        };
        trace!(
            channel = channel.as_str(),
            duty,
            ?direction,
            "channel commanded"
        );
        Ok(())
    }

    /// Stops one channel: duty to zero, then direction pins cleared.
    pub fn stop_channel(&mut self, channel: Channel) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        // Duty must reach zero before the direction pins change, so the
        // bridge never conducts through a transient pin pattern.
        self.pwm(channel)?.set_duty(0)?;
        let (in1, in2) = self.pinout.direction_pair(channel);
        self.port.write(in1, Level::Low)?;
        self.port.write(in2, Level::Low)?;
        *self.channel_state_mut(channel) = ChannelState::default();
        trace!(channel = channel.as_str(), "channel stopped");
        Ok(())
    }

    /// Stops both channels. Does not touch the standby rail.
    pub fn stop_all(&mut self) -> Result<(), DriverError> {
        self.stop_channel(Channel::A)?;
        self.stop_channel(Channel::B)?;
        Ok(())
    }

    /// Stops everything, closes the PWM channels and drives standby low.
    ///
    /// Idempotent; repeated calls are no-ops.
    pub fn shutdown(&mut self) -> Result<(), DriverError> {
        if !self.initialized {
            return Ok(());
        }
        self.stop_all()?;
        if let Some(pwm) = self.pwm_a.take() {
            pwm.close()?;
        }
        if let Some(pwm) = self.pwm_b.take() {
            pwm.close()?;
        }
        self.port.write(self.pinout.stby, Level::Low)?;
        self.in_standby = true;
        self.initialized = false;
        debug!(stby = self.pinout.stby, "TB6612 shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpio::sim::{PortOp, SimulatedPort};

    const PINOUT: Tb6612Pinout = Tb6612Pinout {
        ain1: 2,
        ain2: 3,
        bin1: 4,
        bin2: 17,
        pwma: 12,
        pwmb: 13,
        stby: 26,
    };

    fn controller() -> (Arc<SimulatedPort>, Tb6612) {
        let port = Arc::new(SimulatedPort::new());
        let driver = Tb6612::new(port.clone(), PINOUT);
        (port, driver)
    }

    #[test]
    fn init_drives_directions_low_and_enables() {
        let (port, mut driver) = controller();
        driver.init().unwrap();

        for pin in PINOUT.direction_pins() {
            assert_eq!(port.level(pin), Some(Level::Low));
        }
        assert_eq!(port.duty(PINOUT.pwma), Some(0));
        assert_eq!(port.duty(PINOUT.pwmb), Some(0));
        assert_eq!(port.level(PINOUT.stby), Some(Level::High));
        assert!(!driver.in_standby());
    }

    #[test]
    fn forward_and_reverse_pin_patterns() {
        let (port, mut driver) = controller();
        driver.init().unwrap();

        driver.set_channel(Channel::A, 80, Direction::Forward).unwrap();
        assert_eq!(port.level(PINOUT.ain1), Some(Level::High));
        assert_eq!(port.level(PINOUT.ain2), Some(Level::Low));
        assert_eq!(port.duty(PINOUT.pwma), Some(80));

        driver.set_channel(Channel::B, 60, Direction::Reverse).unwrap();
        assert_eq!(port.level(PINOUT.bin1), Some(Level::Low));
        assert_eq!(port.level(PINOUT.bin2), Some(Level::High));
        assert_eq!(port.duty(PINOUT.pwmb), Some(60));
    }

    #[test]
    fn low_speeds_are_raised_to_the_duty_floor() {
        let (port, mut driver) = controller();
        driver.init().unwrap();

        driver.set_channel(Channel::A, 10, Direction::Forward).unwrap();
        assert_eq!(port.duty(PINOUT.pwma), Some(MIN_DUTY_PERCENT));
        assert_eq!(
            driver.channel_state(Channel::A).duty_percent,
            MIN_DUTY_PERCENT
        );
    }

    #[test]
    fn zero_speed_is_a_stop() {
        let (port, mut driver) = controller();
        driver.init().unwrap();

        driver.set_channel(Channel::A, 80, Direction::Forward).unwrap();
        driver.set_channel(Channel::A, 0, Direction::Forward).unwrap();
        assert_eq!(port.duty(PINOUT.pwma), Some(0));
        assert_eq!(port.level(PINOUT.ain1), Some(Level::Low));
        assert_eq!(driver.channel_state(Channel::A).direction, Direction::Stopped);
    }

    #[test]
    fn stop_clears_duty_before_direction_pins() {
        let (port, mut driver) = controller();
        driver.init().unwrap();
        driver.set_channel(Channel::A, 80, Direction::Forward).unwrap();

        port.take_journal();
        driver.stop_channel(Channel::A).unwrap();
        let journal = port.journal();

        let duty_zero = journal
            .iter()
            .position(|op| *op == PortOp::PwmDuty(PINOUT.pwma, 0))
            .expect("duty cleared");
        let in1_low = journal
            .iter()
            .position(|op| *op == PortOp::Write(PINOUT.ain1, Level::Low))
            .expect("in1 cleared");
        assert!(
            duty_zero < in1_low,
            "duty must reach zero before direction pins change: {journal:?}"
        );
    }

    #[test]
    fn standby_wake_precedes_direction_writes() {
        let (port, mut driver) = controller();
        driver.init().unwrap();
        driver.standby().unwrap();
        assert_eq!(port.level(PINOUT.stby), Some(Level::Low));

        port.take_journal();
        driver.set_channel(Channel::B, 50, Direction::Forward).unwrap();
        let journal = port.journal();

        let stby_high = journal
            .iter()
            .position(|op| *op == PortOp::Write(PINOUT.stby, Level::High))
            .expect("standby reasserted");
        let bin1_high = journal
            .iter()
            .position(|op| *op == PortOp::Write(PINOUT.bin1, Level::High))
            .expect("direction driven");
        assert!(stby_high < bin1_high);
    }

    #[test]
    fn stop_all_does_not_deassert_standby() {
        let (port, mut driver) = controller();
        driver.init().unwrap();
        driver.set_channel(Channel::A, 70, Direction::Forward).unwrap();
        driver.stop_all().unwrap();
        assert_eq!(port.level(PINOUT.stby), Some(Level::High));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (port, mut driver) = controller();
        driver.init().unwrap();
        driver.set_channel(Channel::A, 70, Direction::Forward).unwrap();

        driver.shutdown().unwrap();
        assert_eq!(port.level(PINOUT.stby), Some(Level::Low));
        assert_eq!(port.duty(PINOUT.pwma), None);

        // Second shutdown is a no-op, and init brings the chip back.
        driver.shutdown().unwrap();
        driver.init().unwrap();
        assert_eq!(port.level(PINOUT.stby), Some(Level::High));
    }

    #[test]
    fn init_failure_names_the_pin() {
        let (port, mut driver) = controller();
        port.fail_pin(PINOUT.bin2);
        match driver.init() {
            Err(DriverError::InitFailed { pin, .. }) => assert_eq!(pin, PINOUT.bin2),
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[test]
    fn commands_require_initialization() {
        let (_port, mut driver) = controller();
        assert!(matches!(
            driver.set_channel(Channel::A, 50, Direction::Forward),
            Err(DriverError::NotInitialized)
        ));
    }
}
