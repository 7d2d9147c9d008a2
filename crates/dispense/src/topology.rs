//! Hardware topology: controller pinouts and pump bindings.
//!
//! Loaded once at startup and validated before any pin is touched. The
//! real board shares the STBY line and the two PWM rails across all six
//! controllers (26 pins instead of 42), so only the direction pins are
//! required to be globally unique.
//!
//! Calibration factors live in a separate overlay document so that updates
//! made at the bar survive restarts without rewriting the topology file.
//! All writes go through the atomic-replace pattern: write `<name>.tmp`,
//! then rename over the target.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use driver_tb6612::{Channel, Tb6612Pinout};
use gpio::{pin_in_range, Pin};

use crate::error::ConfigError;

/// Identifier of one pump in the topology.
pub type PumpId = u32;

/// The seven control pins of one TB6612FNG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerPinout {
    pub ain1: Pin,
    pub ain2: Pin,
    pub bin1: Pin,
    pub bin2: Pin,
    pub pwma: Pin,
    pub pwmb: Pin,
    pub stby: Pin,
}

impl From<ControllerPinout> for Tb6612Pinout {
    fn from(p: ControllerPinout) -> Self {
        Tb6612Pinout {
            ain1: p.ain1,
            ain2: p.ain2,
            bin1: p.bin1,
            bin2: p.bin2,
            pwma: p.pwma,
            pwmb: p.pwmb,
            stby: p.stby,
        }
    }
}

impl ControllerPinout {
    fn direction_pins(&self) -> [Pin; 4] {
        [self.ain1, self.ain2, self.bin1, self.bin2]
    }

    fn all_pins(&self) -> [Pin; 7] {
        [
            self.ain1, self.ain2, self.bin1, self.bin2, self.pwma, self.pwmb, self.stby,
        ]
    }
}

fn default_calibration() -> f64 {
    1.0
}

fn default_capacity() -> f64 {
    750.0
}

fn default_enabled() -> bool {
    true
}

/// Binds one ingredient and flow calibration to one controller channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PumpBinding {
    pub pump_id: PumpId,
    pub controller_index: usize,
    pub channel: Channel,
    pub ingredient: String,
    /// Nominal flow rate of the peristaltic pump in ml/s.
    pub flow_rate_ml_s: f64,
    /// Dimensionless correction applied to the nominal flow rate.
    #[serde(default = "default_calibration")]
    pub calibration_factor: f64,
    /// Capacity of the attached reservoir.
    #[serde(default = "default_capacity")]
    pub capacity_ml: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// The full hardware description, validated at load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareTopology {
    pub controllers: Vec<ControllerPinout>,
    pub pumps: Vec<PumpBinding>,
}

impl HardwareTopology {
    /// Checks the structural invariants:
    ///
    /// * every pin is in the addressable range;
    /// * direction pins are pairwise distinct across all controllers (PWM
    ///   and STBY rails may be shared);
    /// * each `(controller, channel)` pair carries at most one pump;
    /// * pump ids are unique and ingredient names are unique
    ///   case-insensitively.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut direction_pins = HashSet::new();
        for controller in &self.controllers {
            for pin in controller.all_pins() {
                if !pin_in_range(pin) {
                    return Err(ConfigError::PinOutOfRange(pin));
                }
            }
            for pin in controller.direction_pins() {
                if !direction_pins.insert(pin) {
                    return Err(ConfigError::DuplicateDirectionPin(pin));
                }
            }
        }

        let mut ids = HashSet::new();
        let mut channels = HashSet::new();
        let mut ingredients = HashSet::new();
        for pump in &self.pumps {
            if pump.controller_index >= self.controllers.len() {
                return Err(ConfigError::UnknownController {
                    pump_id: pump.pump_id,
                    controller_index: pump.controller_index,
                });
            }
            if !ids.insert(pump.pump_id) {
                return Err(ConfigError::DuplicatePumpId(pump.pump_id));
            }
            if !channels.insert((pump.controller_index, pump.channel)) {
                return Err(ConfigError::ChannelCollision {
                    controller_index: pump.controller_index,
                    channel: pump.channel,
                });
            }
            if !ingredients.insert(pump.ingredient.to_lowercase()) {
                return Err(ConfigError::DuplicateIngredient(pump.ingredient.clone()));
            }
            if !(pump.flow_rate_ml_s > 0.0) {
                return Err(ConfigError::NonPositiveFlowRate(pump.pump_id));
            }
        }
        debug!(
            controllers = self.controllers.len(),
            pumps = self.pumps.len(),
            "topology validated"
        );
        Ok(())
    }

    pub fn binding(&self, pump_id: PumpId) -> Option<&PumpBinding> {
        self.pumps.iter().find(|p| p.pump_id == pump_id)
    }

    /// Loads and validates a topology document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let topology: Self =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        topology.validate()?;
        info!(path = %path.display(), pumps = topology.pumps.len(), "topology loaded");
        Ok(topology)
    }

    /// Persists the topology with the atomic-replace pattern.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        atomic_write_json(path, self)
    }

    /// The stock 6-controller / 12-pump layout of the machine.
    ///
    /// STBY is one shared rail (pin 26) and the two PWM rails sit on the
    /// hardware-PWM-capable pins 12 and 13.
    pub fn default_layout() -> Self {
        let rails = |ain1, ain2, bin1, bin2| ControllerPinout {
            ain1,
            ain2,
            bin1,
            bin2,
            pwma: 12,
            pwmb: 13,
            stby: 26,
        };
        let pump = |pump_id, controller_index, channel, ingredient: &str, flow, capacity| {
            PumpBinding {
                pump_id,
                controller_index,
                channel,
                ingredient: ingredient.to_owned(),
                flow_rate_ml_s: flow,
                calibration_factor: 1.0,
                capacity_ml: capacity,
                enabled: true,
            }
        };
        Self {
            controllers: vec![
                rails(2, 3, 4, 17),
                rails(27, 22, 10, 9),
                rails(11, 5, 6, 19),
                rails(16, 20, 21, 1),
                rails(7, 8, 25, 24),
                rails(23, 18, 15, 14),
            ],
            pumps: vec![
                pump(1, 0, Channel::A, "Gin", 2.8, 750.0),
                pump(2, 0, Channel::B, "Bourbon", 2.8, 750.0),
                pump(3, 1, Channel::A, "White rum", 2.8, 750.0),
                pump(4, 1, Channel::B, "Amaretto", 2.8, 750.0),
                pump(5, 2, Channel::A, "Campari", 2.5, 750.0),
                pump(6, 2, Channel::B, "Sweet vermouth", 2.5, 750.0),
                pump(7, 3, Channel::A, "Lemon juice", 3.2, 1000.0),
                pump(8, 3, Channel::B, "Lime juice", 3.2, 1000.0),
                pump(9, 4, Channel::A, "Simple syrup", 2.0, 500.0),
                pump(10, 4, Channel::B, "Dry vermouth", 2.5, 500.0),
                pump(11, 5, Channel::A, "Violet liqueur", 1.8, 500.0),
                pump(12, 5, Channel::B, "Honey syrup", 1.5, 500.0),
            ],
        }
    }
}

/// Calibration factors persisted separately from the topology, keyed by
/// pump id, so bar-side calibration survives restarts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOverlay {
    pub factors: BTreeMap<PumpId, f64>,
}

impl CalibrationOverlay {
    /// Loads the overlay; a missing file is an empty overlay.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        atomic_write_json(path, self)
    }

    pub fn set(&mut self, pump_id: PumpId, factor: f64) {
        self.factors.insert(pump_id, factor);
    }

    /// Applies the stored factors over the matching bindings.
    pub fn apply(&self, topology: &mut HardwareTopology) {
        for pump in &mut topology.pumps {
            if let Some(factor) = self.factors.get(&pump.pump_id) {
                pump.calibration_factor = *factor;
            }
        }
    }
}

/// Serializes `value` next to `path` and renames over it, so readers never
/// observe a torn document. Shared by every persisted document of the
/// machine (topology, calibration, recipes, cleaning state).
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    let mut body = serde_json::to_string_pretty(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    body.push('\n');
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(write_err)?;
        file.write_all(body.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
    }
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        HardwareTopology::default_layout().validate().unwrap();
    }

    #[test]
    fn duplicate_direction_pins_are_rejected() {
        let mut topology = HardwareTopology::default_layout();
        topology.controllers[1].ain1 = topology.controllers[0].ain2;
        assert!(matches!(
            topology.validate(),
            Err(ConfigError::DuplicateDirectionPin(3))
        ));
    }

    #[test]
    fn shared_pwm_and_standby_rails_are_allowed() {
        // The stock layout shares pwma/pwmb/stby across all controllers.
        let topology = HardwareTopology::default_layout();
        assert!(topology
            .controllers
            .iter()
            .all(|c| c.stby == topology.controllers[0].stby));
        topology.validate().unwrap();
    }

    #[test]
    fn channel_collisions_are_rejected() {
        let mut topology = HardwareTopology::default_layout();
        topology.pumps[1].channel = Channel::A; // now collides with pump 1
        assert!(matches!(
            topology.validate(),
            Err(ConfigError::ChannelCollision {
                controller_index: 0,
                channel: Channel::A,
            })
        ));
    }

    #[test]
    fn ingredient_uniqueness_is_case_insensitive() {
        let mut topology = HardwareTopology::default_layout();
        topology.pumps[1].ingredient = "gIN".to_owned();
        assert!(matches!(
            topology.validate(),
            Err(ConfigError::DuplicateIngredient(_))
        ));
    }

    #[test]
    fn load_dump_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        HardwareTopology::default_layout().save(&path).unwrap();

        let first = std::fs::read_to_string(&path).unwrap();
        let reloaded = HardwareTopology::load(&path).unwrap();
        reloaded.save(&path).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn overlay_applies_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");

        let mut overlay = CalibrationOverlay::default();
        overlay.set(3, 1.034567);
        overlay.save(&path).unwrap();

        let reloaded = CalibrationOverlay::load(&path).unwrap();
        let mut topology = HardwareTopology::default_layout();
        reloaded.apply(&mut topology);
        assert_eq!(topology.binding(3).unwrap().calibration_factor, 1.034567);
        // Untouched pumps keep their configured factor.
        assert_eq!(topology.binding(1).unwrap().calibration_factor, 1.0);
    }

    #[test]
    fn missing_overlay_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = CalibrationOverlay::load(&dir.path().join("nope.json")).unwrap();
        assert!(overlay.factors.is_empty());
    }
}
