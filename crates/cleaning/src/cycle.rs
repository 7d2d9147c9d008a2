//! Cleaning cycle definitions.
//!
//! The four modes ship as built-in constants; a config file with the same
//! shape can override them (persisted with the shared atomic-replace
//! pattern).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dispense::topology::atomic_write_json;
use dispense::ConfigError;

use crate::CleaningError;

/// How thorough a cleaning run is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleaningMode {
    /// Between cocktails.
    Quick,
    /// End of service.
    Standard,
    /// Periodic maintenance.
    Deep,
    /// Disinfection without a full wash.
    SanitizeOnly,
}

impl fmt::Display for CleaningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleaningMode::Quick => "quick",
            CleaningMode::Standard => "standard",
            CleaningMode::Deep => "deep",
            CleaningMode::SanitizeOnly => "sanitize_only",
        };
        f.write_str(name)
    }
}

/// One phase of a cleaning cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleaningPhase {
    Rinse,
    Clean,
    Sanitize,
    FinalRinse,
    Dry,
}

impl fmt::Display for CleaningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleaningPhase::Rinse => "rinse",
            CleaningPhase::Clean => "clean",
            CleaningPhase::Sanitize => "sanitize",
            CleaningPhase::FinalRinse => "final_rinse",
            CleaningPhase::Dry => "dry",
        };
        f.write_str(name)
    }
}

/// Parameters of one phase.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase: CleaningPhase,
    pub duration_s: u64,
    /// Cleaning solution metered at phase start (Clean/Sanitize only).
    pub solution_volume_ml: f64,
    /// Pump pressure during the phase; circulation pulses run at half this.
    pub pressure_percent: u8,
}

/// An ordered sequence of phases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleaningCycle {
    pub mode: CleaningMode,
    pub phases: Vec<PhaseSpec>,
}

impl CleaningCycle {
    /// A dry phase moves air, never solution; an empty cycle is malformed.
    pub fn validate(&self) -> Result<(), CleaningError> {
        if self.phases.is_empty() {
            return Err(CleaningError::EmptyCycle(self.mode));
        }
        for spec in &self.phases {
            if spec.phase == CleaningPhase::Dry && spec.solution_volume_ml != 0.0 {
                return Err(CleaningError::DryPhaseWithSolution);
            }
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_secs(self.phases.iter().map(|p| p.duration_s).sum())
    }

    /// The built-in definition of `mode`.
    pub fn builtin(mode: CleaningMode) -> Self {
        let phase = |phase, duration_s, solution_volume_ml, pressure_percent| PhaseSpec {
            phase,
            duration_s,
            solution_volume_ml,
            pressure_percent,
        };
        use CleaningPhase::*;
        let phases = match mode {
            CleaningMode::Quick => vec![
                phase(Rinse, 10, 50.0, 60),
                phase(Clean, 15, 30.0, 60),
            ],
            CleaningMode::Standard => vec![
                phase(Rinse, 20, 100.0, 80),
                phase(Clean, 30, 75.0, 80),
                phase(Sanitize, 25, 50.0, 80),
                phase(FinalRinse, 15, 100.0, 80),
            ],
            CleaningMode::Deep => vec![
                phase(Rinse, 30, 150.0, 100),
                phase(Clean, 60, 100.0, 100),
                phase(Sanitize, 45, 75.0, 100),
                phase(FinalRinse, 30, 150.0, 100),
                phase(Dry, 120, 0.0, 100),
            ],
            CleaningMode::SanitizeOnly => vec![
                phase(Sanitize, 30, 60.0, 75),
                phase(FinalRinse, 20, 80.0, 75),
            ],
        };
        Self { mode, phases }
    }
}

/// The full set of cycle definitions the controller draws from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleLibrary {
    pub cycles: Vec<CleaningCycle>,
}

impl CycleLibrary {
    /// The four built-in modes.
    pub fn builtin() -> Self {
        Self {
            cycles: vec![
                CleaningCycle::builtin(CleaningMode::Quick),
                CleaningCycle::builtin(CleaningMode::Standard),
                CleaningCycle::builtin(CleaningMode::Deep),
                CleaningCycle::builtin(CleaningMode::SanitizeOnly),
            ],
        }
    }

    pub fn get(&self, mode: CleaningMode) -> Option<&CleaningCycle> {
        self.cycles.iter().find(|c| c.mode == mode)
    }

    /// Loads overrides from `path`; a missing file yields the built-ins.
    /// Every cycle is validated before the library is accepted.
    pub fn load(path: &Path) -> Result<Self, CleaningError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::builtin());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
                .into());
            }
        };
        let library: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for cycle in &library.cycles {
            cycle.validate()?;
        }
        Ok(library)
    }

    pub fn save(&self, path: &Path) -> Result<(), CleaningError> {
        Ok(atomic_write_json(path, self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_cycles_are_valid() {
        for cycle in CycleLibrary::builtin().cycles {
            cycle.validate().unwrap();
        }
    }

    #[test]
    fn dry_phases_carry_no_solution() {
        let mut cycle = CleaningCycle::builtin(CleaningMode::Deep);
        let dry = cycle
            .phases
            .iter_mut()
            .find(|p| p.phase == CleaningPhase::Dry)
            .unwrap();
        dry.solution_volume_ml = 25.0;
        assert!(matches!(
            cycle.validate(),
            Err(CleaningError::DryPhaseWithSolution)
        ));
    }

    #[test]
    fn quick_cycle_matches_the_shipped_timings() {
        let quick = CleaningCycle::builtin(CleaningMode::Quick);
        assert_eq!(quick.total_duration(), Duration::from_secs(25));
        assert_eq!(quick.phases[0].phase, CleaningPhase::Rinse);
        assert_eq!(quick.phases[1].phase, CleaningPhase::Clean);
    }

    #[test]
    fn library_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycles.json");
        let library = CycleLibrary::builtin();
        library.save(&path).unwrap();
        assert_eq!(CycleLibrary::load(&path).unwrap(), library);
    }

    #[test]
    fn missing_override_file_yields_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let library = CycleLibrary::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(library, CycleLibrary::builtin());
    }
}
