//! Auto-maintenance policy: when is the next clean due?
//!
//! Consulted after every successful recipe. A quick clean is scheduled every
//! few cocktails; standard and deep cleans are recommended on elapsed time
//! since their last successful run. The counter and the history ring live in
//! one persisted document so recommendations survive restarts.

use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::info;

use dispense::topology::atomic_write_json;
use dispense::ConfigError;

use crate::cycle::CleaningMode;
use crate::history::{CleaningHistory, CleaningRecord};

/// Cocktails between quick cleans.
pub const QUICK_CLEAN_AFTER_COCKTAILS: u32 = 5;

/// Maximum age of the last successful standard clean.
pub const STANDARD_CLEAN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum age of the last successful deep clean.
pub const DEEP_CLEAN_INTERVAL: Duration = Duration::from_secs(168 * 60 * 60);

/// Persisted maintenance state: the cocktail counter plus the history ring.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceLog {
    pub cocktails_since_last_clean: u32,
    pub history: CleaningHistory,
}

impl MaintenanceLog {
    /// Loads the log; a missing file is a fresh log.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
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

    /// Bumps the cocktail counter. Returns `Some(Quick)` once the counter
    /// reaches the quick-clean threshold; the caller schedules the clean
    /// after the in-flight recipe, never preempting it.
    pub fn on_recipe_completed(&mut self) -> Option<CleaningMode> {
        self.cocktails_since_last_clean += 1;
        if self.cocktails_since_last_clean >= QUICK_CLEAN_AFTER_COCKTAILS {
            info!(
                cocktails = self.cocktails_since_last_clean,
                "quick clean due"
            );
            Some(CleaningMode::Quick)
        } else {
            None
        }
    }

    /// Appends a run to the history. Any successful clean resets the
    /// cocktail counter.
    pub fn record(&mut self, record: CleaningRecord) {
        if record.success {
            self.cocktails_since_last_clean = 0;
        }
        self.history.push(record);
    }

    /// The most urgent clean due at `now`, if any: quick (by cocktail
    /// count) first, then standard, then deep (both by elapsed time since
    /// their last successful run; a mode with no history at all is due).
    pub fn recommendation(&self, now: SystemTime) -> Option<CleaningMode> {
        if self.cocktails_since_last_clean >= QUICK_CLEAN_AFTER_COCKTAILS {
            return Some(CleaningMode::Quick);
        }
        if self.is_due(CleaningMode::Standard, STANDARD_CLEAN_INTERVAL, now) {
            return Some(CleaningMode::Standard);
        }
        if self.is_due(CleaningMode::Deep, DEEP_CLEAN_INTERVAL, now) {
            return Some(CleaningMode::Deep);
        }
        None
    }

    fn is_due(&self, mode: CleaningMode, interval: Duration, now: SystemTime) -> bool {
        match self.history.last_successful(mode) {
            Some(record) => now
                .duration_since(record.timestamp)
                .map(|age| age >= interval)
                .unwrap_or(false),
            None => true,
        }
    }
}
