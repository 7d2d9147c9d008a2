//! Bounded history of cleaning runs.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use dispense::PumpId;

use crate::cycle::CleaningMode;

/// Oldest records are evicted beyond this many entries.
pub const HISTORY_CAPACITY: usize = 100;

/// One completed (or aborted) cleaning run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleaningRecord {
    pub timestamp: SystemTime,
    pub mode: CleaningMode,
    pub duration_s: f64,
    pub success: bool,
    pub pumps_cleaned: Vec<PumpId>,
    pub phases_completed: usize,
}

/// Append-only ring of the last [`HISTORY_CAPACITY`] cleaning runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CleaningHistory {
    records: VecDeque<CleaningRecord>,
}

impl CleaningHistory {
    pub fn push(&mut self, record: CleaningRecord) {
        self.records.push_back(record);
        while self.records.len() > HISTORY_CAPACITY {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent `limit` records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<&CleaningRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).collect()
    }

    /// The newest successful run of `mode`, if any.
    pub fn last_successful(&self, mode: CleaningMode) -> Option<&CleaningRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.mode == mode && r.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(mode: CleaningMode, success: bool, age_s: u64) -> CleaningRecord {
        CleaningRecord {
            timestamp: SystemTime::now() - Duration::from_secs(age_s),
            mode,
            duration_s: 25.0,
            success,
            pumps_cleaned: vec![1, 2],
            phases_completed: 2,
        }
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let mut history = CleaningHistory::default();
        for i in 0..(HISTORY_CAPACITY + 5) {
            history.push(record(CleaningMode::Quick, true, i as u64));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // The oldest five (ages 0..5) were pushed first and evicted first.
        let oldest = history.recent(HISTORY_CAPACITY)[0].timestamp;
        assert!(oldest <= SystemTime::now() - Duration::from_secs(5));
    }

    #[test]
    fn last_successful_skips_failures() {
        let mut history = CleaningHistory::default();
        history.push(record(CleaningMode::Standard, true, 3_600));
        history.push(record(CleaningMode::Standard, false, 60));
        let last = history.last_successful(CleaningMode::Standard).unwrap();
        assert!(last.success);
        assert!(last.timestamp <= SystemTime::now() - Duration::from_secs(3_000));
        assert!(history.last_successful(CleaningMode::Deep).is_none());
    }
}
