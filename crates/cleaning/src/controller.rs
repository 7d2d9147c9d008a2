//! The cleaning state machine.
//!
//! One cycle at a time. Phase transitions are purely time-driven except for
//! the stop input. During liquid phases the targeted pumps are pulsed in
//! round-robin (500 ms at half pressure, 200 ms gaps) to circulate liquid;
//! Clean and Sanitize phases first meter cleaning solution through the
//! designated solution pump. A dry phase just elapses time.
//!
//! Progress uses the same listener contract as the recipe executor, scaled
//! so each phase contributes an equal share of the 0→100 range.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dispense::{
    DispenseError, Fleet, FleetError, Operation, OperationGuard, ProgressEvent, ProgressListener,
    PumpId,
};

use crate::cycle::{CleaningCycle, CleaningMode, CleaningPhase, CycleLibrary, PhaseSpec};
use crate::history::CleaningRecord;
use crate::maintenance::MaintenanceLog;
use crate::CleaningError;

/// Length of one circulation pulse.
pub const CIRCULATION_PULSE: Duration = Duration::from_millis(500);

/// Gap between circulation pulses.
pub const CIRCULATION_GAP: Duration = Duration::from_millis(200);

/// Progress tick during dry phases.
pub const DRY_TICK: Duration = Duration::from_secs(2);

/// Drives cleaning cycles over the fleet.
pub struct CleaningController {
    fleet: Arc<Fleet>,
    cycles: CycleLibrary,
    /// Fleet member that meters cleaning solution, if one is plumbed in.
    solution_pump: Option<PumpId>,
    log: Mutex<MaintenanceLog>,
    log_path: Option<PathBuf>,
    listener: Mutex<Option<ProgressListener>>,
    current: Mutex<Option<CancellationToken>>,
}

impl CleaningController {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self {
            fleet,
            cycles: CycleLibrary::builtin(),
            solution_pump: None,
            log: Mutex::new(MaintenanceLog::default()),
            log_path: None,
            listener: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    /// Replaces the built-in cycle definitions.
    pub fn with_cycles(mut self, cycles: CycleLibrary) -> Self {
        self.cycles = cycles;
        self
    }

    /// Designates the pump that meters cleaning solution. It is an ordinary
    /// fleet member, covered by the same mutual-exclusion rules.
    pub fn with_solution_pump(mut self, pump_id: PumpId) -> Self {
        self.solution_pump = Some(pump_id);
        self
    }

    /// Seeds the maintenance log and persists updates to `path`.
    pub fn with_log(mut self, log: MaintenanceLog, path: PathBuf) -> Self {
        self.log = Mutex::new(log);
        self.log_path = Some(path);
        self
    }

    pub fn set_progress_listener(&self, listener: ProgressListener) {
        *self.listener.lock() = Some(listener);
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener(event);
        }
    }

    /// Requests abort of the in-flight cycle and immediately stops every
    /// pump channel. Does not latch the emergency flag.
    pub fn stop(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            warn!("cleaning stop requested");
            token.cancel();
        }
        self.fleet.stop_all_pumps();
    }

    /// Bumps the cocktail counter after a successful recipe; returns
    /// `Some(Quick)` when a quick clean is due.
    pub fn on_recipe_completed(&self) -> Option<CleaningMode> {
        let mut log = self.log.lock();
        let due = log.on_recipe_completed();
        self.persist(&log);
        due
    }

    /// The most urgent clean currently due, if any.
    pub fn recommendation(&self) -> Option<CleaningMode> {
        self.log.lock().recommendation(SystemTime::now())
    }

    /// The most recent cleaning runs, newest last.
    pub fn recent_history(&self, limit: usize) -> Vec<CleaningRecord> {
        self.log
            .lock()
            .history
            .recent(limit)
            .into_iter()
            .cloned()
            .collect()
    }

    fn persist(&self, log: &MaintenanceLog) {
        if let Some(path) = &self.log_path {
            if let Err(err) = log.save(path) {
                error!(%err, "failed to persist maintenance log");
            }
        }
    }

    fn record(&self, record: CleaningRecord) {
        let mut log = self.log.lock();
        log.record(record);
        self.persist(&log);
    }

    /// Runs one cleaning cycle. `pump_ids` defaults to every enabled pump.
    ///
    /// Claims the fleet operation marker for the whole cycle; a stop request
    /// or the emergency latch aborts at the next suspension point, stops all
    /// pumps and records the run as unsuccessful.
    pub async fn run(
        &self,
        mode: CleaningMode,
        pump_ids: Option<Vec<PumpId>>,
    ) -> Result<(), CleaningError> {
        let cycle = self
            .cycles
            .get(mode)
            .cloned()
            .ok_or(CleaningError::UnknownMode(mode))?;
        cycle.validate()?;

        let targets = match pump_ids {
            Some(ids) => ids,
            None => self
                .fleet
                .pumps()
                .filter(|p| p.is_enabled())
                .map(|p| p.id())
                .collect(),
        };
        if targets.is_empty() {
            return Err(CleaningError::NoTargets);
        }

        let guard = self.fleet.begin_operation(Operation::Cleaning {
            mode: mode.to_string(),
            phase: cycle.phases[0].phase.to_string(),
        })?;
        *self.current.lock() = Some(guard.token().clone());
        info!(
            %mode,
            phases = cycle.phases.len(),
            ?targets,
            total_s = cycle.total_duration().as_secs(),
            "cleaning cycle started"
        );
        self.emit(ProgressEvent::new(mode.to_string(), 0.0));

        let started = Instant::now();
        let mut phases_completed = 0;
        let result = self
            .run_phases(&cycle, &targets, &guard, &mut phases_completed)
            .await;
        *self.current.lock() = None;
        let duration_s = started.elapsed().as_secs_f64();

        let success = result.is_ok();
        if success {
            self.emit(ProgressEvent::with_message(
                "complete",
                100.0,
                "system clean",
            ));
            info!(%mode, duration_s, "cleaning cycle complete");
        } else {
            self.emit(ProgressEvent::with_message(
                "aborted",
                (phases_completed as f32 / cycle.phases.len() as f32) * 100.0,
                "cleaning interrupted",
            ));
            self.fleet.stop_all_pumps();
            warn!(%mode, duration_s, phases_completed, "cleaning cycle aborted");
        }
        self.record(CleaningRecord {
            timestamp: SystemTime::now(),
            mode,
            duration_s,
            success,
            pumps_cleaned: targets,
            phases_completed,
        });
        result
    }

    async fn run_phases(
        &self,
        cycle: &CleaningCycle,
        targets: &[PumpId],
        guard: &OperationGuard,
        phases_completed: &mut usize,
    ) -> Result<(), CleaningError> {
        let total = cycle.phases.len();
        for (i, spec) in cycle.phases.iter().enumerate() {
            if guard.token().is_cancelled() {
                return Err(CleaningError::Aborted);
            }
            guard.update(Operation::Cleaning {
                mode: cycle.mode.to_string(),
                phase: spec.phase.to_string(),
            });
            let base = (i as f32 / total as f32) * 100.0;
            let span = 100.0 / total as f32;
            info!(phase = %spec.phase, duration_s = spec.duration_s, "phase started");

            match spec.phase {
                CleaningPhase::Dry => self.dry_phase(spec, base, span, guard).await?,
                _ => self.liquid_phase(spec, targets, base, span, guard).await?,
            }
            *phases_completed += 1;
            self.emit(ProgressEvent::new(spec.phase.to_string(), base + span));
        }
        Ok(())
    }

    /// A liquid phase: meter solution if called for, then pulse the target
    /// pumps in round-robin until the phase duration elapses.
    async fn liquid_phase(
        &self,
        spec: &PhaseSpec,
        targets: &[PumpId],
        base: f32,
        span: f32,
        guard: &OperationGuard,
    ) -> Result<(), CleaningError> {
        if matches!(spec.phase, CleaningPhase::Clean | CleaningPhase::Sanitize)
            && spec.solution_volume_ml > 0.0
        {
            if let Some(pump_id) = self.solution_pump {
                info!(
                    pump = pump_id,
                    volume_ml = spec.solution_volume_ml,
                    "metering cleaning solution"
                );
                map_abort(
                    self.fleet
                        .dispense_pump(guard, pump_id, spec.solution_volume_ml, spec.pressure_percent)
                        .await,
                )?;
            }
        }

        let phase_duration = Duration::from_secs(spec.duration_s);
        let started = Instant::now();
        let mut sweep = 0usize;
        loop {
            let elapsed = started.elapsed();
            if elapsed >= phase_duration {
                return Ok(());
            }
            let fraction = (elapsed.as_secs_f64() / phase_duration.as_secs_f64()) as f32;
            self.emit(ProgressEvent::with_message(
                spec.phase.to_string(),
                base + fraction * span,
                "circulating",
            ));

            // 500 ms pulse at half pressure, then a 200 ms gap.
            let pump_id = targets[sweep % targets.len()];
            sweep += 1;
            map_abort(
                self.fleet
                    .pulse_pump(guard, pump_id, CIRCULATION_PULSE, spec.pressure_percent / 2)
                    .await,
            )?;
            tokio::select! {
                _ = guard.token().cancelled() => return Err(CleaningError::Aborted),
                _ = sleep(CIRCULATION_GAP) => {}
            }
        }
    }

    /// A dry phase moves no liquid; it just elapses time with slow ticks.
    async fn dry_phase(
        &self,
        spec: &PhaseSpec,
        base: f32,
        span: f32,
        guard: &OperationGuard,
    ) -> Result<(), CleaningError> {
        let phase_duration = Duration::from_secs(spec.duration_s);
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= phase_duration {
                return Ok(());
            }
            let remaining = phase_duration - elapsed;
            let fraction = (elapsed.as_secs_f64() / phase_duration.as_secs_f64()) as f32;
            self.emit(ProgressEvent::with_message(
                spec.phase.to_string(),
                base + fraction * span,
                format!("{} s remaining", remaining.as_secs()),
            ));
            tokio::select! {
                _ = guard.token().cancelled() => return Err(CleaningError::Aborted),
                _ = sleep(DRY_TICK.min(remaining)) => {}
            }
        }
    }

    /// Short rinse pulse through the given pumps between cocktails, outside
    /// any full cycle.
    pub async fn quick_rinse(&self, pump_ids: &[PumpId]) -> Result<(), CleaningError> {
        let guard = self.fleet.begin_operation(Operation::Cleaning {
            mode: "rinse".to_owned(),
            phase: CleaningPhase::Rinse.to_string(),
        })?;
        for pump_id in pump_ids {
            map_abort(
                self.fleet
                    .pulse_pump(&guard, *pump_id, Duration::from_secs(1), 40)
                    .await,
            )?;
            tokio::select! {
                _ = guard.token().cancelled() => return Err(CleaningError::Aborted),
                _ = sleep(Duration::from_millis(500)) => {}
            }
        }
        Ok(())
    }
}

/// Collapses cancellation-shaped fleet errors into [`CleaningError::Aborted`].
fn map_abort(result: Result<(), FleetError>) -> Result<(), CleaningError> {
    match result {
        Ok(()) => Ok(()),
        Err(FleetError::Dispense(DispenseError::Aborted { .. }))
        | Err(FleetError::EmergencyStopped) => Err(CleaningError::Aborted),
        Err(err) => Err(err.into()),
    }
}
