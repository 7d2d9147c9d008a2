//! The recipe executor: turns a recipe into ordered, progress-reporting
//! pours against the fleet.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DispenseError, ExecuteError, FleetError};
use crate::fleet::{Fleet, Operation, OperationGuard};
use crate::progress::{ProgressEvent, ProgressListener};
use crate::recipe::{PourCategory, Recipe, DOSE_RANGE};
use crate::{DEFAULT_DISPENSE_SPEED, INTER_POUR_SETTLE};

/// Sequences the pours of one recipe at a time.
pub struct RecipeExecutor {
    fleet: Arc<Fleet>,
    listener: Mutex<Option<ProgressListener>>,
    /// Cancellation token of the in-flight execution, if any.
    current: Mutex<Option<CancellationToken>>,
}

impl RecipeExecutor {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self {
            fleet,
            listener: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    /// Registers the progress listener. Events are delivered at least once;
    /// consumers must tolerate duplicate `complete` events.
    pub fn set_progress_listener(&self, listener: ProgressListener) {
        *self.listener.lock() = Some(listener);
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener(event);
        }
    }

    /// Requests cancellation of the in-flight execution; the current pour
    /// aborts at its next suspension point.
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            warn!("recipe cancellation requested");
            token.cancel();
        }
    }

    /// Executes `recipe` with every pour volume scaled by `dose_scalar`.
    ///
    /// Pours run in category order (spirits → syrup → juice → mixer);
    /// garnishes are surfaced as progress events only. The fleet operation
    /// marker is held for the whole recipe and released on every exit path.
    pub async fn execute(&self, recipe: &Recipe, dose_scalar: f64) -> Result<(), ExecuteError> {
        if !DOSE_RANGE.contains(&dose_scalar) {
            return Err(ExecuteError::InvalidDose(dose_scalar));
        }

        // Every non-garnish ingredient must resolve to an enabled pump
        // before any liquid moves.
        let mut missing = Vec::new();
        for ingredient in &recipe.ingredients {
            if ingredient.category == PourCategory::Garnish {
                continue;
            }
            let satisfied = self
                .fleet
                .resolve_ingredient(&ingredient.name)
                .map(|pump| pump.is_enabled())
                .unwrap_or(false);
            if !satisfied && !missing.contains(&ingredient.name) {
                missing.push(ingredient.name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(ExecuteError::UnsatisfiableRecipe { missing });
        }

        let guard = self.fleet.begin_operation(Operation::Dispensing {
            label: recipe.id.clone(),
        })?;
        *self.current.lock() = Some(guard.token().clone());
        info!(recipe = %recipe.id, dose_scalar, "executing recipe");
        let result = self.run(recipe, dose_scalar, &guard).await;
        *self.current.lock() = None;
        result
    }

    async fn run(
        &self,
        recipe: &Recipe,
        dose_scalar: f64,
        guard: &OperationGuard,
    ) -> Result<(), ExecuteError> {
        let pours = recipe.sorted_pours();
        let total = pours.len();
        let mut completed = Vec::new();

        for (i, pour) in pours.iter().enumerate() {
            let percent = (i as f32 / total as f32) * 100.0;
            if pour.category == PourCategory::Garnish {
                self.emit(ProgressEvent::new(format!("garnish {}", pour.name), percent));
                continue;
            }

            self.emit(ProgressEvent::new(format!("pour {}", pour.name), percent));
            let volume_ml = pour.amount_ml * dose_scalar;
            match self
                .fleet
                .dispense_with(guard, &pour.name, volume_ml, DEFAULT_DISPENSE_SPEED)
                .await
            {
                Ok(()) => completed.push(pour.name.clone()),
                Err(FleetError::Dispense(DispenseError::Aborted { dispensed_ml })) => {
                    warn!(
                        recipe = %recipe.id,
                        ingredient = %pour.name,
                        dispensed_ml,
                        "recipe cancelled mid-pour"
                    );
                    return Err(ExecuteError::Cancelled { completed });
                }
                Err(FleetError::EmergencyStopped) => {
                    return Err(ExecuteError::Cancelled { completed });
                }
                Err(source) => {
                    // Progress is intentionally not rewound.
                    return Err(ExecuteError::DispenseFailed {
                        ingredient: pour.name.clone(),
                        source,
                    });
                }
            }

            // Settle before the next pour.
            if i + 1 < total {
                sleep(INTER_POUR_SETTLE).await;
            }
        }

        self.emit(ProgressEvent::new("complete", 100.0));
        info!(recipe = %recipe.id, "recipe complete");
        Ok(())
    }
}
