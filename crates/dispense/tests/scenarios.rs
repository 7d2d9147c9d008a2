//! End-to-end scenarios against the simulated port.
//!
//! These run under the paused tokio clock, so multi-minute pours elapse
//! instantly while keeping exact timing semantics.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use dispense::{
    DispenseError, ExecuteError, Fleet, FleetError, HardwareTopology, Operation, PourCategory,
    ProgressEvent, ProgressListener, PumpBinding, Recipe, RecipeExecutor, RecipeIngredient,
};
use dispense::topology::ControllerPinout;
use driver_tb6612::Channel;
use gpio::{Level, SimulatedPort};

const PINOUT: ControllerPinout = ControllerPinout {
    ain1: 2,
    ain2: 3,
    bin1: 4,
    bin2: 17,
    pwma: 12,
    pwmb: 13,
    stby: 26,
};

fn binding(
    pump_id: u32,
    channel: Channel,
    ingredient: &str,
    flow_rate_ml_s: f64,
    enabled: bool,
) -> PumpBinding {
    PumpBinding {
        pump_id,
        controller_index: 0,
        channel,
        ingredient: ingredient.to_owned(),
        flow_rate_ml_s,
        calibration_factor: 1.0,
        capacity_ml: 750.0,
        enabled,
    }
}

fn gin_tonic_topology() -> HardwareTopology {
    HardwareTopology {
        controllers: vec![PINOUT],
        pumps: vec![
            binding(1, Channel::A, "Gin", 2.5, true),
            binding(2, Channel::B, "Tonic", 3.0, true),
        ],
    }
}

fn recipe(id: &str, ingredients: Vec<RecipeIngredient>) -> Recipe {
    Recipe {
        id: id.to_owned(),
        name: id.to_owned(),
        ingredients,
        glass: String::new(),
        garnish: String::new(),
        instructions: vec![],
    }
}

fn ing(name: &str, amount_ml: f64, category: PourCategory) -> RecipeIngredient {
    RecipeIngredient {
        name: name.to_owned(),
        amount_ml,
        category,
    }
}

fn progress_collector() -> (ProgressListener, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: ProgressListener = Arc::new(move |event| sink.lock().push(event));
    (listener, events)
}

fn assert_channel_quiet(port: &SimulatedPort) {
    for pin in [PINOUT.ain1, PINOUT.ain2, PINOUT.bin1, PINOUT.bin2] {
        assert_eq!(port.level(pin), Some(Level::Low), "direction pin {pin}");
    }
    assert_eq!(port.duty(PINOUT.pwma), Some(0));
    assert_eq!(port.duty(PINOUT.pwmb), Some(0));
}

#[tokio::test(start_paused = true)]
async fn two_ingredient_recipe_times_and_credits_each_pour() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port.clone()).unwrap();
    let executor = RecipeExecutor::new(Arc::clone(&fleet));
    let (listener, events) = progress_collector();
    executor.set_progress_listener(listener);

    let recipe = recipe(
        "gin_tonic",
        vec![
            ing("Gin", 50.0, PourCategory::Spirits),
            ing("Tonic", 100.0, PourCategory::Mixer),
        ],
    );

    let started = Instant::now();
    executor.execute(&recipe, 1.0).await.unwrap();
    let elapsed = started.elapsed().as_secs_f64();

    // 20 s of gin + 200 ms settle + 33.333 s of tonic.
    assert!(
        (53.3..=54.1).contains(&elapsed),
        "unexpected wall time {elapsed}"
    );

    let gin = fleet.pump(1).unwrap().state();
    assert!((gin.volume_dispensed_ml - 50.0).abs() < 1e-9);
    assert!((gin.total_runtime_s - 20.0).abs() < 1e-6);
    let tonic = fleet.pump(2).unwrap().state();
    assert!((tonic.volume_dispensed_ml - 100.0).abs() < 1e-9);
    assert!((tonic.total_runtime_s - 100.0 / 3.0).abs() < 1e-6);

    let events = events.lock();
    let labels: Vec<&str> = events.iter().map(|e| e.step.as_str()).collect();
    assert_eq!(labels, vec!["pour Gin", "pour Tonic", "complete"]);
    assert_eq!(events[0].percent, 0.0);
    assert_eq!(events[1].percent, 50.0);
    assert_eq!(events[2].percent, 100.0);

    // All channels idle again: direction pins low, duty zero.
    assert_channel_quiet(&port);
    assert_eq!(fleet.snapshot().operation, Operation::Idle);
}

#[tokio::test(start_paused = true)]
async fn pours_reorder_by_category() {
    let port = Arc::new(SimulatedPort::new());
    let topology = HardwareTopology {
        controllers: vec![PINOUT],
        pumps: vec![
            binding(1, Channel::A, "Rum", 2.5, true),
            binding(2, Channel::B, "Cola", 3.0, true),
        ],
    };
    let fleet = Fleet::new(&topology, port).unwrap();
    let executor = RecipeExecutor::new(fleet);
    let (listener, events) = progress_collector();
    executor.set_progress_listener(listener);

    // Mixer listed first; spirits must still pour first.
    let recipe = recipe(
        "rum_cola",
        vec![
            ing("Cola", 120.0, PourCategory::Mixer),
            ing("Rum", 50.0, PourCategory::Spirits),
        ],
    );
    executor.execute(&recipe, 1.0).await.unwrap();

    let labels: Vec<String> = events.lock().iter().map(|e| e.step.clone()).collect();
    assert_eq!(labels, vec!["pour Rum", "pour Cola", "complete"]);
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_aborts_the_pour_and_latches() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port.clone()).unwrap();
    let executor = Arc::new(RecipeExecutor::new(Arc::clone(&fleet)));

    let recipe = recipe(
        "gin_tonic",
        vec![
            ing("Gin", 50.0, PourCategory::Spirits),
            ing("Tonic", 100.0, PourCategory::Mixer),
        ],
    );

    let task = {
        let executor = Arc::clone(&executor);
        let recipe = recipe.clone();
        tokio::spawn(async move { executor.execute(&recipe, 1.0).await })
    };

    // 10 s into the 20 s gin pour.
    tokio::time::sleep(Duration::from_secs(10)).await;
    fleet.emergency_stop();

    // The channel is already quiet before the dispense task even reports.
    assert_channel_quiet(&port);

    match task.await.unwrap() {
        Err(ExecuteError::Cancelled { completed }) => assert!(completed.is_empty()),
        other => panic!("expected Cancelled, got {other:?}"),
    }

    // Half the gin was credited; tonic never started.
    let gin = fleet.pump(1).unwrap().state();
    assert!((gin.volume_dispensed_ml - 25.0).abs() < 0.2, "{gin:?}");
    let tonic = fleet.pump(2).unwrap().state();
    assert_eq!(tonic.volume_dispensed_ml, 0.0);

    assert!(fleet.is_emergency_stopped());
    match fleet.dispense_by_ingredient("gin", 10.0).await {
        Err(FleetError::EmergencyStopped) => {}
        other => panic!("expected EmergencyStopped, got {other:?}"),
    }

    // Everything has quiesced, so the reset is accepted and pours work again.
    fleet.reset_emergency().unwrap();
    fleet.dispense_by_ingredient("gin", 10.0).await.unwrap();
}

#[test]
fn calibration_smooths_and_clamps() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port).unwrap();

    // Expected 50, measured 45: raw 1.1111, blended 1.0333.
    let factor = fleet.calibrate_pump(1, 50.0, 45.0).unwrap();
    assert!((factor - 1.033333).abs() < 1e-4, "{factor}");

    // A perfect measurement drifts the factor back toward 1.0.
    let factor = fleet.calibrate_pump(1, 50.0, 50.0).unwrap();
    assert!((factor - 1.023333).abs() < 1e-4, "{factor}");

    // An exact measurement at factor 1.0 is a no-op.
    let factor = fleet.calibrate_pump(2, 80.0, 80.0).unwrap();
    assert!((factor - 1.0).abs() < 1e-12);

    // Raw factors outside [0.5, 2.0] are operator mis-measurements.
    assert!(matches!(
        fleet.calibrate_pump(1, 50.0, 10.0),
        Err(FleetError::Calibration(_))
    ));
    assert!(matches!(
        fleet.calibrate_pump(1, 10.0, 50.0),
        Err(FleetError::Calibration(_))
    ));
    assert!(matches!(
        fleet.calibrate_pump(1, 50.0, 0.0),
        Err(FleetError::Calibration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn calibration_applies_to_the_next_dispense() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port).unwrap();

    // Force the factor up, then check the run gets shorter accordingly.
    fleet.calibrate_pump(1, 50.0, 40.0).unwrap(); // raw 1.25 -> 1.075
    let factor = fleet.pump(1).unwrap().state().calibration_factor;

    let started = Instant::now();
    fleet.dispense_by_ingredient("gin", 50.0).await.unwrap();
    let elapsed = started.elapsed().as_secs_f64();
    let expected = 50.0 / (2.5 * factor);
    assert!((elapsed - expected).abs() < 0.05, "{elapsed} vs {expected}");
}

#[tokio::test(start_paused = true)]
async fn unsatisfiable_recipe_fails_before_any_gpio_activity() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port.clone()).unwrap();
    let executor = RecipeExecutor::new(Arc::clone(&fleet));

    port.take_journal(); // discard construction traffic

    let recipe = recipe(
        "mystery",
        vec![
            ing("Absinthe", 30.0, PourCategory::Spirits),
            ing("Gin", 20.0, PourCategory::Spirits),
        ],
    );
    match executor.execute(&recipe, 1.0).await {
        Err(ExecuteError::UnsatisfiableRecipe { missing }) => {
            assert_eq!(missing, vec!["Absinthe".to_owned()]);
        }
        other => panic!("expected UnsatisfiableRecipe, got {other:?}"),
    }

    assert!(port.journal().is_empty(), "no pin may move");
    assert_eq!(fleet.snapshot().operation, Operation::Idle);
}

#[tokio::test(start_paused = true)]
async fn disabled_pumps_make_a_recipe_unsatisfiable() {
    let port = Arc::new(SimulatedPort::new());
    let topology = HardwareTopology {
        controllers: vec![PINOUT],
        pumps: vec![binding(1, Channel::A, "Gin", 2.5, false)],
    };
    let fleet = Fleet::new(&topology, port).unwrap();
    let executor = RecipeExecutor::new(fleet);

    let recipe = recipe("gin_only", vec![ing("Gin", 20.0, PourCategory::Spirits)]);
    assert!(matches!(
        executor.execute(&recipe, 1.0).await,
        Err(ExecuteError::UnsatisfiableRecipe { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn pour_volume_boundary_sits_at_the_maximum_pour_time() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port).unwrap();

    // 150 ml at 2.5 ml/s is exactly the 60 s limit.
    fleet.dispense_by_ingredient("gin", 150.0).await.unwrap();

    match fleet.dispense_by_ingredient("gin", 150.1).await {
        Err(FleetError::Dispense(DispenseError::VolumeTooLarge { .. })) => {}
        other => panic!("expected VolumeTooLarge, got {other:?}"),
    }

    match fleet.dispense_by_ingredient("gin", 0.0).await {
        Err(FleetError::Dispense(DispenseError::VolumeNonPositive)) => {}
        other => panic!("expected VolumeNonPositive, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn executor_cancel_reports_completed_pours() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port).unwrap();
    let executor = Arc::new(RecipeExecutor::new(Arc::clone(&fleet)));

    let recipe = recipe(
        "gin_tonic",
        vec![
            ing("Gin", 10.0, PourCategory::Spirits),
            ing("Tonic", 90.0, PourCategory::Mixer),
        ],
    );

    let task = {
        let executor = Arc::clone(&executor);
        let recipe = recipe.clone();
        tokio::spawn(async move { executor.execute(&recipe, 1.0).await })
    };

    // Let the gin pour (4 s) finish, then cancel during the tonic pour.
    tokio::time::sleep(Duration::from_secs(10)).await;
    executor.cancel();

    match task.await.unwrap() {
        Err(ExecuteError::Cancelled { completed }) => {
            assert_eq!(completed, vec!["Gin".to_owned()]);
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }

    // A cooperative cancel is not an emergency: the fleet stays usable.
    assert!(!fleet.is_emergency_stopped());
    fleet.dispense_by_ingredient("tonic", 10.0).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fleet_shutdown_is_idempotent() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port.clone()).unwrap();
    fleet.dispense_by_ingredient("gin", 10.0).await.unwrap();

    fleet.shutdown().unwrap();
    assert_eq!(port.level(PINOUT.stby), None); // released
    fleet.shutdown().unwrap();

    // The fleet can be brought back by re-initializing the controllers.
    fleet.reinitialize().unwrap();
    fleet.dispense_by_ingredient("gin", 10.0).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dose_scalar_scales_every_pour() {
    let port = Arc::new(SimulatedPort::new());
    let fleet = Fleet::new(&gin_tonic_topology(), port).unwrap();
    let executor = RecipeExecutor::new(Arc::clone(&fleet));

    let recipe = recipe("double", vec![ing("Gin", 25.0, PourCategory::Spirits)]);
    executor.execute(&recipe, 2.0).await.unwrap();
    let gin = fleet.pump(1).unwrap().state();
    assert!((gin.volume_dispensed_ml - 50.0).abs() < 1e-9);

    assert!(matches!(
        executor.execute(&recipe, 3.5).await,
        Err(ExecuteError::InvalidDose(_))
    ));
}
