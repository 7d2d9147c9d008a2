//! # Barkeep Host
//!
//! Command-line front end for the dispenser control core. It owns the things
//! the embedded core deliberately does not: config file locations, port
//! selection (real Raspberry Pi GPIO vs. simulation), progress printing and
//! the Ctrl-C → emergency-stop wiring.
//!
//! On first run the default topology and recipe book are written out, so
//! `barkeep --simulate make old_fashioned` works on a bare checkout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use cleaning::{CleaningController, CleaningMode, CycleLibrary, MaintenanceLog};
use dispense::{
    CalibrationOverlay, Fleet, HardwareTopology, ProgressListener, RecipeBook, RecipeExecutor,
};
use gpio::{GpioPort, SimulatedPort};

/// Control core CLI for the cocktail dispenser.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding topology, calibration, recipe and maintenance files.
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    /// Use the in-memory GPIO port instead of the Raspberry Pi hardware.
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the fleet snapshot and any maintenance recommendation.
    Status,
    /// Pour a single ingredient by name.
    Pour {
        ingredient: String,
        volume_ml: f64,
    },
    /// Make a recipe from the recipe book.
    Make {
        recipe_id: String,
        /// Dose scalar (1.0 = single, 2.0 = double).
        #[arg(long, default_value_t = 1.0)]
        dose: f64,
    },
    /// Run a cleaning cycle.
    Clean {
        #[arg(value_enum)]
        mode: ModeArg,
        /// Pump id that meters cleaning solution, if one is plumbed in.
        #[arg(long)]
        solution_pump: Option<u32>,
    },
    /// Record a calibration measurement for one pump.
    Calibrate {
        pump_id: u32,
        expected_ml: f64,
        measured_ml: f64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Quick,
    Standard,
    Deep,
    SanitizeOnly,
}

impl From<ModeArg> for CleaningMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Quick => CleaningMode::Quick,
            ModeArg::Standard => CleaningMode::Standard,
            ModeArg::Deep => CleaningMode::Deep,
            ModeArg::SanitizeOnly => CleaningMode::SanitizeOnly,
        }
    }
}

struct Paths {
    topology: PathBuf,
    calibration: PathBuf,
    recipes: PathBuf,
    cycles: PathBuf,
    maintenance: PathBuf,
}

impl Paths {
    fn new(config_dir: &std::path::Path) -> Self {
        Self {
            topology: config_dir.join("topology.json"),
            calibration: config_dir.join("calibration.json"),
            recipes: config_dir.join("recipes.json"),
            cycles: config_dir.join("cleaning_cycles.json"),
            maintenance: config_dir.join("maintenance.json"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let paths = Paths::new(&cli.config_dir);

    let port = build_port(cli.simulate)?;
    let topology = load_topology(&paths)?;
    let fleet = Fleet::new(&topology, port).context("fleet construction failed")?;

    let result = match cli.command {
        Commands::Status => status(&fleet, &paths),
        Commands::Pour {
            ingredient,
            volume_ml,
        } => pour(&fleet, &ingredient, volume_ml).await,
        Commands::Make { recipe_id, dose } => make(&fleet, &paths, &recipe_id, dose).await,
        Commands::Clean {
            mode,
            solution_pump,
        } => clean(&fleet, &paths, mode.into(), solution_pump).await,
        Commands::Calibrate {
            pump_id,
            expected_ml,
            measured_ml,
        } => calibrate(&fleet, &paths, pump_id, expected_ml, measured_ml),
    };

    fleet.shutdown().context("fleet shutdown failed")?;
    result
}

fn build_port(simulate: bool) -> Result<Arc<dyn GpioPort>> {
    if simulate {
        info!("using the simulated GPIO port");
        return Ok(Arc::new(SimulatedPort::new()));
    }
    real_port()
}

#[cfg(feature = "rppal")]
fn real_port() -> Result<Arc<dyn GpioPort>> {
    info!("using the Raspberry Pi GPIO port");
    Ok(Arc::new(gpio::RppalPort::new()?))
}

#[cfg(not(feature = "rppal"))]
fn real_port() -> Result<Arc<dyn GpioPort>> {
    bail!("built without the `rppal` feature; run with --simulate")
}

/// Loads the topology with the persisted calibration overlay applied,
/// writing the stock layout on first run.
fn load_topology(paths: &Paths) -> Result<HardwareTopology> {
    let mut topology = if paths.topology.exists() {
        HardwareTopology::load(&paths.topology)?
    } else {
        info!(path = %paths.topology.display(), "writing default topology");
        let topology = HardwareTopology::default_layout();
        topology.save(&paths.topology)?;
        topology
    };
    CalibrationOverlay::load(&paths.calibration)?.apply(&mut topology);
    Ok(topology)
}

fn load_recipes(paths: &Paths) -> Result<RecipeBook> {
    if paths.recipes.exists() {
        Ok(RecipeBook::load(&paths.recipes)?)
    } else {
        info!(path = %paths.recipes.display(), "writing default recipe book");
        let book = RecipeBook::default_book();
        book.save(&paths.recipes)?;
        Ok(book)
    }
}

fn cleaning_controller(
    fleet: &Arc<Fleet>,
    paths: &Paths,
    solution_pump: Option<u32>,
) -> Result<CleaningController> {
    let cycles = CycleLibrary::load(&paths.cycles)?;
    let log = MaintenanceLog::load(&paths.maintenance)?;
    let mut controller = CleaningController::new(Arc::clone(fleet))
        .with_cycles(cycles)
        .with_log(log, paths.maintenance.clone());
    if let Some(pump_id) = solution_pump {
        controller = controller.with_solution_pump(pump_id);
    }
    controller.set_progress_listener(progress_listener());
    Ok(controller)
}

fn progress_listener() -> ProgressListener {
    Arc::new(|event| match &event.message {
        Some(message) => info!(step = %event.step, percent = event.percent, %message),
        None => info!(step = %event.step, percent = event.percent),
    })
}

fn status(fleet: &Arc<Fleet>, paths: &Paths) -> Result<()> {
    let snapshot = fleet.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    let log = MaintenanceLog::load(&paths.maintenance)?;
    match log.recommendation(std::time::SystemTime::now()) {
        Some(mode) => println!("maintenance: {mode} clean recommended"),
        None => println!("maintenance: nothing due"),
    }
    Ok(())
}

async fn pour(fleet: &Arc<Fleet>, ingredient: &str, volume_ml: f64) -> Result<()> {
    tokio::select! {
        result = fleet.dispense_by_ingredient(ingredient, volume_ml) => {
            result?;
            info!(ingredient, volume_ml, "pour complete");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt: emergency stop");
            fleet.emergency_stop();
            bail!("pour aborted by operator");
        }
    }
}

async fn make(fleet: &Arc<Fleet>, paths: &Paths, recipe_id: &str, dose: f64) -> Result<()> {
    let book = load_recipes(paths)?;
    let recipe = book
        .get(recipe_id)
        .ok_or_else(|| anyhow!("unknown recipe {recipe_id:?}"))?;

    let executor = RecipeExecutor::new(Arc::clone(fleet));
    executor.set_progress_listener(progress_listener());

    tokio::select! {
        result = executor.execute(recipe, dose) => { result?; }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt: emergency stop");
            fleet.emergency_stop();
            bail!("recipe aborted by operator");
        }
    }

    // Auto-maintenance: never preempts a recipe, but runs right after one.
    let controller = cleaning_controller(fleet, paths, None)?;
    if let Some(mode) = controller.on_recipe_completed() {
        info!(%mode, "maintenance due, running clean");
        controller.run(mode, None).await?;
    }
    Ok(())
}

async fn clean(
    fleet: &Arc<Fleet>,
    paths: &Paths,
    mode: CleaningMode,
    solution_pump: Option<u32>,
) -> Result<()> {
    let controller = cleaning_controller(fleet, paths, solution_pump)?;
    tokio::select! {
        result = controller.run(mode, None) => {
            result?;
            info!(%mode, "cleaning complete");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt: emergency stop");
            fleet.emergency_stop();
            bail!("cleaning aborted by operator");
        }
    }
}

fn calibrate(
    fleet: &Arc<Fleet>,
    paths: &Paths,
    pump_id: u32,
    expected_ml: f64,
    measured_ml: f64,
) -> Result<()> {
    let factor = fleet.calibrate_pump(pump_id, expected_ml, measured_ml)?;
    let mut overlay = CalibrationOverlay::load(&paths.calibration)?;
    overlay.set(pump_id, factor);
    overlay.save(&paths.calibration)?;
    info!(pump_id, factor, "calibration stored");
    Ok(())
}
