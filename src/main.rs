//! Ablation Sweep CLI
//!
//! Schedules ablation experiment runs across a fixed device pool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ablation_sweep::args::{TrainArgs, BASE_ARGS_FILENAME};
use ablation_sweep::{build_runtime, run_sweep, DispatchMode, SweepConfig, SweepPlan};

#[derive(Parser)]
#[command(name = "ablation-sweep")]
#[command(about = "Schedule ablation experiment runs across a device pool", long_about = None)]
struct Cli {
    /// Experiment directory holding the sweep config and base arguments
    #[arg(short, long, default_value = ".", global = true)]
    exp_dir: PathBuf,

    /// Path to configuration file (default: sweep.yaml / sweep.json in the
    /// experiment directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sweep (default if no command specified)
    Run {
        /// Emit batch-submission scripts instead of executing directly
        #[arg(long)]
        batch: bool,
    },

    /// List pending and completed units without executing anything
    Plan,

    /// Validate configuration and base arguments
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "sweep.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => {
            run_command(cli.exp_dir, cli.config, false)?;
        }

        Some(Commands::Run { batch }) => {
            run_command(cli.exp_dir, cli.config, batch)?;
        }

        Some(Commands::Plan) => {
            plan_command(cli.exp_dir, cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.exp_dir, cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(exp_dir: &Path, config_path: Option<PathBuf>) -> Result<SweepConfig> {
    match config_path {
        Some(path) => SweepConfig::from_file(&path),
        None => SweepConfig::from_exp_dir(exp_dir),
    }
}

fn run_command(exp_dir: PathBuf, config_path: Option<PathBuf>, batch: bool) -> Result<()> {
    let mut config = load_config(&exp_dir, config_path)?;

    // Apply overrides
    if batch {
        config.dispatch = DispatchMode::Batch;
    }

    config.validate()?;

    let runtime = build_runtime(config.execution.worker_threads)?;
    let stats = runtime.block_on(async { run_sweep(exp_dir, config).await })?;

    println!("{stats}");

    Ok(())
}

fn plan_command(exp_dir: PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(&exp_dir, config_path)?;
    config.validate()?;

    let base_args = TrainArgs::from_json_file(&exp_dir.join(BASE_ARGS_FILENAME))?;
    let plan = SweepPlan::discover(&exp_dir, &config, base_args.epochs)?;

    println!("\n=== Sweep Plan ===");
    println!(
        "Device slots: {} ({} devices x {} units/device)",
        config.pool.devices.len() * config.pool.units_per_device,
        config.pool.devices.len(),
        config.pool.units_per_device
    );
    println!("Devices per unit: {}", config.pool.devices_per_unit);
    println!("Rotation: {}", config.rotation);

    println!("\nComplete ({}):", plan.skipped.len());
    for name in &plan.skipped {
        println!("  {name}");
    }

    println!("\nPending ({}):", plan.pending.len());
    for unit in &plan.pending {
        println!("  {} -> {}", unit.name, unit.run_dir.display());
    }
    println!("==================\n");

    Ok(())
}

fn validate_command(exp_dir: PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(&exp_dir, config_path)?;
    config.validate()?;

    let base_args = TrainArgs::from_json_file(&exp_dir.join(BASE_ARGS_FILENAME))?;
    if !base_args.dataset_dir.is_dir() {
        anyhow::bail!(
            "dataset dir {} does not exist",
            base_args.dataset_dir.display()
        );
    }

    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Ablation sweep configuration

# === POOL: devices available to the sweep ===
pool:
  # Device ids to schedule on (e.g. CUDA device indices)
  devices: [0, 1, 2, 3]

  # Devices reserved by each unit; >1 requires units_per_device = 1
  devices_per_unit: 1

  # Concurrent units sharing one device
  units_per_device: 1

# === TASK SETTINGS: one work unit per entry ===
task_settings:
  - "no notes"
  - "no labs"
  - "structured only"

# Cross-validation rotation this sweep runs
rotation: 0

# === STAGES: pipeline stages to run for every unit ===
stages:
  train: true
  eval: true
  fine_tune: true
  fine_tune_eval: true

# === PROGRAMS: external stage executables ===
programs:
  # Interpreter the stage scripts run under
  python: "python"

  # Working directory the stage scripts expect
  scripts_dir: "Scripts/End to End"

  train_script: "run_model.py"
  eval_script: "evaluate.py"
  fine_tune_script: "fine_tune_task.py"

# === EXECUTION: direct-dispatch tuning ===
execution:
  # Seconds a worker waits for one device before treating the pool as busy
  acquire_timeout_secs: 30

  # Seconds a worker backs off after returning a partial reservation
  contention_backoff_secs: 90

  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8

# === DISPATCH: "direct" runs units in-process; "batch" emits submission
# scripts for an external cluster scheduler ===
dispatch: direct

# === BATCH: resource request for batch-submission mode ===
batch:
  # Partition to submit to; "cpu" drops the GPU resource request
  partition: "gpu"
  cpus: 12
  mem_gb: 48

  # Extra sbatch directives, written as `#SBATCH --<arg>`
  extra_args: []
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
