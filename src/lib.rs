//! Ablation Sweep Scheduler
//!
//! Schedules a grid of experiment runs ("ablation settings") across a fixed
//! pool of compute devices, running each through a fixed pipeline:
//! train → evaluate → fine-tune → evaluate-fine-tuned.
//!
//! # Architecture
//!
//! - **Device pool**: a bounded multiset of device tokens with blocking
//!   acquire and scoped reservations that release on drop
//! - **Work units**: one per task setting, skipped whenever their completion
//!   markers already exist (idempotent resumption)
//! - **Pipeline**: stages run as sequential child processes within a unit,
//!   fully parallel across units subject to device availability
//! - **Dispatch**: direct in-process execution, or batch-script emission for
//!   an external cluster scheduler
//!
//! # Usage
//!
//! ```no_run
//! use ablation_sweep::{run_sweep, SweepConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let exp_dir = std::path::PathBuf::from("experiments/sweep-01");
//!     let config = SweepConfig::from_exp_dir(&exp_dir)?;
//!     run_sweep(exp_dir, config).await?;
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod batch;
pub mod config;
pub mod device;
pub mod pipeline;
pub mod unit;

pub use config::{DispatchMode, SweepConfig};
pub use device::{DevicePool, DeviceToken, Reservation};
pub use pipeline::{PipelineExecutor, Scheduler, SweepStats, UnitOutcome};
pub use unit::{StageFlags, StageKind, SweepPlan, WorkUnit};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Run the full sweep for one experiment directory.
pub async fn run_sweep(exp_dir: PathBuf, config: SweepConfig) -> Result<SweepStats> {
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!("Starting ablation sweep in {}", exp_dir.display());

    let scheduler = Scheduler::new(config, exp_dir);
    let stats = scheduler.run().await?;

    tracing::info!("Sweep complete: {}", stats);

    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
