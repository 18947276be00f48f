//! Per-unit pipeline execution.
//!
//! One executor runs one work unit's enabled stages as sequential child
//! processes, scoped to the unit's device reservation via
//! `CUDA_VISIBLE_DEVICES`. Stage programs are opaque: the contract is exit
//! code plus artifacts on disk, and completion is judged from the artifacts
//! alone. Stages within a unit are strictly sequential; units run fully
//! parallel to each other subject to device availability.

use crate::batch;
use crate::config::SweepConfig;
use crate::device::Reservation;
use crate::pipeline::timing::{StageResult, TimingRecord, TIMINGS_FILENAME};
use crate::unit::{StageKind, WorkUnit};
use anyhow::Result;
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

/// Captured stdout of every stage, appended in order.
pub const STDOUT_FILENAME: &str = "stdout.txt";

/// Captured stderr of every stage, appended in order.
pub const STDERR_FILENAME: &str = "stderr.txt";

/// Terminal state of one work unit.
#[derive(Debug)]
pub enum UnitOutcome {
    /// Every enabled stage was launched and awaited; per-stage exit codes are
    /// in the results.
    Ran(Vec<StageResult>),

    /// A stage could not be executed or bookkeeping failed. The unit keeps no
    /// completion marker, so the next scheduling pass retries it.
    Failed(String),

    /// Batch mode: a submission script was written and the external scheduler
    /// owns the rest.
    Submitted,
}

/// Runs the four-stage pipeline for a single work unit.
pub struct PipelineExecutor {
    unit: WorkUnit,
    config: Arc<SweepConfig>,
}

impl PipelineExecutor {
    pub fn new(unit: WorkUnit, config: Arc<SweepConfig>) -> Self {
        Self { unit, config }
    }

    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    /// Run every enabled stage in order, consuming the reservation.
    ///
    /// Errors never escape the worker boundary: a unit that cannot run is
    /// logged and reported as failed so sibling units continue. The
    /// reservation drops on every path, returning its devices to the pool.
    pub async fn run(&self, reservation: Reservation) -> UnitOutcome {
        tracing::info!(
            "Running {} on devices {}",
            self.unit.name,
            reservation.visible_devices()
        );

        let outcome = match self.run_stages(&reservation).await {
            Ok(results) => UnitOutcome::Ran(results),
            Err(e) => {
                tracing::error!("run dir {} failed: {:#}", self.unit.run_dir.display(), e);
                UnitOutcome::Failed(format!("{e:#}"))
            }
        };
        drop(reservation);
        outcome
    }

    /// Batch mode: write the unit's submission script instead of executing.
    ///
    /// Does not block on completion and touches no device reservation — the
    /// external scheduler owns device assignment in this mode.
    pub fn submit(&self) -> UnitOutcome {
        match batch::write_batch_script(&self.unit, &self.config.batch, &self.config.programs) {
            Ok(path) => {
                tracing::info!("sbatch {}", path.display());
                UnitOutcome::Submitted
            }
            Err(e) => {
                tracing::error!("run dir {} failed: {:#}", self.unit.run_dir.display(), e);
                UnitOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    async fn run_stages(&self, reservation: &Reservation) -> Result<Vec<StageResult>> {
        let stdout = File::create(self.unit.run_dir.join(STDOUT_FILENAME))?;
        let stderr = File::create(self.unit.run_dir.join(STDERR_FILENAME))?;

        let started = Instant::now();
        let mut timings = TimingRecord::default();
        let mut results = Vec::new();

        for stage in self.unit.stages.enabled() {
            // The fine-tuned model is evaluated out of the nested fine-tune
            // directory; every other stage targets the run directory.
            let run_dir = match stage {
                StageKind::FineTuneEval => &self.unit.fine_tune_dir,
                _ => &self.unit.run_dir,
            };

            let result = self
                .run_stage(stage, run_dir, reservation, &stdout, &stderr)
                .await?;
            timings.record(stage, result.elapsed);
            results.push(result);
        }

        timings.total = started.elapsed().as_secs_f64();
        timings.save_to_file(&self.unit.run_dir.join(TIMINGS_FILENAME))?;

        Ok(results)
    }

    async fn run_stage(
        &self,
        stage: StageKind,
        run_dir: &Path,
        reservation: &Reservation,
        stdout: &File,
        stderr: &File,
    ) -> Result<StageResult> {
        let programs = &self.config.programs;

        let start = Instant::now();
        let status = Command::new(&programs.python)
            .arg(programs.script_for(stage))
            .arg(format!("--run_dir={}", run_dir.display()))
            .arg("--do_load_from_dir")
            .current_dir(&programs.scripts_dir)
            .env("CUDA_VISIBLE_DEVICES", reservation.visible_devices())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?))
            .status()
            .await?;
        let elapsed = start.elapsed();

        if !status.success() {
            tracing::warn!("stage {} for {} exited with {}", stage, self.unit.name, status);
        }

        Ok(StageResult {
            stage,
            elapsed,
            exit_code: status.code(),
            success: status.success(),
        })
    }
}
