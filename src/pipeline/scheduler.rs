//! Sweep coordination: plan discovery, device pool, fork-join over units.
//!
//! The scheduler makes a single pass: enumerate units, skip the ones whose
//! completion markers already exist, launch one concurrent worker per pending
//! unit, and join them all. There is no retry logic at this level — a failed
//! unit is simply left incomplete for the next invocation to pick up.

use crate::args::{TrainArgs, BASE_ARGS_FILENAME};
use crate::config::{DispatchMode, SweepConfig};
use crate::device::DevicePool;
use crate::pipeline::executor::{PipelineExecutor, UnitOutcome};
use crate::pipeline::timing::{SweepReport, UnitReport, RESULTS_FILENAME};
use crate::unit::{SweepPlan, WorkUnit};
use anyhow::Result;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;

/// Resolved configuration snapshot, written next to the run directories.
pub const CONFIG_SNAPSHOT_FILENAME: &str = "sweep_resolved.yaml";

/// Coordinator for one sweep invocation.
pub struct Scheduler {
    config: Arc<SweepConfig>,
    exp_dir: PathBuf,
}

impl Scheduler {
    pub fn new(config: Arc<SweepConfig>, exp_dir: PathBuf) -> Self {
        Self { config, exp_dir }
    }

    /// Run the sweep to its terminal state: every unit skipped, executed (to
    /// success or logged failure), or submitted.
    pub async fn run(&self) -> Result<SweepStats> {
        let mut base_args = TrainArgs::from_json_file(&self.exp_dir.join(BASE_ARGS_FILENAME))?;
        if !base_args.dataset_dir.is_dir() {
            anyhow::bail!(
                "dataset dir {} does not exist",
                base_args.dataset_dir.display()
            );
        }
        base_args.rotation = self.config.rotation;

        let plan = SweepPlan::discover(&self.exp_dir, &self.config, base_args.epochs)?;
        tracing::info!(
            "Scheduling {} units: {} pending, {} already complete",
            plan.total(),
            plan.pending.len(),
            plan.skipped.len()
        );

        let snapshot_path = self
            .exp_dir
            .join(self.config.rotation.to_string())
            .join(CONFIG_SNAPSHOT_FILENAME);
        std::fs::write(&snapshot_path, self.config.to_yaml()?)?;

        let mut stats = SweepStats {
            total_units: plan.total(),
            units_skipped: plan.skipped.len(),
            ..Default::default()
        };

        if plan.pending.is_empty() {
            return Ok(stats);
        }

        for unit in &plan.pending {
            unit.prepare(&base_args)?;
        }

        match self.config.dispatch {
            DispatchMode::Batch => self.submit_all(plan.pending, &mut stats),
            DispatchMode::Direct => {
                let pool = DevicePool::new(
                    &self.config.pool.devices,
                    self.config.pool.units_per_device,
                );
                tracing::info!("Loaded {} device slots into the pool", pool.capacity());
                self.run_units(plan.pending, pool, &mut stats).await?;
            }
        }

        Ok(stats)
    }

    /// Batch mode: write one submission script per unit and stop. The external
    /// scheduler owns device assignment and completion, so there is no result
    /// aggregation here.
    fn submit_all(&self, units: Vec<WorkUnit>, stats: &mut SweepStats) {
        for unit in units {
            let executor = PipelineExecutor::new(unit, self.config.clone());
            match executor.submit() {
                UnitOutcome::Submitted => stats.units_submitted += 1,
                _ => stats.units_failed += 1,
            }
        }
    }

    /// Direct mode: one concurrent worker per unit, joined as a single
    /// barrier. Workers acquire their own reservations, so launch order
    /// carries no ordering guarantee between units.
    async fn run_units(
        &self,
        units: Vec<WorkUnit>,
        pool: Arc<DevicePool>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        let acquire_timeout = self.config.execution.acquire_timeout();
        let backoff = self.config.execution.contention_backoff();

        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let pool = pool.clone();
            let config = self.config.clone();
            let devices_required = unit.devices_required;
            handles.push(tokio::spawn(async move {
                let executor = PipelineExecutor::new(unit, config);
                let reservation = pool
                    .reserve(devices_required, acquire_timeout, backoff)
                    .await;
                let task_setting = executor.unit().task_setting.clone();
                let outcome = executor.run(reservation).await;
                (task_setting, outcome)
            }));
        }

        let mut report = SweepReport::default();
        for joined in join_all(handles).await {
            match joined {
                Ok((task_setting, outcome)) => {
                    let (outcome_str, error, stages) = match outcome {
                        UnitOutcome::Ran(stages) => {
                            stats.units_run += 1;
                            ("ran", None, stages)
                        }
                        UnitOutcome::Failed(error) => {
                            stats.units_failed += 1;
                            ("failed", Some(error), Vec::new())
                        }
                        UnitOutcome::Submitted => {
                            stats.units_submitted += 1;
                            ("submitted", None, Vec::new())
                        }
                    };
                    report.units.push(UnitReport {
                        task_setting,
                        outcome: outcome_str.to_string(),
                        error,
                        stages,
                    });
                }
                Err(e) => {
                    tracing::error!("unit worker panicked: {}", e);
                    stats.units_failed += 1;
                }
            }
        }

        report.save_to_file(&self.exp_dir.join(RESULTS_FILENAME))?;
        Ok(())
    }
}

/// Statistics from one scheduler pass.
#[derive(Debug, Default)]
pub struct SweepStats {
    /// Units enumerated from configuration
    pub total_units: usize,

    /// Units skipped because their completion markers already existed
    pub units_skipped: usize,

    /// Units whose pipeline was executed to the end
    pub units_run: usize,

    /// Units that failed to execute
    pub units_failed: usize,

    /// Units handed to the external batch scheduler
    pub units_submitted: usize,
}

impl std::fmt::Display for SweepStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run: {}, Failed: {}, Submitted: {}, Skipped: {}, Total: {}",
            self.units_run,
            self.units_failed,
            self.units_submitted,
            self.units_skipped,
            self.total_units
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BATCH_SCRIPT_FILENAME;
    use crate::config::{PoolConfig, ProgramConfig};
    use crate::unit::TASK_WEIGHTS_FILENAME;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn write_script(scripts_dir: &Path, name: &str, body: &str) {
        let script = format!("RUN_DIR=\"${{1#--run_dir=}}\"\n{body}\n");
        std::fs::write(scripts_dir.join(name), script).unwrap();
    }

    /// Stage stubs where `train.sh` produces both completion markers (for one
    /// epoch) and the other stages are no-ops.
    fn write_completing_scripts(scripts_dir: &Path) {
        write_script(
            scripts_dir,
            "train.sh",
            "touch \"$RUN_DIR/task_weights.pkl\"\ntouch \"$RUN_DIR/model.epoch-0\"",
        );
        write_script(scripts_dir, "eval.sh", ":");
        write_script(scripts_dir, "fine_tune.sh", ":");
    }

    fn write_base_args(exp_dir: &Path, dataset_dir: &Path) {
        let base = TrainArgs {
            run_dir: None,
            dataset_dir: dataset_dir.to_path_buf(),
            epochs: 1,
            rotation: 0,
            do_overwrite: false,
            ablate: None,
            num_dataloader_workers: 2,
        };
        base.to_json_file(&exp_dir.join(BASE_ARGS_FILENAME)).unwrap();
    }

    fn test_config(scripts_dir: &Path, devices: Vec<u32>, settings: &[&str]) -> SweepConfig {
        let mut config = SweepConfig::sample();
        config.pool = PoolConfig {
            devices,
            devices_per_unit: 1,
            units_per_device: 1,
        };
        config.task_settings = settings.iter().map(|s| s.to_string()).collect();
        config.programs = ProgramConfig {
            python: PathBuf::from("/bin/sh"),
            scripts_dir: scripts_dir.to_path_buf(),
            train_script: "train.sh".to_string(),
            eval_script: "eval.sh".to_string(),
            fine_tune_script: "fine_tune.sh".to_string(),
        };
        config.execution.acquire_timeout_secs = 1;
        config.execution.contention_backoff_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_two_units_share_pool_and_complete() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_completing_scripts(scripts.path());
        write_base_args(exp.path(), scripts.path());

        let config = test_config(
            scripts.path(),
            vec![0, 1, 2, 3],
            &["task one", "task two"],
        );
        let scheduler = Scheduler::new(Arc::new(config), exp.path().to_path_buf());
        let stats = scheduler.run().await.unwrap();

        assert_eq!(stats.total_units, 2);
        assert_eq!(stats.units_run, 2);
        assert_eq!(stats.units_failed, 0);
        assert_eq!(stats.units_skipped, 0);

        for name in ["task_one", "task_two"] {
            let run_dir = exp.path().join("0").join(name);
            assert!(run_dir.join(TASK_WEIGHTS_FILENAME).is_file());
            assert!(run_dir.join("model.epoch-0").is_file());
        }
        assert!(exp.path().join(RESULTS_FILENAME).is_file());
    }

    #[tokio::test]
    async fn test_pool_drains_back_after_run() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_completing_scripts(scripts.path());
        write_base_args(exp.path(), scripts.path());

        let config = test_config(
            scripts.path(),
            vec![0, 1, 2, 3],
            &["task one", "task two"],
        );
        let config = Arc::new(config);
        let scheduler = Scheduler::new(config.clone(), exp.path().to_path_buf());

        let mut base_args = TrainArgs::from_json_file(&exp.path().join(BASE_ARGS_FILENAME)).unwrap();
        base_args.rotation = 0;
        let plan = SweepPlan::discover(exp.path(), &config, base_args.epochs).unwrap();
        for unit in &plan.pending {
            unit.prepare(&base_args).unwrap();
        }

        let pool = DevicePool::new(&config.pool.devices, config.pool.units_per_device);
        let mut stats = SweepStats::default();
        scheduler
            .run_units(plan.pending, pool.clone(), &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.units_run, 2);
        assert_eq!(pool.idle(), 4);
    }

    #[tokio::test]
    async fn test_units_run_concurrently() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_script(
            scripts.path(),
            "train.sh",
            "sleep 0.5\ntouch \"$RUN_DIR/task_weights.pkl\"\ntouch \"$RUN_DIR/model.epoch-0\"",
        );
        write_base_args(exp.path(), scripts.path());

        let mut config = test_config(scripts.path(), vec![0, 1], &["task one", "task two"]);
        config.stages.eval = false;
        config.stages.fine_tune = false;
        config.stages.fine_tune_eval = false;

        let scheduler = Scheduler::new(Arc::new(config), exp.path().to_path_buf());
        let start = Instant::now();
        let stats = scheduler.run().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(stats.units_run, 2);
        // Two 0.5s trainings in parallel finish well under the 1s a serial
        // schedule would need.
        assert!(
            elapsed < Duration::from_millis(900),
            "units did not overlap: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_second_pass_skips_everything() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_completing_scripts(scripts.path());
        write_base_args(exp.path(), scripts.path());

        let config = test_config(scripts.path(), vec![0], &["task one", "task two"]);
        let config = Arc::new(config);

        let first = Scheduler::new(config.clone(), exp.path().to_path_buf())
            .run()
            .await
            .unwrap();
        assert_eq!(first.units_run, 2);

        let second = Scheduler::new(config, exp.path().to_path_buf())
            .run()
            .await
            .unwrap();
        assert_eq!(second.units_run, 0);
        assert_eq!(second.units_skipped, 2);
    }

    #[tokio::test]
    async fn test_failing_unit_does_not_block_siblings() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_script(
            scripts.path(),
            "train.sh",
            // One unit's training dies; the other completes.
            "case \"$RUN_DIR\" in\n*bad*) exit 1 ;;\n*) touch \"$RUN_DIR/task_weights.pkl\"; touch \"$RUN_DIR/model.epoch-0\" ;;\nesac",
        );
        write_script(scripts.path(), "eval.sh", ":");
        write_script(scripts.path(), "fine_tune.sh", ":");
        write_base_args(exp.path(), scripts.path());

        let config = test_config(scripts.path(), vec![0, 1], &["bad task", "good task"]);
        let scheduler = Scheduler::new(Arc::new(config), exp.path().to_path_buf());
        let stats = scheduler.run().await.unwrap();

        // Both units ran to the end of their pipelines; the bad one just has
        // no completion markers.
        assert_eq!(stats.units_run, 2);
        let good = exp.path().join("0").join("good_task");
        let bad = exp.path().join("0").join("bad_task");
        assert!(good.join(TASK_WEIGHTS_FILENAME).is_file());
        assert!(!bad.join(TASK_WEIGHTS_FILENAME).exists());

        // The incomplete unit is re-attempted on the next pass.
        let config2 = test_config(scripts.path(), vec![0, 1], &["bad task", "good task"]);
        let second = Scheduler::new(Arc::new(config2), exp.path().to_path_buf())
            .run()
            .await
            .unwrap();
        assert_eq!(second.units_skipped, 1);
        assert_eq!(second.units_run, 1);
    }

    #[tokio::test]
    async fn test_missing_dataset_fails_before_scheduling() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_completing_scripts(scripts.path());
        write_base_args(exp.path(), Path::new("/nonexistent/dataset"));

        let config = test_config(scripts.path(), vec![0], &["task one"]);
        let scheduler = Scheduler::new(Arc::new(config), exp.path().to_path_buf());
        let err = scheduler.run().await.unwrap_err();

        assert!(err.to_string().contains("dataset dir"));
        // Nothing was scheduled: no run directory was created.
        assert!(!exp.path().join("0").join("task_one").exists());
    }

    #[tokio::test]
    async fn test_batch_mode_writes_scripts_and_submits_nothing() {
        let exp = TempDir::new().unwrap();
        let scripts = TempDir::new().unwrap();
        write_completing_scripts(scripts.path());
        write_base_args(exp.path(), scripts.path());

        let mut config = test_config(scripts.path(), vec![0], &["task one", "task two"]);
        config.dispatch = DispatchMode::Batch;

        let scheduler = Scheduler::new(Arc::new(config), exp.path().to_path_buf());
        let stats = scheduler.run().await.unwrap();

        assert_eq!(stats.units_submitted, 2);
        assert_eq!(stats.units_run, 0);
        for name in ["task_one", "task_two"] {
            assert!(exp
                .path()
                .join("0")
                .join(name)
                .join(BATCH_SCRIPT_FILENAME)
                .is_file());
        }
        // Batch mode skips result aggregation.
        assert!(!exp.path().join(RESULTS_FILENAME).exists());
    }

    #[test]
    fn test_sweep_stats_display() {
        let stats = SweepStats {
            total_units: 5,
            units_skipped: 2,
            units_run: 2,
            units_failed: 1,
            units_submitted: 0,
        };
        let display = format!("{}", stats);
        assert!(display.contains("Run: 2"));
        assert!(display.contains("Failed: 1"));
        assert!(display.contains("Total: 5"));
    }
}
