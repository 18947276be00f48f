//! Work units: one pipeline instance per ablation/task setting.
//!
//! A unit is discovered from configuration, immutable once built, and skipped
//! entirely when its completion markers already exist — the sole resumption
//! mechanism. Exit codes are never consulted for completion, so a crashed but
//! partially-successful run is retried on the next invocation.

use crate::args::{
    EvalArgs, FineTuneArgs, TrainArgs, ARGS_FILENAME, EVAL_ARGS_FILENAME, FINE_TUNE_ARGS_FILENAME,
};
use crate::config::SweepConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Serialized task-head weights, written by the training program.
pub const TASK_WEIGHTS_FILENAME: &str = "task_weights.pkl";

/// Checkpoint filename for the final training epoch.
pub fn final_checkpoint_filename(epochs: usize) -> String {
    format!("model.epoch-{}", epochs.saturating_sub(1))
}

/// One stage of the per-unit pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Train,
    Eval,
    FineTune,
    FineTuneEval,
}

impl StageKind {
    /// Fixed pipeline order.
    pub const ORDER: [StageKind; 4] = [
        StageKind::Train,
        StageKind::Eval,
        StageKind::FineTune,
        StageKind::FineTuneEval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Train => "train",
            StageKind::Eval => "eval",
            StageKind::FineTune => "fine_tune",
            StageKind::FineTuneEval => "fine_tune_eval",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipeline stages a sweep runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageFlags {
    #[serde(default = "default_true")]
    pub train: bool,

    #[serde(default = "default_true")]
    pub eval: bool,

    #[serde(default = "default_true")]
    pub fine_tune: bool,

    #[serde(default = "default_true")]
    pub fine_tune_eval: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            train: true,
            eval: true,
            fine_tune: true,
            fine_tune_eval: true,
        }
    }
}

impl StageFlags {
    /// At least one stage is enabled.
    pub fn any(&self) -> bool {
        self.train || self.eval || self.fine_tune || self.fine_tune_eval
    }

    pub fn is_enabled(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::Train => self.train,
            StageKind::Eval => self.eval,
            StageKind::FineTune => self.fine_tune,
            StageKind::FineTuneEval => self.fine_tune_eval,
        }
    }

    /// Enabled stages in pipeline order.
    pub fn enabled(&self) -> Vec<StageKind> {
        StageKind::ORDER
            .iter()
            .copied()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }
}

fn default_true() -> bool {
    true
}

/// Directory-safe name for a task setting.
pub fn task_setting_dirname(setting: &str) -> String {
    setting.replace(' ', "_")
}

/// Immutable description of one pipeline instance.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Task setting as configured (may contain spaces)
    pub task_setting: String,

    /// Directory-safe name
    pub name: String,

    /// Directory holding the unit's args, captures, and training artifacts
    pub run_dir: PathBuf,

    /// Nested directory the fine-tune-eval stage targets
    pub fine_tune_dir: PathBuf,

    /// Stages to run for this unit
    pub stages: StageFlags,

    /// Devices the unit reserves for its whole lifetime
    pub devices_required: usize,

    /// Completion markers: the unit is done iff all of these exist
    pub expected_artifacts: Vec<PathBuf>,
}

impl WorkUnit {
    /// Whether every completion marker is present.
    pub fn is_complete(&self) -> bool {
        self.expected_artifacts.iter().all(|path| path.is_file())
    }

    /// Persist the derived argument records the stage programs consume.
    ///
    /// The stage programs are invoked with `--do_load_from_dir`, so everything
    /// they need must be on disk before the first stage launches.
    pub fn prepare(&self, base_args: &TrainArgs) -> Result<()> {
        let mut train = base_args.clone();
        train.run_dir = Some(self.run_dir.clone());
        train.ablate = Some(self.task_setting.clone());
        train.do_overwrite = true;
        train.to_json_file(&self.run_dir.join(ARGS_FILENAME))?;

        let fine_tune = FineTuneArgs {
            run_dir: self.run_dir.clone(),
            fine_tune_task: self.task_setting.clone(),
            num_dataloader_workers: base_args.num_dataloader_workers,
            do_match_train_windows: true,
        };
        fine_tune.to_json_file(&self.run_dir.join(FINE_TUNE_ARGS_FILENAME))?;

        let eval = EvalArgs {
            run_dir: self.run_dir.clone(),
            rotation: base_args.rotation,
            do_save_all_reprs: true,
            do_eval_train: true,
            do_eval_tuning: true,
            do_eval_test: true,
            num_dataloader_workers: base_args.num_dataloader_workers,
        };
        eval.to_json_file(&self.run_dir.join(EVAL_ARGS_FILENAME))?;

        // The fine-tuned model is only scored on tuning/test splits.
        let fine_tune_eval = EvalArgs {
            run_dir: self.fine_tune_dir.clone(),
            rotation: base_args.rotation,
            do_save_all_reprs: false,
            do_eval_train: false,
            do_eval_tuning: true,
            do_eval_test: true,
            num_dataloader_workers: base_args.num_dataloader_workers,
        };
        fine_tune_eval.to_json_file(&self.fine_tune_dir.join(EVAL_ARGS_FILENAME))?;

        Ok(())
    }
}

/// The scheduling pass's view of the sweep: which units still need to run.
#[derive(Debug)]
pub struct SweepPlan {
    /// Units with missing completion markers, in configuration order
    pub pending: Vec<WorkUnit>,

    /// Names of units whose markers all exist already
    pub skipped: Vec<String>,
}

impl SweepPlan {
    /// Enumerate the configured task settings and classify each as pending or
    /// already complete. Creates run directories but writes no files; argument
    /// records are persisted by [`WorkUnit::prepare`] at execution time.
    pub fn discover(exp_dir: &Path, config: &SweepConfig, epochs: usize) -> Result<Self> {
        let base_dir = exp_dir.join(config.rotation.to_string());
        std::fs::create_dir_all(&base_dir)?;

        let mut pending = Vec::new();
        let mut skipped = Vec::new();

        for setting in &config.task_settings {
            let name = task_setting_dirname(setting);
            let run_dir = base_dir.join(&name);
            std::fs::create_dir_all(&run_dir)?;

            let expected_artifacts = vec![
                run_dir.join(TASK_WEIGHTS_FILENAME),
                run_dir.join(final_checkpoint_filename(epochs)),
            ];

            let unit = WorkUnit {
                task_setting: setting.clone(),
                name: name.clone(),
                fine_tune_dir: run_dir.join(&name),
                run_dir,
                stages: config.stages,
                devices_required: config.pool.devices_per_unit,
                expected_artifacts,
            };

            if unit.is_complete() {
                tracing::debug!("{} already complete, skipping", unit.name);
                skipped.push(unit.name);
            } else {
                std::fs::create_dir_all(&unit.fine_tune_dir)?;
                pending.push(unit);
            }
        }

        Ok(Self { pending, skipped })
    }

    pub fn total(&self) -> usize {
        self.pending.len() + self.skipped.len()
    }
}
