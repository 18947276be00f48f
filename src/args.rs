//! Persisted argument records for the external stage programs.
//!
//! Every stage program is invoked with `--do_load_from_dir` and reads its
//! arguments back from a JSON record in the run directory, so the scheduler
//! writes these before any process launches.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Base training arguments, read from the experiment directory.
pub const BASE_ARGS_FILENAME: &str = "base_args.json";

/// Per-unit training arguments.
pub const ARGS_FILENAME: &str = "args.json";

/// Per-unit fine-tune arguments.
pub const FINE_TUNE_ARGS_FILENAME: &str = "fine_tune_args.json";

/// Per-unit evaluation arguments (written to both the run dir and the
/// fine-tune dir).
pub const EVAL_ARGS_FILENAME: &str = "eval_args.json";

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;
    Ok(())
}

/// Arguments for the training program.
///
/// The copy in the experiment directory is the base record; the scheduler
/// derives one per unit with `run_dir`/`ablate` filled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainArgs {
    /// Run directory; unset in the base record
    #[serde(default)]
    pub run_dir: Option<PathBuf>,

    /// Dataset location; must exist before scheduling starts
    pub dataset_dir: PathBuf,

    /// Training epochs; determines the final checkpoint marker name
    pub epochs: usize,

    /// Cross-validation rotation
    #[serde(default)]
    pub rotation: u32,

    /// Overwrite any partial artifacts from an earlier attempt
    #[serde(default)]
    pub do_overwrite: bool,

    /// Feature ablation this unit applies
    #[serde(default)]
    pub ablate: Option<String>,

    #[serde(default = "default_dataloader_workers")]
    pub num_dataloader_workers: usize,
}

impl TrainArgs {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

/// Arguments for the fine-tuning program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneArgs {
    pub run_dir: PathBuf,

    /// Task the model is fine-tuned on (the unit's setting)
    pub fine_tune_task: String,

    #[serde(default = "default_dataloader_workers")]
    pub num_dataloader_workers: usize,

    #[serde(default)]
    pub do_match_train_windows: bool,
}

impl FineTuneArgs {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

/// Arguments for the evaluation program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalArgs {
    pub run_dir: PathBuf,

    #[serde(default)]
    pub rotation: u32,

    #[serde(default)]
    pub do_save_all_reprs: bool,

    #[serde(default)]
    pub do_eval_train: bool,

    #[serde(default)]
    pub do_eval_tuning: bool,

    #[serde(default)]
    pub do_eval_test: bool,

    #[serde(default = "default_dataloader_workers")]
    pub num_dataloader_workers: usize,
}

impl EvalArgs {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        write_json(self, path)
    }
}

fn default_dataloader_workers() -> usize {
    8
}
