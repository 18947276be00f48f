//! Configuration for the ablation sweep scheduler.

use crate::unit::StageFlags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for one sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Device pool configuration
    pub pool: PoolConfig,

    /// Task settings to sweep; one work unit per entry
    pub task_settings: Vec<String>,

    /// Cross-validation rotation this sweep runs
    #[serde(default)]
    pub rotation: u32,

    /// Pipeline stages to run for every unit
    #[serde(default)]
    pub stages: StageFlags,

    /// External stage programs
    pub programs: ProgramConfig,

    /// Execution tuning
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// How units are dispatched
    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Resource request for batch-submission mode
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Device pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Device ids to schedule on (e.g. CUDA device indices)
    pub devices: Vec<u32>,

    /// Devices reserved by each unit
    #[serde(default = "default_one")]
    pub devices_per_unit: usize,

    /// Concurrent units sharing one device
    #[serde(default = "default_one")]
    pub units_per_device: usize,
}

/// Locations of the external stage programs.
///
/// Injected into the executor at construction; nothing is read from the
/// process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Interpreter the stage scripts run under
    #[serde(default = "default_python")]
    pub python: PathBuf,

    /// Working directory the stage scripts expect
    pub scripts_dir: PathBuf,

    #[serde(default = "default_train_script")]
    pub train_script: String,

    #[serde(default = "default_eval_script")]
    pub eval_script: String,

    #[serde(default = "default_fine_tune_script")]
    pub fine_tune_script: String,
}

impl ProgramConfig {
    /// Script a pipeline stage invokes. The fine-tune-eval stage reuses the
    /// evaluation program against the fine-tune directory.
    pub fn script_for(&self, stage: crate::unit::StageKind) -> &str {
        use crate::unit::StageKind;
        match stage {
            StageKind::Train => &self.train_script,
            StageKind::Eval | StageKind::FineTuneEval => &self.eval_script,
            StageKind::FineTune => &self.fine_tune_script,
        }
    }
}

/// Execution tuning for direct dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds a worker waits for a single device before treating the pool as
    /// busy
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Seconds a worker backs off after returning a partial reservation
    #[serde(default = "default_contention_backoff")]
    pub contention_backoff_secs: u64,

    /// Tokio worker threads (None = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl ExecutionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn contention_backoff(&self) -> Duration {
        Duration::from_secs(self.contention_backoff_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 30,
            contention_backoff_secs: 90,
            worker_threads: None,
        }
    }
}

/// Dispatch strategy. The two modes share the work-unit model but not code:
/// direct execution owns device reservations, batch submission hands them to
/// the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Direct,
    Batch,
}

/// Resource request for batch-submission mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Partition to submit to; "cpu" drops the GPU resource request
    #[serde(default = "default_partition")]
    pub partition: String,

    /// CPU cores per job
    #[serde(default = "default_batch_cpus")]
    pub cpus: u32,

    /// Memory per job in GB
    #[serde(default = "default_batch_mem_gb")]
    pub mem_gb: u32,

    /// Extra sbatch directives, written as `#SBATCH --<arg>`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            partition: "gpu".to_string(),
            cpus: 12,
            mem_gb: 48,
            extra_args: Vec::new(),
        }
    }
}

impl SweepConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: SweepConfig = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load the sweep config from its conventional location inside the
    /// experiment directory: `sweep.yaml`, falling back to `sweep.json`.
    pub fn from_exp_dir(exp_dir: &Path) -> anyhow::Result<Self> {
        for name in ["sweep.yaml", "sweep.yml", "sweep.json"] {
            let path = exp_dir.join(name);
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        anyhow::bail!("no sweep.yaml or sweep.json found in {}", exp_dir.display())
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration. Every check here is fatal before any unit
    /// starts; nothing is partially executed on a bad config.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.task_settings.is_empty() {
            anyhow::bail!("No task settings configured");
        }
        if self.pool.devices.is_empty() {
            anyhow::bail!("Device list must not be empty");
        }
        if self.pool.devices_per_unit == 0 {
            anyhow::bail!("devices_per_unit must be > 0");
        }
        if self.pool.units_per_device == 0 {
            anyhow::bail!("units_per_device must be > 0");
        }
        if self.pool.devices.len() < self.pool.devices_per_unit {
            anyhow::bail!(
                "A unit requires {} devices but the pool only has {}",
                self.pool.devices_per_unit,
                self.pool.devices.len()
            );
        }
        // A reservation must span distinct whole devices; fractional packing
        // of multi-device units is unsupported.
        if self.pool.devices_per_unit > 1 && self.pool.units_per_device != 1 {
            anyhow::bail!("devices_per_unit > 1 requires units_per_device = 1");
        }
        if !self.stages.any() {
            anyhow::bail!("At least one pipeline stage must be enabled");
        }
        if self.execution.acquire_timeout_secs == 0 {
            anyhow::bail!("acquire_timeout_secs must be > 0");
        }
        Ok(())
    }

    /// A small valid configuration, used as a starting point by tests.
    pub fn sample() -> Self {
        Self {
            pool: PoolConfig {
                devices: vec![0, 1, 2, 3],
                devices_per_unit: 1,
                units_per_device: 1,
            },
            task_settings: vec!["no_notes".to_string(), "no_labs".to_string()],
            rotation: 0,
            stages: StageFlags::default(),
            programs: ProgramConfig {
                python: PathBuf::from("python"),
                scripts_dir: PathBuf::from("Scripts/End to End"),
                train_script: default_train_script(),
                eval_script: default_eval_script(),
                fine_tune_script: default_fine_tune_script(),
            },
            execution: ExecutionConfig::default(),
            dispatch: DispatchMode::Direct,
            batch: BatchConfig::default(),
        }
    }
}

// Default value functions for serde
fn default_one() -> usize {
    1
}
fn default_python() -> PathBuf {
    PathBuf::from("python")
}
fn default_train_script() -> String {
    "run_model.py".to_string()
}
fn default_eval_script() -> String {
    "evaluate.py".to_string()
}
fn default_fine_tune_script() -> String {
    "fine_tune_task.py".to_string()
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_contention_backoff() -> u64 {
    90
}
fn default_partition() -> String {
    "gpu".to_string()
}
fn default_batch_cpus() -> u32 {
    12
}
fn default_batch_mem_gb() -> u32 {
    48
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_is_valid() {
        assert!(SweepConfig::sample().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_task_settings() {
        let mut config = SweepConfig::sample();
        config.task_settings.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unit_larger_than_pool() {
        let mut config = SweepConfig::sample();
        config.pool.devices = vec![0];
        config.pool.devices_per_unit = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_multi_device_with_shared_slots() {
        let mut config = SweepConfig::sample();
        config.pool.devices_per_unit = 2;
        config.pool.units_per_device = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_all_stages_disabled() {
        let mut config = SweepConfig::sample();
        config.stages = StageFlags {
            train: false,
            eval: false,
            fine_tune: false,
            fine_tune_eval: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_minimal() {
        let config = SweepConfig::from_yaml(
            r#"
pool:
  devices: [0, 1]
task_settings:
  - "no notes"
programs:
  scripts_dir: "Scripts/End to End"
"#,
        )
        .unwrap();

        assert_eq!(config.pool.devices, vec![0, 1]);
        assert_eq!(config.pool.devices_per_unit, 1);
        assert_eq!(config.pool.units_per_device, 1);
        assert_eq!(config.dispatch, DispatchMode::Direct);
        assert_eq!(config.execution.acquire_timeout_secs, 30);
        assert!(config.stages.fine_tune_eval);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_config() {
        let config: SweepConfig = serde_json::from_str(
            r#"{
                "pool": {"devices": [0, 1, 2, 3], "devices_per_unit": 4},
                "task_settings": ["all"],
                "programs": {"scripts_dir": "scripts"},
                "dispatch": "batch"
            }"#,
        )
        .unwrap();

        assert_eq!(config.dispatch, DispatchMode::Batch);
        assert_eq!(config.pool.devices_per_unit, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = SweepConfig::sample();
        let yaml = config.to_yaml().unwrap();
        let reloaded = SweepConfig::from_yaml(&yaml).unwrap();
        assert_eq!(reloaded.task_settings, config.task_settings);
        assert_eq!(reloaded.pool.devices, config.pool.devices);
    }
}
