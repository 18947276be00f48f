//! Timing records and the aggregate sweep report.

use crate::unit::StageKind;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Per-unit timing record, written into the run directory.
pub const TIMINGS_FILENAME: &str = "timings.json";

/// Aggregate result artifact for the whole run (direct-execution mode only).
pub const RESULTS_FILENAME: &str = "results.json";

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Outcome of one external stage process.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: StageKind,

    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,

    /// Exit code; `None` when the process was killed by a signal
    pub exit_code: Option<i32>,

    pub success: bool,
}

/// Elapsed seconds per stage plus the unit total, serialized flat:
/// `{"train": 512.3, "eval": 48.1, ..., "total": 731.9}`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TimingRecord {
    #[serde(flatten)]
    pub stages: BTreeMap<String, f64>,

    #[serde(default)]
    pub total: f64,
}

impl TimingRecord {
    pub fn record(&mut self, stage: StageKind, elapsed: Duration) {
        self.stages
            .insert(stage.as_str().to_string(), elapsed.as_secs_f64());
    }

    /// Save the record to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;
        Ok(())
    }
}

/// One unit's entry in the aggregate report.
#[derive(Debug, Serialize)]
pub struct UnitReport {
    pub task_setting: String,

    /// "ran", "failed", or "submitted"
    pub outcome: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub stages: Vec<StageResult>,
}

/// Aggregate result set for the whole run.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub units: Vec<UnitReport>,
}

impl SweepReport {
    /// Save the report to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;
        tracing::info!("Results saved to {}", path.display());
        Ok(())
    }
}
