//! Shell-script rendering for external batch-scheduler submission.
//!
//! Rendering is a pure function of the work unit, the resource request, and
//! the stage programs. Nothing here touches the device pool: in batch mode the
//! external scheduler owns device assignment, and submission itself happens
//! outside this crate.

use crate::config::{BatchConfig, ProgramConfig};
use crate::unit::WorkUnit;
use anyhow::Result;
use std::path::PathBuf;

/// Submission script written into each unit's run directory.
pub const BATCH_SCRIPT_FILENAME: &str = "submit_sweep.sh";

/// Render the submission script for one work unit: resource-request headers,
/// environment setup, and the enabled stage invocations in pipeline order.
pub fn render_batch_script(
    unit: &WorkUnit,
    batch: &BatchConfig,
    programs: &ProgramConfig,
) -> String {
    let mut script = String::new();

    script.push_str("#!/bin/bash\n");
    script.push_str(&format!("#SBATCH -p {}\n", batch.partition));
    if batch.partition != "cpu" {
        script.push_str("#SBATCH --gres=gpu:1\n");
    }
    script.push_str(&format!("#SBATCH -c {}\n", batch.cpus));
    script.push_str(&format!("#SBATCH --mem={}G\n", batch.mem_gb));
    script.push_str(&format!(
        "#SBATCH --output {}\n",
        unit.run_dir.join("train_%j.log").display()
    ));
    for arg in &batch.extra_args {
        script.push_str(&format!("#SBATCH --{}\n", arg));
    }

    script.push('\n');
    script.push_str(&format!("SEARCH_DIR={}\n", unit.run_dir.display()));
    script.push_str(&format!("FINETUNE_DIR={}\n", unit.fine_tune_dir.display()));
    script.push_str(&format!("cd '{}'\n", programs.scripts_dir.display()));

    let python = programs.python.display();
    if unit.stages.train {
        script.push_str(&format!(
            "{} {} --run_dir $SEARCH_DIR --do_load_from_dir\n",
            python, programs.train_script
        ));
    }
    if unit.stages.eval {
        script.push_str(&format!(
            "{} -u {} --run_dir $SEARCH_DIR --do_load_from_dir\n",
            python, programs.eval_script
        ));
    }
    if unit.stages.fine_tune {
        script.push_str(&format!(
            "{} -u {} --run_dir $SEARCH_DIR --do_load_from_dir\n",
            python, programs.fine_tune_script
        ));
    }
    if unit.stages.fine_tune_eval {
        script.push_str(&format!(
            "{} -u {} --run_dir $FINETUNE_DIR --do_load_from_dir\n",
            python, programs.eval_script
        ));
    }

    script
}

/// Write the unit's submission script and return its path.
pub fn write_batch_script(
    unit: &WorkUnit,
    batch: &BatchConfig,
    programs: &ProgramConfig,
) -> Result<PathBuf> {
    let script = render_batch_script(unit, batch, programs);
    let path = unit.run_dir.join(BATCH_SCRIPT_FILENAME);
    std::fs::write(&path, script)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(path)
}
