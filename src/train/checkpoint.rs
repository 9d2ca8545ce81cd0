//! Intermediate adapter checkpoints with bounded retention.

use crate::artifact::save_adapter;
use crate::model::{CausalModel, LoraConfig};
use crate::Result;
use std::path::{Path, PathBuf};

/// Save the current adapters under `output_dir/checkpoint-{global_step}` and
/// delete the oldest checkpoints beyond `keep`.
pub fn save_checkpoint(
    model: &CausalModel,
    lora: &LoraConfig,
    base_model: &str,
    output_dir: &Path,
    global_step: u64,
    keep: usize,
) -> Result<PathBuf> {
    let dir = output_dir.join(format!("checkpoint-{global_step}"));
    save_adapter(model, lora, base_model, &dir)?;
    prune(output_dir, keep)?;
    Ok(dir)
}

/// Step numbers of the checkpoints present in `output_dir`, ascending.
pub fn checkpoint_steps(output_dir: &Path) -> Result<Vec<u64>> {
    let mut steps = Vec::new();
    if !output_dir.exists() {
        return Ok(steps);
    }
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(rest) = name.to_string_lossy().strip_prefix("checkpoint-").map(String::from)
        else {
            continue;
        };
        if let Ok(step) = rest.parse::<u64>() {
            steps.push(step);
        }
    }
    steps.sort_unstable();
    Ok(steps)
}

fn prune(output_dir: &Path, keep: usize) -> Result<()> {
    let steps = checkpoint_steps(output_dir)?;
    if steps.len() <= keep {
        return Ok(());
    }
    for step in &steps[..steps.len() - keep] {
        std::fs::remove_dir_all(output_dir.join(format!("checkpoint-{step}")))?;
    }
    Ok(())
}
