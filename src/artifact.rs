//! PEFT-compatible adapter artifacts: `adapter_config.json` plus
//! `adapter_model.safetensors`.
//!
//! On disk the matrices use the PEFT orientation, `lora_A` as (rank x d_in)
//! and `lora_B` as (d_out x rank), so the output loads directly into the
//! Python `peft` library. In memory the adapters keep the forward
//! orientation, so both save and load transpose.

use crate::autograd::transpose;
use crate::model::{inject_adapters, CausalModel, LoraConfig};
use crate::{Error, Result};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;

/// Contents of `adapter_config.json`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeftConfig {
    pub peft_type: String,
    pub base_model_name_or_path: String,
    pub r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    pub bias: String,
    pub task_type: String,
}

impl PeftConfig {
    /// Describe a trained adapter. Target modules are sorted for a stable
    /// file across runs.
    pub fn new(lora: &LoraConfig, base_model: &str) -> Self {
        let mut targets = lora.target_modules.clone();
        targets.sort();
        Self {
            peft_type: "LORA".to_string(),
            base_model_name_or_path: base_model.to_string(),
            r: lora.rank,
            lora_alpha: lora.alpha,
            lora_dropout: lora.dropout,
            target_modules: targets,
            bias: "none".to_string(),
            task_type: "CAUSAL_LM".to_string(),
        }
    }

    /// Reconstruct the adapter hyperparameters.
    pub fn to_lora_config(&self) -> LoraConfig {
        LoraConfig {
            rank: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
        }
    }
}

/// Write the model's adapters to `dir` in PEFT layout.
pub fn save_adapter(
    model: &CausalModel,
    lora: &LoraConfig,
    base_model: &str,
    dir: impl AsRef<Path>,
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let entries = model.adapter_entries();
    if entries.is_empty() {
        return Err(Error::Model("no adapters attached, nothing to save".into()));
    }

    let config = PeftConfig::new(lora, base_model);
    std::fs::write(dir.join("adapter_config.json"), serde_json::to_string_pretty(&config)?)?;

    let mut tensor_data: Vec<(String, Vec<u8>, Vec<usize>)> = Vec::new();
    for (path, adapter, d_in, d_out) in &entries {
        let rank = adapter.rank;
        // Internal A is (d_in x rank); PEFT wants (rank x d_in)
        let a_internal = adapter.a.data().to_vec();
        let a_peft = transpose(&a_internal, *d_in, rank);
        tensor_data.push((
            format!("base_model.model.{path}.lora_A.weight"),
            bytemuck::cast_slice(&a_peft).to_vec(),
            vec![rank, *d_in],
        ));

        let b_internal = adapter.b.data().to_vec();
        let b_peft = transpose(&b_internal, rank, *d_out);
        tensor_data.push((
            format!("base_model.model.{path}.lora_B.weight"),
            bytemuck::cast_slice(&b_peft).to_vec(),
            vec![*d_out, rank],
        ));
    }

    let views: Vec<(&str, TensorView<'_>)> = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            let view =
                TensorView::new(Dtype::F32, shape.clone(), bytes).expect("valid F32 tensor view");
            (name.as_str(), view)
        })
        .collect();

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    let serialized = safetensors::serialize(views, &Some(metadata))
        .map_err(|e| Error::Model(format!("adapter serialization failed: {e}")))?;
    std::fs::write(dir.join("adapter_model.safetensors"), serialized)?;

    Ok(())
}

/// Read `adapter_config.json` from an adapter directory.
pub fn load_adapter_config(dir: impl AsRef<Path>) -> Result<PeftConfig> {
    let path = dir.as_ref().join("adapter_config.json");
    let json = std::fs::read_to_string(&path)
        .map_err(|e| Error::Model(format!("cannot read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&json)?)
}

/// Inject adapters per the saved config and load the saved weights into them.
///
/// Dropout is disabled on application; the loaded adapters are for inference
/// or further export, not training.
pub fn apply_adapter(model: &mut CausalModel, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    let peft = load_adapter_config(dir)?;
    let lora = LoraConfig { dropout: 0.0, ..peft.to_lora_config() };
    inject_adapters(model, &lora, 0)?;

    let bytes = std::fs::read(dir.join("adapter_model.safetensors")).map_err(|e| {
        Error::Model(format!(
            "cannot read {}: {e}",
            dir.join("adapter_model.safetensors").display()
        ))
    })?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| Error::Model(format!("invalid adapter safetensors: {e}")))?;

    for (path, adapter, d_in, d_out) in model.adapter_entries() {
        let rank = adapter.rank;
        let a_peft = load_f32(
            &tensors,
            &format!("base_model.model.{path}.lora_A.weight"),
            rank * d_in,
        )?;
        let b_peft = load_f32(
            &tensors,
            &format!("base_model.model.{path}.lora_B.weight"),
            d_out * rank,
        )?;
        // Transpose back into the forward orientation
        let a = transpose(&a_peft, rank, d_in);
        let b = transpose(&b_peft, d_out, rank);
        adapter.set_weights(&a, &b)?;
    }

    Ok(())
}

fn load_f32(tensors: &SafeTensors<'_>, name: &str, expected_len: usize) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(name)
        .map_err(|_| Error::Model(format!("missing adapter tensor '{name}'")))?;
    if view.dtype() != Dtype::F32 {
        return Err(Error::Model(format!(
            "adapter tensor '{name}' has dtype {:?}, expected F32",
            view.dtype()
        )));
    }
    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    if values.len() != expected_len {
        return Err(Error::Model(format!(
            "adapter tensor '{name}' has {} elements, expected {expected_len}",
            values.len()
        )));
    }
    Ok(values)
}
