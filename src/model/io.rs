//! SafeTensors weight loading and saving with HuggingFace LLaMA naming.
//!
//! On disk, 2-D weights are (d_out x d_in) per the HF convention; in memory
//! they are transposed to the (d_in x d_out) forward orientation.

use crate::autograd::transpose;
use crate::model::{CausalModel, DecoderLayer, Linear, ModelConfig, Precision};
use crate::{Error, Result, Tensor};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;

impl CausalModel {
    /// Load a model from a directory holding `config.json` and
    /// `model.safetensors`.
    pub fn from_pretrained(dir: impl AsRef<Path>, precision: Precision) -> Result<Self> {
        let dir = dir.as_ref();

        let config_json = std::fs::read_to_string(dir.join("config.json")).map_err(|e| {
            Error::Model(format!("cannot read {}: {e}", dir.join("config.json").display()))
        })?;
        let config: ModelConfig = serde_json::from_str(&config_json)?;

        let bytes = std::fs::read(dir.join("model.safetensors")).map_err(|e| {
            Error::Model(format!("cannot read {}: {e}", dir.join("model.safetensors").display()))
        })?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| Error::Model(format!("invalid safetensors file: {e}")))?;

        let hidden = config.hidden_size;
        let kv_dim = config.num_kv_heads() * config.head_dim();
        let inter = config.intermediate_size;
        let vocab = config.vocab_size;

        let embed_tokens = load_f32(&tensors, "model.embed_tokens.weight", vocab * hidden)?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{idx}");

            let load_proj = |group: &str,
                             name: &'static str,
                             d_in: usize,
                             d_out: usize|
             -> Result<Linear> {
                let full = format!("{prefix}.{group}.{name}.weight");
                let hf = load_f32(&tensors, &full, d_out * d_in)?;
                // HF stores (d_out, d_in); transpose into forward orientation
                Ok(Linear::new(name, transpose(&hf, d_out, d_in), d_in, d_out, precision))
            };

            layers.push(DecoderLayer {
                input_norm: Tensor::from_vec(
                    load_f32(&tensors, &format!("{prefix}.input_layernorm.weight"), hidden)?,
                    false,
                ),
                q_proj: load_proj("self_attn", "q_proj", hidden, hidden)?,
                k_proj: load_proj("self_attn", "k_proj", hidden, kv_dim)?,
                v_proj: load_proj("self_attn", "v_proj", hidden, kv_dim)?,
                o_proj: load_proj("self_attn", "o_proj", hidden, hidden)?,
                post_attn_norm: Tensor::from_vec(
                    load_f32(
                        &tensors,
                        &format!("{prefix}.post_attention_layernorm.weight"),
                        hidden,
                    )?,
                    false,
                ),
                gate_proj: load_proj("mlp", "gate_proj", hidden, inter)?,
                up_proj: load_proj("mlp", "up_proj", hidden, inter)?,
                down_proj: load_proj("mlp", "down_proj", inter, hidden)?,
            });
        }

        let norm = Tensor::from_vec(load_f32(&tensors, "model.norm.weight", hidden)?, false);
        let lm_head_hf = load_f32(&tensors, "lm_head.weight", vocab * hidden)?;
        let lm_head = Tensor::from_vec(transpose(&lm_head_hf, vocab, hidden), false);

        Ok(Self { config, embed_tokens, layers, norm, lm_head })
    }

    /// Write `config.json` and `model.safetensors` in HF layout.
    ///
    /// Quantized projections are dequantized first, so a save after 4-bit
    /// loading is lossy relative to the original checkpoint.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&self.config)?)?;

        let hidden = self.config.hidden_size;
        let vocab = self.config.vocab_size;

        let mut tensor_data: Vec<(String, Vec<u8>, Vec<usize>)> = Vec::new();
        let mut push = |name: String, values: &[f32], shape: Vec<usize>| {
            tensor_data.push((name, bytemuck::cast_slice(values).to_vec(), shape));
        };

        push(
            "model.embed_tokens.weight".into(),
            &self.embed_tokens,
            vec![vocab, hidden],
        );

        for (idx, layer) in self.layers.iter().enumerate() {
            let prefix = format!("model.layers.{idx}");
            push(
                format!("{prefix}.input_layernorm.weight"),
                &layer.input_norm.data().to_vec(),
                vec![hidden],
            );
            push(
                format!("{prefix}.post_attention_layernorm.weight"),
                &layer.post_attn_norm.data().to_vec(),
                vec![hidden],
            );

            for linear in [
                &layer.q_proj,
                &layer.k_proj,
                &layer.v_proj,
                &layer.o_proj,
                &layer.gate_proj,
                &layer.up_proj,
                &layer.down_proj,
            ] {
                let group = match linear.name() {
                    "gate_proj" | "up_proj" | "down_proj" => "mlp",
                    _ => "self_attn",
                };
                let internal = linear.weight_f32();
                let hf = transpose(&internal, linear.d_in(), linear.d_out());
                push(
                    format!("{prefix}.{group}.{}.weight", linear.name()),
                    &hf,
                    vec![linear.d_out(), linear.d_in()],
                );
            }
        }

        push("model.norm.weight".into(), &self.norm.data().to_vec(), vec![hidden]);
        let lm_internal = self.lm_head.data().to_vec();
        push(
            "lm_head.weight".into(),
            &transpose(&lm_internal, hidden, vocab),
            vec![vocab, hidden],
        );

        let views: Vec<(&str, TensorView<'_>)> = tensor_data
            .iter()
            .map(|(name, bytes, shape)| {
                let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .expect("valid F32 tensor view");
                (name.as_str(), view)
            })
            .collect();

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        let serialized = safetensors::serialize(views, &Some(metadata))
            .map_err(|e| Error::Model(format!("safetensors serialization failed: {e}")))?;
        std::fs::write(dir.join("model.safetensors"), serialized)?;

        Ok(())
    }
}

/// Fetch an F32 tensor by name and verify its element count.
fn load_f32(tensors: &SafeTensors<'_>, name: &str, expected_len: usize) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(name)
        .map_err(|_| Error::Model(format!("missing tensor '{name}'")))?;
    if view.dtype() != Dtype::F32 {
        return Err(Error::Model(format!(
            "tensor '{name}' has dtype {:?}, expected F32",
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
            "tensor '{name}' has {} elements, expected {expected_len}",
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_round_trip_logits() {
        let config = ModelConfig::tiny();
        let model = CausalModel::new(&config);
        let expected = model.forward(&[1, 2, 3]).data().to_vec();

        let tmp = TempDir::new().unwrap();
        model.save_pretrained(tmp.path()).unwrap();
        assert!(tmp.path().join("config.json").exists());
        assert!(tmp.path().join("model.safetensors").exists());

        let reloaded = CausalModel::from_pretrained(tmp.path(), Precision::F32).unwrap();
        let actual = reloaded.forward(&[1, 2, 3]).data().to_vec();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_quantized_load_approximates_f32() {
        let config = ModelConfig::tiny();
        let model = CausalModel::new(&config);
        let tmp = TempDir::new().unwrap();
        model.save_pretrained(tmp.path()).unwrap();

        let f32_model = CausalModel::from_pretrained(tmp.path(), Precision::F32).unwrap();
        let q_model = CausalModel::from_pretrained(tmp.path(), Precision::Int4).unwrap();
        assert!(q_model.layers[0].q_proj.is_quantized());

        let ref_logits = f32_model.forward(&[1, 2]).data().to_vec();
        let q_logits = q_model.forward(&[1, 2]).data().to_vec();
        // Quantization error stays bounded on a tiny model
        for (a, b) in ref_logits.iter().zip(q_logits.iter()) {
            assert!((a - b).abs() < 0.5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_missing_tensor_is_model_error() {
        let tmp = TempDir::new().unwrap();
        let config = ModelConfig::tiny();
        std::fs::write(
            tmp.path().join("config.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
        // Empty safetensors file: header says zero tensors
        let empty = safetensors::serialize(Vec::<(&str, TensorView<'_>)>::new(), &None).unwrap();
        std::fs::write(tmp.path().join("model.safetensors"), empty).unwrap();

        let result = CausalModel::from_pretrained(tmp.path(), Precision::F32);
        assert!(matches!(result, Err(Error::Model(_))));
    }

    #[test]
    fn test_missing_directory_is_model_error() {
        let result = CausalModel::from_pretrained("/nonexistent/model/dir", Precision::F32);
        assert!(matches!(result, Err(Error::Model(_))));
    }
}
