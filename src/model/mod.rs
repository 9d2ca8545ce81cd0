//! Decoder-only causal language model with LoRA-adaptable projections.

pub mod io;
pub mod linear;
pub mod lora;
pub mod quant;

pub use linear::Linear;
pub use lora::{inject_adapters, LoraAdapter, LoraConfig};

use crate::autograd::{add, causal_attention, matmul, mul, rms_norm, silu};
use crate::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Architecture hyperparameters, read from a HuggingFace-style `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    /// Grouped-query KV head count; absent means one KV head per query head
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_max_position")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
}

fn default_max_position() -> usize {
    2048
}

fn default_rms_norm_eps() -> f32 {
    1e-5
}

impl ModelConfig {
    /// Effective KV head count.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Small configuration for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 2,
            vocab_size: 256,
            max_position_embeddings: 128,
            rms_norm_eps: 1e-5,
        }
    }
}

/// Storage precision for frozen base projection weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Full f32
    F32,
    /// Block-wise 4-bit, dequantized at forward time
    #[default]
    Int4,
}

/// One pre-norm decoder block.
pub struct DecoderLayer {
    pub input_norm: Tensor,
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub o_proj: Linear,
    pub post_attn_norm: Tensor,
    pub gate_proj: Linear,
    pub up_proj: Linear,
    pub down_proj: Linear,
}

impl DecoderLayer {
    /// x + attn(norm1(x)), then + mlp(norm2(.)).
    pub fn forward(&self, x: &Tensor, seq_len: usize, config: &ModelConfig) -> Tensor {
        let hidden = config.hidden_size;
        let eps = config.rms_norm_eps;

        let norm1 = rms_norm(x, &self.input_norm, seq_len, hidden, eps);
        let q = self.q_proj.forward(&norm1, seq_len);
        let k = self.k_proj.forward(&norm1, seq_len);
        let v = self.v_proj.forward(&norm1, seq_len);
        let attn = causal_attention(
            &q,
            &k,
            &v,
            seq_len,
            config.num_attention_heads,
            config.num_kv_heads(),
            config.head_dim(),
        );
        let attn_out = self.o_proj.forward(&attn, seq_len);
        let residual = add(x, &attn_out);

        let norm2 = rms_norm(&residual, &self.post_attn_norm, seq_len, hidden, eps);
        let gate = self.gate_proj.forward(&norm2, seq_len);
        let up = self.up_proj.forward(&norm2, seq_len);
        let act = mul(&silu(&gate), &up);
        let mlp_out = self.down_proj.forward(&act, seq_len);
        add(&residual, &mlp_out)
    }

    /// All projection modules, in a stable order.
    pub fn projections_mut(&mut self) -> [&mut Linear; 7] {
        [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.o_proj,
            &mut self.gate_proj,
            &mut self.up_proj,
            &mut self.down_proj,
        ]
    }

    fn projections(&self) -> [&Linear; 7] {
        [
            &self.q_proj,
            &self.k_proj,
            &self.v_proj,
            &self.o_proj,
            &self.gate_proj,
            &self.up_proj,
            &self.down_proj,
        ]
    }
}

/// Decoder-only causal LM with token embeddings, pre-norm blocks, a final
/// RMSNorm, and an LM head.
pub struct CausalModel {
    config: ModelConfig,
    /// (vocab x hidden), row per token id, frozen
    embed_tokens: Vec<f32>,
    pub layers: Vec<DecoderLayer>,
    /// Final norm gain
    pub norm: Tensor,
    /// (hidden x vocab) internal layout, frozen
    pub lm_head: Tensor,
}

impl CausalModel {
    /// Create a model with deterministic small weights. Used for tests and
    /// for synthesizing fixture checkpoints.
    pub fn new(config: &ModelConfig) -> Self {
        let hidden = config.hidden_size;
        let kv_dim = config.num_kv_heads() * config.head_dim();
        let inter = config.intermediate_size;

        let layers = (0..config.num_hidden_layers)
            .map(|idx| {
                let salt = idx * 1000;
                DecoderLayer {
                    input_norm: Tensor::from_vec(vec![1.0; hidden], false),
                    q_proj: Linear::new(
                        "q_proj",
                        seeded_weights(hidden * hidden, salt + 1),
                        hidden,
                        hidden,
                        Precision::F32,
                    ),
                    k_proj: Linear::new(
                        "k_proj",
                        seeded_weights(hidden * kv_dim, salt + 2),
                        hidden,
                        kv_dim,
                        Precision::F32,
                    ),
                    v_proj: Linear::new(
                        "v_proj",
                        seeded_weights(hidden * kv_dim, salt + 3),
                        hidden,
                        kv_dim,
                        Precision::F32,
                    ),
                    o_proj: Linear::new(
                        "o_proj",
                        seeded_weights(hidden * hidden, salt + 4),
                        hidden,
                        hidden,
                        Precision::F32,
                    ),
                    post_attn_norm: Tensor::from_vec(vec![1.0; hidden], false),
                    gate_proj: Linear::new(
                        "gate_proj",
                        seeded_weights(hidden * inter, salt + 5),
                        hidden,
                        inter,
                        Precision::F32,
                    ),
                    up_proj: Linear::new(
                        "up_proj",
                        seeded_weights(hidden * inter, salt + 6),
                        hidden,
                        inter,
                        Precision::F32,
                    ),
                    down_proj: Linear::new(
                        "down_proj",
                        seeded_weights(inter * hidden, salt + 7),
                        inter,
                        hidden,
                        Precision::F32,
                    ),
                }
            })
            .collect();

        Self {
            config: config.clone(),
            embed_tokens: seeded_weights(config.vocab_size * hidden, 9),
            layers,
            norm: Tensor::from_vec(vec![1.0; hidden], false),
            lm_head: Tensor::from_vec(seeded_weights(hidden * config.vocab_size, 10), false),
        }
    }

    /// Architecture configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Projection module names adapters can target.
    pub fn projection_names() -> Vec<&'static str> {
        vec!["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"]
    }

    /// Forward pass over a token sequence. Returns logits
    /// (seq_len x vocab_size, flattened).
    pub fn forward(&self, ids: &[u32]) -> Tensor {
        let seq_len = ids.len();
        let hidden = self.config.hidden_size;
        assert!(seq_len > 0, "forward: empty sequence");
        assert!(
            seq_len <= self.config.max_position_embeddings,
            "forward: sequence exceeds max positions"
        );

        // Token embedding plus sinusoidal position encoding
        let mut x_data = vec![0.0f32; seq_len * hidden];
        for (pos, &id) in ids.iter().enumerate() {
            let id = id as usize;
            assert!(id < self.config.vocab_size, "forward: token id out of vocabulary");
            let row = &self.embed_tokens[id * hidden..(id + 1) * hidden];
            let out_row = &mut x_data[pos * hidden..(pos + 1) * hidden];
            out_row.copy_from_slice(row);
            for (i, v) in out_row.iter_mut().enumerate() {
                *v += position_encoding(pos, i, hidden);
            }
        }

        let mut x = Tensor::from_vec(x_data, false);
        for layer in &self.layers {
            x = layer.forward(&x, seq_len, &self.config);
        }

        let normed = rms_norm(&x, &self.norm, seq_len, hidden, self.config.rms_norm_eps);
        matmul(&normed, &self.lm_head, seq_len, hidden, self.config.vocab_size)
    }

    /// Freeze every base parameter and verify norm weights are usable.
    ///
    /// Run once after loading, before adapter injection.
    pub fn prepare_for_kbit_training(&mut self) -> Result<()> {
        self.norm.set_requires_grad(false);
        self.lm_head.set_requires_grad(false);

        for (idx, layer) in self.layers.iter().enumerate() {
            layer.input_norm.set_requires_grad(false);
            layer.post_attn_norm.set_requires_grad(false);
            for linear in layer.projections() {
                linear.freeze();
            }
            for (name, norm) in
                [("input_layernorm", &layer.input_norm), ("post_attention_layernorm", &layer.post_attn_norm)]
            {
                if norm.data().iter().any(|v| !v.is_finite()) {
                    return Err(Error::Model(format!(
                        "non-finite values in model.layers.{idx}.{name}.weight"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Handles to every adapter matrix, in layer order. Clones share storage
    /// with the adapters inside the model.
    pub fn trainable_parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        for layer in &self.layers {
            for linear in layer.projections() {
                if let Some(adapter) = linear.adapter() {
                    params.extend(adapter.trainable_params());
                }
            }
        }
        params
    }

    /// Adapted projections with their full module paths, e.g.
    /// `model.layers.0.self_attn.q_proj`.
    pub fn adapter_entries(&self) -> Vec<(String, &LoraAdapter, usize, usize)> {
        let mut entries = Vec::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            for linear in layer.projections() {
                if let Some(adapter) = linear.adapter() {
                    let group = match linear.name() {
                        "q_proj" | "k_proj" | "v_proj" | "o_proj" => "self_attn",
                        _ => "mlp",
                    };
                    entries.push((
                        format!("model.layers.{idx}.{group}.{}", linear.name()),
                        adapter,
                        linear.d_in(),
                        linear.d_out(),
                    ));
                }
            }
        }
        entries
    }
}

/// Deterministic pseudo-random weights for fixture models.
fn seeded_weights(n: usize, salt: usize) -> Vec<f32> {
    (0..n).map(|i| (((i + salt * 7919) as f32) * 0.113).sin() * 0.02).collect()
}

/// Sinusoidal additive position encoding.
fn position_encoding(pos: usize, dim: usize, hidden: usize) -> f32 {
    let pair = (dim / 2) as f32;
    let freq = 1.0 / 10_000f32.powf(2.0 * pair / hidden as f32);
    let angle = pos as f32 * freq;
    if dim % 2 == 0 {
        angle.sin()
    } else {
        angle.cos()
    }
}
