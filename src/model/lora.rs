//! Low-rank adapters and their injection into a loaded model.

use crate::autograd::{dropout, matmul, scale};
use crate::model::CausalModel;
use crate::{Error, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;

/// Adapter hyperparameters.
#[derive(Debug, Clone)]
pub struct LoraConfig {
    /// Low-rank dimension
    pub rank: usize,
    /// Scaling numerator; effective scale is alpha / rank
    pub alpha: f32,
    /// Dropout probability on the adapter input during training
    pub dropout: f32,
    /// Projection module names to adapt
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: ["q_proj", "k_proj", "v_proj", "o_proj"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl LoraConfig {
    /// Create a config with the given rank and alpha, no dropout, attention targets.
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self { rank, alpha, dropout: 0.0, ..Self::default() }
    }

    /// Set the dropout probability.
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Replace the target module list.
    pub fn with_target_modules(mut self, targets: &[&str]) -> Self {
        self.target_modules = targets.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Effective output scale.
    pub fn scale(&self) -> f32 {
        self.alpha / self.rank as f32
    }
}

/// Trainable low-rank delta attached to a frozen linear projection.
///
/// Internal layouts follow the forward orientation: `a` is (d_in x rank),
/// `b` is (rank x d_out), both flattened row-major. B starts at zero so the
/// adapted model is exactly the base model before training.
pub struct LoraAdapter {
    /// Down-projection, trainable
    pub a: Tensor,
    /// Up-projection, trainable, zero-initialized
    pub b: Tensor,
    /// Low-rank dimension
    pub rank: usize,
    /// alpha / rank
    pub scale: f32,
    dropout: f32,
    rng: Option<Rc<RefCell<StdRng>>>,
}

impl LoraAdapter {
    /// Create an adapter for a (d_in -> d_out) projection.
    pub fn new(
        d_in: usize,
        d_out: usize,
        rank: usize,
        alpha: f32,
        dropout: f32,
        rng: Option<Rc<RefCell<StdRng>>>,
    ) -> Self {
        // Deterministic small init for A keeps runs reproducible
        let a_data: Vec<f32> = (0..d_in * rank).map(|i| (i as f32 * 0.1).sin() * 0.01).collect();

        Self {
            a: Tensor::from_vec(a_data, true),
            b: Tensor::zeros(rank * d_out, true),
            rank,
            scale: alpha / rank as f32,
            dropout,
            rng,
        }
    }

    /// Scaled low-rank delta: scale * ((drop(x) @ A) @ B).
    pub fn forward(&self, x: &Tensor, seq_len: usize, d_in: usize, d_out: usize) -> Tensor {
        let x_in = match &self.rng {
            Some(rng) if self.dropout > 0.0 => dropout(x, self.dropout, &mut rng.borrow_mut()),
            _ => x.clone(),
        };
        let down = matmul(&x_in, &self.a, seq_len, d_in, self.rank);
        let up = matmul(&down, &self.b, seq_len, self.rank, d_out);
        scale(&up, self.scale)
    }

    /// Handles to the trainable matrices. Clones share storage.
    pub fn trainable_params(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }

    /// Overwrite both matrices, e.g. when applying a saved adapter.
    pub fn set_weights(&self, a: &[f32], b: &[f32]) -> Result<()> {
        if a.len() != self.a.len() || b.len() != self.b.len() {
            return Err(Error::Model(format!(
                "adapter weight size mismatch: got A={} B={}, expected A={} B={}",
                a.len(),
                b.len(),
                self.a.len(),
                self.b.len()
            )));
        }
        self.a.data_mut().assign(&ndarray::Array1::from(a.to_vec()));
        self.b.data_mut().assign(&ndarray::Array1::from(b.to_vec()));
        Ok(())
    }
}

/// Attach adapters to every targeted projection in the model.
///
/// Target names are validated against the model's projection modules before
/// anything is modified; an unknown name fails the run up front.
pub fn inject_adapters(model: &mut CausalModel, config: &LoraConfig, seed: u64) -> Result<()> {
    let known = CausalModel::projection_names();
    for target in &config.target_modules {
        if !known.contains(&target.as_str()) {
            return Err(Error::Config(format!(
                "unknown LoRA target module '{target}' (known: {})",
                known.join(", ")
            )));
        }
    }
    if config.rank == 0 {
        return Err(Error::Config("LoRA rank must be at least 1".into()));
    }

    let rng = if config.dropout > 0.0 {
        Some(Rc::new(RefCell::new(StdRng::seed_from_u64(seed))))
    } else {
        None
    };

    for layer in &mut model.layers {
        for linear in layer.projections_mut() {
            if config.target_modules.iter().any(|t| t == linear.name()) {
                let adapter = LoraAdapter::new(
                    linear.d_in(),
                    linear.d_out(),
                    config.rank,
                    config.alpha,
                    config.dropout,
                    rng.clone(),
                );
                linear.attach_adapter(adapter);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use ndarray::arr1;

    #[test]
    fn test_lora_config_defaults() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 8);
        assert_eq!(config.alpha, 16.0);
        assert_eq!(config.dropout, 0.05);
        assert_eq!(config.target_modules.len(), 4);
        assert_eq!(config.scale(), 2.0);
    }

    #[test]
    fn test_adapter_starts_as_identity() {
        // B is zero, so the delta is zero regardless of A
        let adapter = LoraAdapter::new(4, 4, 2, 4.0, 0.0, None);
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], false);
        let delta = adapter.forward(&x, 1, 4, 4);
        assert!(delta.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_adapter_params_trainable() {
        let adapter = LoraAdapter::new(4, 4, 2, 4.0, 0.0, None);
        let params = adapter.trainable_params();
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(Tensor::requires_grad));
    }

    #[test]
    fn test_adapter_delta_after_update() {
        let adapter = LoraAdapter::new(2, 2, 1, 1.0, 0.0, None);
        adapter.set_weights(&[1.0, 0.0], &[0.5, 0.5]).unwrap();
        let x = Tensor::from_vec(vec![2.0, 3.0], false);
        // x @ A = [2], then @ B = [1, 1], scale 1.0
        let delta = adapter.forward(&x, 1, 2, 2);
        assert_eq!(delta.data().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_adapter_gradient_flows() {
        let adapter = LoraAdapter::new(2, 2, 1, 2.0, 0.0, None);
        let x = Tensor::from_vec(vec![1.0, 1.0], false);
        let out = adapter.forward(&x, 1, 2, 2);
        out.set_grad(arr1(&[1.0, 1.0]));
        out.backward();
        // B is zero so A's grad comes only through B... and is zero; B's grad is not
        assert!(adapter.b.grad().is_some());
        let b_grad = adapter.b.grad().unwrap();
        assert!(b_grad.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_set_weights_size_mismatch() {
        let adapter = LoraAdapter::new(2, 2, 1, 1.0, 0.0, None);
        let result = adapter.set_weights(&[1.0], &[0.5, 0.5]);
        assert!(result.is_err());
    }

    #[test]
    fn test_inject_rejects_unknown_target() {
        let mut model = CausalModel::new(&ModelConfig::tiny());
        let config = LoraConfig::new(4, 8.0).with_target_modules(&["q_proj", "query_proj"]);
        let result = inject_adapters(&mut model, &config, 42);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_inject_rejects_zero_rank() {
        let mut model = CausalModel::new(&ModelConfig::tiny());
        let mut config = LoraConfig::default();
        config.rank = 0;
        assert!(inject_adapters(&mut model, &config, 42).is_err());
    }

    #[test]
    fn test_inject_attaches_to_targets_only() {
        let config = ModelConfig::tiny();
        let mut model = CausalModel::new(&config);
        let lora = LoraConfig::new(4, 8.0).with_target_modules(&["q_proj", "v_proj"]);
        inject_adapters(&mut model, &lora, 42).unwrap();

        // 2 adapters per layer, a + b each
        let params = model.trainable_parameters();
        assert_eq!(params.len(), config.num_hidden_layers * 2 * 2);

        for layer in &model.layers {
            assert!(layer.q_proj.adapter().is_some());
            assert!(layer.v_proj.adapter().is_some());
            assert!(layer.k_proj.adapter().is_none());
            assert!(layer.o_proj.adapter().is_none());
        }
    }
}
