//! Optimization: the `Optimizer` trait, AdamW, and gradient clipping.

mod adamw;

pub use adamw::AdamW;

use crate::Tensor;

/// A gradient-based parameter update rule.
///
/// Parameters are tensors whose clones share storage with the model, so an
/// in-place update here is visible at the next forward pass.
pub trait Optimizer {
    /// Apply one update step using each parameter's accumulated gradient.
    fn step(&mut self, params: &mut [Tensor]);

    /// Clear accumulated gradients.
    fn zero_grad(&mut self, params: &mut [Tensor]) {
        for param in params.iter() {
            param.zero_grad();
        }
    }

    /// Current learning rate.
    fn lr(&self) -> f32;

    /// Replace the learning rate.
    fn set_lr(&mut self, lr: f32);
}

/// Scale gradients so their global L2 norm does not exceed `max_norm`.
///
/// Returns the pre-clipping norm.
pub fn clip_grad_norm(params: &[Tensor], max_norm: f32) -> f32 {
    let mut total_sq = 0.0f32;
    for param in params {
        if let Some(grad) = param.grad() {
            total_sq += grad.iter().map(|g| g * g).sum::<f32>();
        }
    }
    let total_norm = total_sq.sqrt();

    if total_norm > max_norm && total_norm > 0.0 {
        let factor = max_norm / total_norm;
        for param in params {
            if let Some(grad) = param.grad() {
                param.set_grad(grad * factor);
            }
        }
    }

    total_norm
}
