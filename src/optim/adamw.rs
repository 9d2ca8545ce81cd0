//! AdamW optimizer (Adam with decoupled weight decay).

use super::Optimizer;
use crate::Tensor;
use ndarray::Array1;

/// AdamW applies weight decay directly to the parameters instead of folding
/// it into the gradient:
///
/// θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε)
///
/// with lr_t the bias-corrected learning rate.
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    /// First moment, lazily initialized per parameter slot
    m: Vec<Option<Array1<f32>>>,
    /// Second moment
    v: Vec<Option<Array1<f32>>>,
}

impl AdamW {
    /// Create with explicit hyperparameters.
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self { lr, beta1, beta2, epsilon, weight_decay, t: 0, m: Vec::new(), v: Vec::new() }
    }

    /// Conventional defaults (betas 0.9/0.999, eps 1e-8, decay 0.01).
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }

    fn ensure_moments(&mut self, params: &[Tensor]) {
        if self.m.is_empty() {
            self.m = params.iter().map(|_| None).collect();
            self.v = params.iter().map(|_| None).collect();
        }
    }

    /// Number of update steps taken.
    pub fn step_count(&self) -> u64 {
        self.t
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [Tensor]) {
        self.ensure_moments(params);
        self.t += 1;

        let lr_t = self.lr
            * ((1.0 - self.beta2.powi(self.t as i32)).sqrt()
                / (1.0 - self.beta1.powi(self.t as i32)));

        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad() else { continue };

            if self.m[i].is_none() {
                self.m[i] = Some(Array1::zeros(grad.len()));
                self.v[i] = Some(Array1::zeros(grad.len()));
            }
            let m = self.m[i].as_mut().expect("moment initialized above");
            let v = self.v[i].as_mut().expect("moment initialized above");

            let mut data = param.data_mut();
            for j in 0..grad.len() {
                let g = grad[j];
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;

                // Decoupled decay, then the Adam update
                data[j] *= 1.0 - self.lr * self.weight_decay;
                data[j] -= lr_t * m[j] / (v[j].sqrt() + self.epsilon);
            }
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn test_adamw_step_moves_against_gradient() {
        let mut opt = AdamW::default_params(0.1);
        let p = Tensor::from_vec(vec![1.0, 1.0], true);
        p.set_grad(arr1(&[1.0, -1.0]));
        opt.step(&mut [p.clone()]);

        // Positive gradient decreases the value, negative increases it
        assert!(p.data()[0] < 1.0);
        assert!(p.data()[1] > 1.0);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_adamw_first_step_magnitude() {
        // With bias correction the first step is close to lr (plus decay)
        let mut opt = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.0);
        let p = Tensor::from_vec(vec![0.0], true);
        p.set_grad(arr1(&[1.0]));
        opt.step(&mut [p.clone()]);
        assert_abs_diff_eq!(p.data()[0], -0.1, epsilon = 1e-3);
    }

    #[test]
    fn test_adamw_weight_decay_shrinks_params() {
        let mut opt = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.5);
        let p = Tensor::from_vec(vec![10.0], true);
        p.set_grad(arr1(&[0.0]));
        opt.step(&mut [p.clone()]);
        // Zero gradient, so only the decay term acts: 10 * (1 - 0.1 * 0.5)
        assert_abs_diff_eq!(p.data()[0], 9.5, epsilon = 1e-5);
    }

    #[test]
    fn test_adamw_skips_params_without_grad() {
        let mut opt = AdamW::default_params(0.1);
        let p = Tensor::from_vec(vec![2.0], true);
        opt.step(&mut [p.clone()]);
        assert_eq!(p.data()[0], 2.0);
    }

    #[test]
    fn test_adamw_converges_on_quadratic() {
        // Minimize f(x) = x^2 from x = 5
        let mut opt = AdamW::new(0.3, 0.9, 0.999, 1e-8, 0.0);
        let p = Tensor::from_vec(vec![5.0], true);
        for _ in 0..200 {
            let x = p.data()[0];
            p.set_grad(arr1(&[2.0 * x]));
            opt.step(&mut [p.clone()]);
        }
        assert!(p.data()[0].abs() < 0.1, "did not converge: {}", p.data()[0]);
    }

    #[test]
    fn test_zero_grad_clears() {
        let mut opt = AdamW::default_params(0.1);
        let p = Tensor::from_vec(vec![1.0], true);
        p.set_grad(arr1(&[1.0]));
        opt.zero_grad(&mut [p.clone()]);
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_set_lr() {
        let mut opt = AdamW::default_params(0.1);
        opt.set_lr(0.01);
        assert_eq!(opt.lr(), 0.01);
    }
}
