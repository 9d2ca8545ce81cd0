//! Elementwise autograd operations: add, mul, scale, silu, dropout.

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Add two tensors elementwise.
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add: length mismatch");
    let data = &*a.data() + &*b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }
}

/// Multiply two tensors elementwise.
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "mul: length mismatch");
    let data = &*a.data() * &*b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MulBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MulBackward {
    a: Tensor,
    b: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MulBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * b
                let grad_a = grad * &*self.b.data();
                self.a.accumulate_grad(grad_a);
            }
            if self.b.requires_grad() {
                // ∂L/∂b = ∂L/∂out * a
                let grad_b = grad * &*self.a.data();
                self.b.accumulate_grad(grad_b);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }
}

/// Scale a tensor by a scalar.
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = &*a.data() * factor;
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad * self.factor);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}

/// SiLU activation: x * sigmoid(x).
pub fn silu(x: &Tensor) -> Tensor {
    let data: Array1<f32> = x.data().mapv(|v| v * sigmoid(v));
    let requires_grad = x.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SiluBackward {
            x: x.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

#[inline]
fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

struct SiluBackward {
    x: Tensor,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for SiluBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.x.requires_grad() {
                // d/dx [x*σ(x)] = σ(x) * (1 + x * (1 - σ(x)))
                let local: Array1<f32> = self.x.data().mapv(|v| {
                    let s = sigmoid(v);
                    s * (1.0 + v * (1.0 - s))
                });
                self.x.accumulate_grad(grad * &local);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone()]
    }
}

/// Inverted dropout with keep-scaling.
///
/// Zeroes each element with probability `p` and scales survivors by
/// `1 / (1 - p)` so the expected activation is unchanged. With `p == 0`
/// the input tensor is returned unchanged.
pub fn dropout(x: &Tensor, p: f32, rng: &mut StdRng) -> Tensor {
    assert!((0.0..1.0).contains(&p), "dropout: p must be in [0, 1)");
    if p == 0.0 {
        return x.clone();
    }

    let keep_scale = 1.0 / (1.0 - p);
    let mask: Array1<f32> = Array1::from(
        (0..x.len())
            .map(|_| if rng.gen::<f32>() < p { 0.0 } else { keep_scale })
            .collect::<Vec<f32>>(),
    );

    let data = &*x.data() * &mask;
    let requires_grad = x.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(DropoutBackward {
            x: x.clone(),
            mask,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct DropoutBackward {
    x: Tensor,
    mask: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for DropoutBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.x.requires_grad() {
                self.x.accumulate_grad(grad * &self.mask);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use rand::SeedableRng;

    #[test]
    fn test_add_forward() {
        let a = Tensor::from_vec(vec![1.0, 2.0], false);
        let b = Tensor::from_vec(vec![3.0, 4.0], false);
        let c = add(&a, &b);
        assert_eq!(c.data().to_vec(), vec![4.0, 6.0]);
        assert!(!c.requires_grad());
    }

    #[test]
    fn test_add_backward() {
        let a = Tensor::from_vec(vec![1.0, 2.0], true);
        let b = Tensor::from_vec(vec![3.0, 4.0], true);
        let c = add(&a, &b);
        c.set_grad(arr1(&[1.0, 2.0]));
        c.backward();
        assert_eq!(a.grad().unwrap().to_vec(), vec![1.0, 2.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_mul_backward() {
        let a = Tensor::from_vec(vec![2.0, 3.0], true);
        let b = Tensor::from_vec(vec![5.0, 7.0], true);
        let c = mul(&a, &b);
        c.set_grad(arr1(&[1.0, 1.0]));
        c.backward();
        assert_eq!(a.grad().unwrap().to_vec(), vec![5.0, 7.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_scale_backward() {
        let a = Tensor::from_vec(vec![1.0, 2.0], true);
        let c = scale(&a, 3.0);
        assert_eq!(c.data().to_vec(), vec![3.0, 6.0]);
        c.set_grad(arr1(&[1.0, 1.0]));
        c.backward();
        assert_eq!(a.grad().unwrap().to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_silu_forward() {
        let x = Tensor::from_vec(vec![0.0, 1.0], false);
        let y = silu(&x);
        assert_abs_diff_eq!(y.data()[0], 0.0, epsilon = 1e-6);
        // 1 * σ(1) ≈ 0.731
        assert_abs_diff_eq!(y.data()[1], 0.731_058_6, epsilon = 1e-5);
    }

    #[test]
    fn test_silu_backward_at_zero() {
        let x = Tensor::from_vec(vec![0.0], true);
        let y = silu(&x);
        y.set_grad(arr1(&[1.0]));
        y.backward();
        // d/dx silu(0) = σ(0) = 0.5
        assert_abs_diff_eq!(x.grad().unwrap()[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_dropout_zero_p_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
        let y = dropout(&x, 0.0, &mut rng);
        assert_eq!(y.data().to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dropout_zeros_and_scales() {
        let mut rng = StdRng::seed_from_u64(42);
        let x = Tensor::from_vec(vec![1.0; 1000], false);
        let y = dropout(&x, 0.5, &mut rng);
        let kept = y.data().iter().filter(|&&v| v != 0.0).count();
        // Survivors are scaled by 2, roughly half survive
        assert!(y.data().iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(kept > 350 && kept < 650, "kept {kept} of 1000");
    }

    #[test]
    fn test_dropout_backward_uses_same_mask() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = Tensor::from_vec(vec![1.0; 64], true);
        let y = dropout(&x, 0.25, &mut rng);
        y.set_grad(Array1::ones(64));
        y.backward();
        let grad = x.grad().unwrap();
        for (g, v) in grad.iter().zip(y.data().iter()) {
            assert_abs_diff_eq!(*g, *v, epsilon = 1e-6);
        }
    }

    // Residual-style graph: out = add(y, y) with y = scale(x, 2).
    // The shared subexpression must contribute its gradient exactly twice.
    #[test]
    fn test_diamond_graph_gradient() {
        let x = Tensor::from_vec(vec![1.0, 1.0], true);
        let y = scale(&x, 2.0);
        let out = add(&y, &y);
        out.set_grad(arr1(&[1.0, 1.0]));
        out.backward();
        // d out / d x = 2 * 2 = 4 per element
        assert_eq!(x.grad().unwrap().to_vec(), vec![4.0, 4.0]);
    }
}
