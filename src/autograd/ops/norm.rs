//! RMS normalization over a sequence of hidden vectors.

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// RMSNorm applied independently at each sequence position.
///
/// `x` is (seq_len x hidden) flattened, `weight` is the per-channel gain of
/// length `hidden`. Each position is scaled by the reciprocal of
/// sqrt(mean(x^2) + eps).
pub fn rms_norm(x: &Tensor, weight: &Tensor, seq_len: usize, hidden: usize, eps: f32) -> Tensor {
    assert_eq!(x.len(), seq_len * hidden, "rms_norm: input size mismatch");
    assert_eq!(weight.len(), hidden, "rms_norm: weight size mismatch");

    let mut out = vec![0.0f32; seq_len * hidden];
    {
        let x_data = x.data();
        let w_data = weight.data();
        let x_slice = x_data.as_slice().expect("input must be contiguous");
        let w_slice = w_data.as_slice().expect("weight must be contiguous");

        for pos in 0..seq_len {
            let row = &x_slice[pos * hidden..(pos + 1) * hidden];
            let rms = row_rms(row, eps);
            let inv = 1.0 / rms;
            for i in 0..hidden {
                out[pos * hidden + i] = w_slice[i] * row[i] * inv;
            }
        }
    }

    let requires_grad = x.requires_grad() || weight.requires_grad();
    let mut result = Tensor::new(Array1::from(out), requires_grad);

    if requires_grad {
        let backward_op = Rc::new(RmsNormBackward {
            x: x.clone(),
            weight: weight.clone(),
            seq_len,
            hidden,
            eps,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

#[inline]
fn row_rms(row: &[f32], eps: f32) -> f32 {
    let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
    (mean_sq + eps).sqrt()
}

struct RmsNormBackward {
    x: Tensor,
    weight: Tensor,
    seq_len: usize,
    hidden: usize,
    eps: f32,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for RmsNormBackward {
    fn backward(&self) {
        let grad_out = self.result_grad.borrow();
        let Some(grad) = grad_out.as_ref() else { return };
        let g = grad.as_slice().expect("gradient must be contiguous");

        let x_data = self.x.data();
        let w_data = self.weight.data();
        let x_slice = x_data.as_slice().expect("input must be contiguous");
        let w_slice = w_data.as_slice().expect("weight must be contiguous");

        let n = self.hidden as f32;
        let mut grad_x = vec![0.0f32; self.seq_len * self.hidden];
        let mut grad_w = vec![0.0f32; self.hidden];

        for pos in 0..self.seq_len {
            let base = pos * self.hidden;
            let row = &x_slice[base..base + self.hidden];
            let g_row = &g[base..base + self.hidden];
            let rms = row_rms(row, self.eps);
            let inv = 1.0 / rms;

            // Shared term: sum_j g_j * w_j * x_j
            let dot: f32 = (0..self.hidden).map(|j| g_row[j] * w_slice[j] * row[j]).sum();
            let coeff = dot * inv * inv * inv / n;

            for i in 0..self.hidden {
                grad_x[base + i] = g_row[i] * w_slice[i] * inv - row[i] * coeff;
                grad_w[i] += g_row[i] * row[i] * inv;
            }
        }

        drop(x_data);
        drop(w_data);

        if self.x.requires_grad() {
            self.x.accumulate_grad(Array1::from(grad_x));
        }
        if self.weight.requires_grad() {
            self.weight.accumulate_grad(Array1::from(grad_w));
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone(), self.weight.clone()]
    }
}
