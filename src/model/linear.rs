//! Linear projection with an optionally quantized base weight and an
//! optional LoRA adapter.

use crate::autograd::{add, matmul};
use crate::model::lora::LoraAdapter;
use crate::model::quant::{dequantize_4bit, quantize_4bit, Quantized4Bit};
use crate::model::Precision;
use crate::Tensor;

/// Frozen base weight storage.
enum BaseWeight {
    /// Full precision, kept as a frozen tensor
    F32(Tensor),
    /// Block-wise 4-bit, dequantized at each forward
    Int4(Quantized4Bit),
}

/// A frozen (d_in -> d_out) projection.
///
/// Weight layout is (d_in x d_out) flattened row-major so the forward pass
/// is a plain `x @ W`. The adapter delta, when present, is added on top.
pub struct Linear {
    name: &'static str,
    base: BaseWeight,
    d_in: usize,
    d_out: usize,
    adapter: Option<LoraAdapter>,
}

impl Linear {
    /// Create from an internal-layout weight buffer.
    pub fn new(
        name: &'static str,
        weight: Vec<f32>,
        d_in: usize,
        d_out: usize,
        precision: Precision,
    ) -> Self {
        assert_eq!(weight.len(), d_in * d_out, "linear weight size mismatch");
        let base = match precision {
            Precision::F32 => BaseWeight::F32(Tensor::from_vec(weight, false)),
            Precision::Int4 => BaseWeight::Int4(quantize_4bit(&weight)),
        };
        Self { name, base, d_in, d_out, adapter: None }
    }

    /// Module name within its parent block (e.g. `q_proj`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Input dimension.
    pub fn d_in(&self) -> usize {
        self.d_in
    }

    /// Output dimension.
    pub fn d_out(&self) -> usize {
        self.d_out
    }

    /// Base weight as f32 in internal layout. Dequantizes when needed.
    pub fn weight_f32(&self) -> Vec<f32> {
        match &self.base {
            BaseWeight::F32(t) => t.data().to_vec(),
            BaseWeight::Int4(q) => dequantize_4bit(q),
        }
    }

    /// Whether the base weight is stored quantized.
    pub fn is_quantized(&self) -> bool {
        matches!(self.base, BaseWeight::Int4(_))
    }

    /// Disable gradient tracking on the base weight.
    pub fn freeze(&self) {
        if let BaseWeight::F32(t) = &self.base {
            t.set_requires_grad(false);
        }
    }

    /// Attach a LoRA adapter, replacing any existing one.
    pub fn attach_adapter(&mut self, adapter: LoraAdapter) {
        self.adapter = Some(adapter);
    }

    /// The attached adapter, if any.
    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    /// Forward pass on a (seq_len x d_in) input.
    pub fn forward(&self, x: &Tensor, seq_len: usize) -> Tensor {
        let weight = match &self.base {
            BaseWeight::F32(t) => t.clone(),
            BaseWeight::Int4(q) => Tensor::from_vec(dequantize_4bit(q), false),
        };
        let base_out = matmul(x, &weight, seq_len, self.d_in, self.d_out);

        match &self.adapter {
            Some(adapter) => {
                let delta = adapter.forward(x, seq_len, self.d_in, self.d_out);
                add(&base_out, &delta)
            }
            None => base_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_forward_identity() {
        let weight = vec![1.0, 0.0, 0.0, 1.0];
        let linear = Linear::new("q_proj", weight, 2, 2, Precision::F32);
        let x = Tensor::from_vec(vec![3.0, 4.0], false);
        let y = linear.forward(&x, 1);
        assert_eq!(y.data().to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_linear_quantized_close_to_f32() {
        let weight: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.2).sin()).collect();
        let f32_linear = Linear::new("q_proj", weight.clone(), 8, 8, Precision::F32);
        let q_linear = Linear::new("q_proj", weight, 8, 8, Precision::Int4);
        assert!(q_linear.is_quantized());

        let x = Tensor::from_vec(vec![0.5; 8], false);
        let y_f32 = f32_linear.forward(&x, 1);
        let y_q = q_linear.forward(&x, 1);
        for (a, b) in y_f32.data().iter().zip(y_q.data().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.3);
        }
    }

    #[test]
    fn test_linear_adapter_zero_at_start() {
        let weight = vec![1.0, 0.0, 0.0, 1.0];
        let mut linear = Linear::new("v_proj", weight, 2, 2, Precision::F32);
        let x = Tensor::from_vec(vec![1.0, 2.0], false);
        let before = linear.forward(&x, 1).data().to_vec();

        linear.attach_adapter(crate::model::lora::LoraAdapter::new(2, 2, 2, 4.0, 0.0, None));
        let after = linear.forward(&x, 1).data().to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn test_weight_round_trip_f32() {
        let weight = vec![0.1, 0.2, 0.3, 0.4];
        let linear = Linear::new("o_proj", weight.clone(), 2, 2, Precision::F32);
        assert_eq!(linear.weight_f32(), weight);
    }
}
