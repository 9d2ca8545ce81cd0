//! Reverse-mode automatic differentiation over flat f32 tensors.
//!
//! Each differentiable operation returns a fresh [`Tensor`] carrying a
//! recorded [`BackwardOp`]. Calling [`Tensor::backward`] on the final output
//! walks the recorded graph in reverse topological order and accumulates
//! gradients into every tensor that requires them.

pub mod ops;
mod tensor;

pub use ops::attention::causal_attention;
pub use ops::basic::{add, dropout, mul, scale, silu};
pub use ops::matmul::{matmul, matmul_compute, transpose};
pub use ops::norm::rms_norm;
pub use tensor::{BackwardOp, Tensor};
