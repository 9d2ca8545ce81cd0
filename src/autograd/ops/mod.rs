//! Differentiable operations with recorded backward passes.

pub mod attention;
pub mod basic;
pub mod matmul;
pub mod norm;
