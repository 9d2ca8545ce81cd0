//! afinar: LoRA supervised fine-tuning for causal language models.
//!
//! Pipeline: JSONL instruction corpus -> chat template -> BPE tokenization ->
//! quantized base model with injected LoRA adapters -> AdamW training loop ->
//! PEFT-compatible adapter artifact.
//!
//! The base model stays frozen throughout; only the low-rank adapter matrices
//! on the attention projections receive gradients.

pub mod artifact;
pub mod autograd;
pub mod config;
pub mod corpus;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod template;
pub mod tokenizer;
pub mod train;

pub use autograd::Tensor;

use thiserror::Error;

/// Crate-wide error type.
///
/// Every fallible operation in the pipeline surfaces through this enum so the
/// binary can report a single message and exit non-zero.
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem or stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed training data
    #[error("corpus error: {0}")]
    Corpus(String),

    /// Invalid run or adapter configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Tokenizer file could not be loaded or parsed
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model weights missing or inconsistent
    #[error("model error: {0}")]
    Model(String),

    /// Training diverged or could not make progress
    #[error("training error: {0}")]
    Training(String),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
