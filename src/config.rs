//! Run configuration from environment variables and training hyperparameters.

use crate::{Error, Result};
use std::path::PathBuf;

/// Where the run reads and writes.
///
/// Resolved from the environment with hardcoded defaults, matching the
/// deployment convention of driving runs through env vars only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Model identifier or local directory containing config/weights
    pub base_model: String,
    /// JSONL corpus path
    pub data_path: PathBuf,
    /// Adapter output directory
    pub output_dir: PathBuf,
    /// Truncation length for tokenized examples
    pub max_len: usize,
}

impl RunConfig {
    pub const DEFAULT_BASE_MODEL: &'static str = "meta-llama/Meta-Llama-3.1-8B-Instruct";
    pub const DEFAULT_DATA_PATH: &'static str = "training/data.jsonl";
    pub const DEFAULT_OUTPUT_DIR: &'static str = "training/output/veno-1.0-free-lora";
    pub const DEFAULT_MAX_LEN: usize = 512;

    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup.
    ///
    /// `MAX_LEN` must parse as a positive integer when present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_model =
            lookup("BASE_MODEL").unwrap_or_else(|| Self::DEFAULT_BASE_MODEL.to_string());
        let data_path = lookup("DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_DATA_PATH));
        let output_dir = lookup("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_OUTPUT_DIR));

        let max_len = match lookup("MAX_LEN") {
            Some(raw) => {
                let parsed: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("MAX_LEN must be an integer, got '{raw}'")))?;
                if parsed == 0 {
                    return Err(Error::Config("MAX_LEN must be positive".to_string()));
                }
                parsed
            }
            None => Self::DEFAULT_MAX_LEN,
        };

        Ok(Self { base_model, data_path, output_dir, max_len })
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingArgs {
    /// Examples per forward/backward pass
    pub micro_batch_size: usize,
    /// Micro-batches accumulated before one optimizer step
    pub gradient_accumulation_steps: usize,
    pub num_epochs: usize,
    pub learning_rate: f32,
    /// Global gradient norm ceiling
    pub max_grad_norm: f32,
    /// Log every N optimizer steps
    pub logging_steps: u64,
    /// Checkpoint every N optimizer steps
    pub save_steps: u64,
    /// Checkpoints retained on disk
    pub save_total_limit: usize,
    /// Seed for shuffling and adapter dropout
    pub seed: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            micro_batch_size: 1,
            gradient_accumulation_steps: 8,
            num_epochs: 2,
            learning_rate: 2e-4,
            max_grad_norm: 1.0,
            logging_steps: 10,
            save_steps: 200,
            save_total_limit: 2,
            seed: 42,
        }
    }
}
