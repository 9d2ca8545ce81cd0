//! Supervised fine-tuning loop with gradient accumulation and checkpoints.

mod checkpoint;
mod sft;

pub use checkpoint::{checkpoint_steps, save_checkpoint};
pub use sft::{causal_lm_loss, SftTrainer};

use crate::config::TrainingArgs;
use crate::model::CausalModel;
use crate::tokenizer::TokenizedExample;
use crate::Result;
use std::path::Path;

/// Outcome of a completed training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// Mean loss of the last micro-batch
    pub final_loss: f32,
    /// Optimizer steps taken
    pub global_steps: u64,
    pub epochs: usize,
}

/// A training procedure over tokenized examples.
///
/// The pipeline drives training through this trait so runs can be exercised
/// with a stub loop in tests.
pub trait TrainLoop {
    fn run(
        &mut self,
        model: &mut CausalModel,
        data: &[TokenizedExample],
        args: &TrainingArgs,
        output_dir: &Path,
    ) -> Result<TrainSummary>;
}
