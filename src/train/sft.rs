//! Causal LM loss and the supervised fine-tuning trainer.

use super::{save_checkpoint, TrainLoop, TrainSummary};
use crate::config::TrainingArgs;
use crate::model::{CausalModel, LoraConfig};
use crate::optim::{clip_grad_norm, AdamW, Optimizer};
use crate::tokenizer::TokenizedExample;
use crate::{Error, Result};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

/// Shifted next-token cross-entropy over one sequence.
///
/// Position `pos` predicts `labels[pos + 1]`; the position counts only when
/// `mask[pos + 1] == 1`. Returns the mean loss over counted positions and
/// the gradient w.r.t. the logits (seq_len x vocab, flattened), already
/// divided by the number of counted positions. `None` when no position
/// counts, e.g. a single-token sequence.
pub fn causal_lm_loss(
    logits: &[f32],
    labels: &[u32],
    mask: &[u32],
    vocab_size: usize,
) -> Option<(f32, Vec<f32>)> {
    let seq_len = labels.len();
    debug_assert_eq!(logits.len(), seq_len * vocab_size);
    debug_assert_eq!(mask.len(), seq_len);

    let counted: Vec<usize> = (0..seq_len.saturating_sub(1))
        .filter(|&pos| mask[pos + 1] == 1)
        .collect();
    if counted.is_empty() {
        return None;
    }
    let inv_n = 1.0 / counted.len() as f32;

    let mut total_loss = 0.0f32;
    let mut grad = vec![0.0f32; logits.len()];

    for &pos in &counted {
        let row = &logits[pos * vocab_size..(pos + 1) * vocab_size];
        let target = labels[pos + 1] as usize;

        // Stable log-softmax
        let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let sum_exp: f32 = row.iter().map(|&v| (v - max).exp()).sum();
        let log_sum = sum_exp.ln();

        total_loss -= row[target] - max - log_sum;

        let grad_row = &mut grad[pos * vocab_size..(pos + 1) * vocab_size];
        for (g, &v) in grad_row.iter_mut().zip(row.iter()) {
            *g = (v - max).exp() / sum_exp * inv_n;
        }
        grad_row[target] -= inv_n;
    }

    Some((total_loss * inv_n, grad))
}

/// Instruction-tuning trainer: AdamW over the adapter parameters with
/// gradient accumulation, global-norm clipping, and rotating checkpoints.
pub struct SftTrainer {
    lora: LoraConfig,
    base_model: String,
}

impl SftTrainer {
    pub fn new(lora: LoraConfig, base_model: impl Into<String>) -> Self {
        Self { lora, base_model: base_model.into() }
    }
}

impl TrainLoop for SftTrainer {
    fn run(
        &mut self,
        model: &mut CausalModel,
        data: &[TokenizedExample],
        args: &TrainingArgs,
        output_dir: &Path,
    ) -> Result<TrainSummary> {
        if data.is_empty() {
            return Err(Error::Training("no training examples".into()));
        }
        let mut params = model.trainable_parameters();
        if params.is_empty() {
            return Err(Error::Training("model has no trainable parameters".into()));
        }

        let vocab = model.config().vocab_size;
        let accum = args.gradient_accumulation_steps.max(1);
        let inv_accum = 1.0 / accum as f32;
        let mut optimizer = AdamW::default_params(args.learning_rate);
        let mut rng = StdRng::seed_from_u64(args.seed);

        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut global_step = 0u64;
        let mut last_loss = 0.0f32;

        println!(
            "training {} examples for {} epochs ({} trainable tensors)",
            data.len(),
            args.num_epochs,
            params.len()
        );

        for epoch in 0..args.num_epochs {
            order.shuffle(&mut rng);
            let num_batches = order.len().div_ceil(args.micro_batch_size.max(1));

            for (batch_idx, batch) in order.chunks(args.micro_batch_size.max(1)).enumerate() {
                if batch_idx % accum == 0 {
                    optimizer.zero_grad(&mut params);
                }

                let mut batch_loss = 0.0f32;
                let mut counted = 0usize;
                for &example_idx in batch {
                    let example = &data[example_idx];
                    let logits = model.forward(&example.input_ids);
                    let loss_grad = {
                        let logits_data = logits.data();
                        causal_lm_loss(
                            logits_data.as_slice().ok_or_else(|| {
                                Error::Training("non-contiguous logits".into())
                            })?,
                            &example.labels,
                            &example.attention_mask,
                            vocab,
                        )
                    };
                    let Some((loss, grad)) = loss_grad else { continue };
                    if !loss.is_finite() {
                        return Err(Error::Training(format!(
                            "non-finite loss at step {global_step}, epoch {epoch}"
                        )));
                    }
                    // Scale so a full accumulation cycle averages its batches
                    logits.set_grad(Array1::from(grad) * inv_accum);
                    logits.backward();
                    batch_loss += loss;
                    counted += 1;
                }
                if counted > 0 {
                    last_loss = batch_loss / counted as f32;
                }

                let cycle_complete = (batch_idx + 1) % accum == 0;
                let last_batch = batch_idx + 1 == num_batches;
                if cycle_complete || last_batch {
                    clip_grad_norm(&params, args.max_grad_norm);
                    optimizer.step(&mut params);
                    global_step += 1;

                    if args.logging_steps > 0 && global_step % args.logging_steps == 0 {
                        println!(
                            "epoch {}/{} step {global_step} loss {last_loss:.4}",
                            epoch + 1,
                            args.num_epochs
                        );
                    }
                    if args.save_steps > 0 && global_step % args.save_steps == 0 {
                        let dir = save_checkpoint(
                            model,
                            &self.lora,
                            &self.base_model,
                            output_dir,
                            global_step,
                            args.save_total_limit,
                        )?;
                        println!("saved checkpoint {}", dir.display());
                    }
                }
            }
        }

        Ok(TrainSummary { final_loss: last_loss, global_steps: global_step, epochs: args.num_epochs })
    }
}
