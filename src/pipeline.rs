//! End-to-end fine-tuning run: corpus to saved adapter directory.

use crate::config::{RunConfig, TrainingArgs};
use crate::corpus;
use crate::model::{inject_adapters, CausalModel, LoraConfig, Precision};
use crate::template::format_example;
use crate::tokenizer::{BpeTokenizer, TokenizerAdapter};
use crate::train::{SftTrainer, TrainLoop};
use crate::{artifact, Error, Result};
use std::path::{Path, PathBuf};

/// Run the full pipeline with the standard trainer and default
/// hyperparameters. Returns the adapter output directory.
pub fn run(config: &RunConfig) -> Result<PathBuf> {
    let lora = LoraConfig::default();
    let mut trainer = SftTrainer::new(lora.clone(), config.base_model.clone());
    run_with_trainer(config, &TrainingArgs::default(), &lora, &mut trainer)
}

/// Run the pipeline with an explicit trainer, hyperparameters, and adapter
/// configuration. The same `lora` must describe the adapters the trainer
/// writes into its checkpoints.
///
/// The base model identifier must be a local directory containing
/// `config.json`, `model.safetensors`, and `tokenizer.json`.
pub fn run_with_trainer(
    config: &RunConfig,
    args: &TrainingArgs,
    lora: &LoraConfig,
    trainer: &mut dyn TrainLoop,
) -> Result<PathBuf> {
    let digest = corpus::hash_file(&config.data_path)?;
    println!("corpus {} ({digest})", config.data_path.display());

    let records = corpus::load_records(&config.data_path)?;
    println!("loaded {} records", records.len());

    let model_dir = Path::new(&config.base_model);
    let mut model = CausalModel::from_pretrained(model_dir, Precision::Int4)?;
    model.prepare_for_kbit_training()?;

    // Sequences longer than the model's position table cannot run a forward
    // pass, so the model bound wins over MAX_LEN
    let max_len = config.max_len.min(model.config().max_position_embeddings);
    let tokenizer = BpeTokenizer::from_file(model_dir.join("tokenizer.json"))?;
    let tokenizer = TokenizerAdapter::new(tokenizer, max_len);

    let data: Vec<_> = records
        .iter()
        .map(|record| tokenizer.encode(&format_example(record)))
        .collect();

    let vocab = model.config().vocab_size;
    for (idx, example) in data.iter().enumerate() {
        if let Some(&id) = example.input_ids.iter().find(|&&id| id as usize >= vocab) {
            return Err(Error::Model(format!(
                "record {}: token id {id} is outside the model vocabulary of {vocab}; \
                 tokenizer.json and config.json disagree",
                idx + 1
            )));
        }
    }

    inject_adapters(&mut model, lora, args.seed)?;

    let summary = trainer.run(&mut model, &data, args, &config.output_dir)?;
    println!(
        "finished: loss {:.4} after {} steps over {} epochs",
        summary.final_loss, summary.global_steps, summary.epochs
    );

    artifact::save_adapter(&model, lora, &config.base_model, &config.output_dir)?;
    tokenizer.tokenizer().save_pretrained(&config.output_dir)?;

    Ok(config.output_dir.clone())
}
