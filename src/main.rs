//! Fine-tuning entry point.
//!
//! Configuration comes from the environment:
//!
//! ```bash
//! BASE_MODEL=models/llama DATA_PATH=training/data.jsonl \
//!     OUTPUT_DIR=training/output MAX_LEN=512 afinar
//! ```

use afinar::config::RunConfig;
use afinar::pipeline;
use std::process::ExitCode;

fn main() -> ExitCode {
    let config = match RunConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match pipeline::run(&config) {
        Ok(path) => {
            println!("Saved LoRA adapter to: {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
