//! Example: LoRA fine-tuning on completion tokens, then scoring held-out prompts
//!
//! The training file is a JSON array of records. The text column (default
//! "prompt") holds the full example including the answer after the response
//! marker:
//!
//! ```json
//! [{"prompt": "Review: loved it\n### Answer: positive"}, ...]
//! ```
//!
//! Run with:
//! ```bash
//! cargo run --release --example finetune_lora --features cuda -- \
//!     --model ./models/mistral-7b \
//!     --train-file ./train.json \
//!     --response "### Answer:" \
//!     --class-tokens '["positive", "negative"]' \
//!     --eval-prompt "Review: dull and slow\n### Answer:"
//!
//! # Trainer options from JSON (lora_rank, lora_alpha, training_args, ...)
//! cargo run --release --example finetune_lora -- \
//!     --model ./models/mistral-7b --train-file ./train.json \
//!     --response "### Answer:" --class-tokens '["positive", "negative"]' \
//!     --options ./trainer_options.json
//! ```

use anyhow::Result;
use candle_gencasting::{
    ClassTokens, DevicePreference, ForecasterConfig, GenerativeForecaster, PromptTable,
    QuantizationMode, TrainerOptions,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local model directory or hub repository id
    #[arg(long)]
    model: String,

    /// JSON records used for training
    #[arg(long)]
    train_file: PathBuf,

    /// Marker after which tokens count towards the loss
    #[arg(long)]
    response: String,

    /// Class tokens as JSON (mapping, label list or id list)
    #[arg(long)]
    class_tokens: String,

    /// Trainer options as JSON; defaults when omitted
    #[arg(long)]
    options: Option<PathBuf>,

    /// Overrides the adapter output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Prompt scored before and after training (repeatable)
    #[arg(long = "eval-prompt")]
    eval_prompts: Vec<String>,

    /// "8bit", "4bit" or anything else for full precision
    #[arg(long, default_value = "none")]
    quantization: String,

    /// Run on CPU rather than GPU
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut options = match &args.options {
        Some(path) => TrainerOptions::from_json_file(path)?,
        None => TrainerOptions::default(),
    };
    if let Some(output_dir) = &args.output_dir {
        let mut training_args = options.resolved_training_args();
        training_args.output_dir = output_dir.clone();
        options.training_args = Some(training_args);
    }

    let mut config = ForecasterConfig::new(&args.model)
        .with_quantization(QuantizationMode::parse_lenient(&args.quantization));
    if args.cpu {
        config = config.with_device(DevicePreference::Cpu);
    }
    let class_tokens = ClassTokens::from_json_str(&args.class_tokens)?;
    let mut forecaster = GenerativeForecaster::new(config, class_tokens)?;

    if !args.eval_prompts.is_empty() {
        let before = forecaster.extract_probabilities(args.eval_prompts.clone(), Some(8))?;
        println!("Before training:\n{before}");
    }

    let train_data = PromptTable::from_json_file(&args.train_file)?;
    let mut trainer = forecaster.setup_trainer(train_data, &args.response, options)?;
    println!(
        "Training {} adapter parameters on {} examples",
        trainer.num_trainable_parameters(),
        trainer.dataset().len()
    );
    let summary = trainer.train()?;
    let adapter_dir = trainer.save_adapter()?;
    drop(trainer);

    println!(
        "Finished {} steps ({:.2} epochs, batch size {}), final loss {:?}",
        summary.global_steps,
        summary.epochs_completed,
        summary.final_batch_size,
        summary.final_loss()
    );
    if summary.examples_without_template > 0 {
        println!(
            "{} example(s) never contained {:?} and did not contribute to the loss",
            summary.examples_without_template, args.response
        );
    }
    println!("Adapter written to {}", adapter_dir.display());

    if !args.eval_prompts.is_empty() {
        let after = forecaster.extract_probabilities(args.eval_prompts.clone(), Some(8))?;
        println!("After training:\n{after}");
    }
    Ok(())
}
