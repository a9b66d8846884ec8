//! Example: class-token probabilities for a list of prompts
//!
//! Run with:
//! ```bash
//! cargo run --release --example classify_prompts -- \
//!     --model mistralai/Mistral-7B-v0.1 \
//!     --class-tokens '["positive", "negative"]' \
//!     --prompt "Review: a wonderful film. Sentiment:" \
//!     --prompt "Review: two hours I will never get back. Sentiment:"
//!
//! # Prompts from a JSON records file with a "prompt" column, 4-bit weights
//! cargo run --release --example classify_prompts --features cuda -- \
//!     --model ./models/mistral-7b \
//!     --class-tokens ./class_tokens.json \
//!     --prompts-file ./reviews.json \
//!     --quantization 4bit --batch-size 16
//! ```

use anyhow::{bail, Result};
use candle_gencasting::{
    ClassTokens, DevicePreference, ForecasterConfig, GenerativeForecaster, PromptDataset,
    PromptTable, QuantizationMode,
};
use clap::Parser;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local model directory or hub repository id
    #[arg(long)]
    model: String,

    /// Hub revision
    #[arg(long)]
    revision: Option<String>,

    /// Class tokens as JSON (mapping, label list or id list) or a path to a JSON file
    #[arg(long)]
    class_tokens: String,

    /// Prompt to score (repeatable)
    #[arg(long = "prompt")]
    prompts: Vec<String>,

    /// JSON records file with a "prompt" column
    #[arg(long)]
    prompts_file: Option<String>,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// "8bit", "4bit" or anything else for full precision
    #[arg(long, default_value = "none")]
    quantization: String,

    /// LoRA adapter directory to attach before scoring
    #[arg(long)]
    adapter: Option<String>,

    /// Run on CPU rather than GPU
    #[arg(long)]
    cpu: bool,
}

fn parse_class_tokens(value: &str) -> Result<ClassTokens> {
    let path = Path::new(value);
    if path.is_file() {
        Ok(ClassTokens::from_file(path)?)
    } else {
        Ok(ClassTokens::from_json_str(value)?)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let class_tokens = parse_class_tokens(&args.class_tokens)?;

    let mut config = ForecasterConfig::new(&args.model)
        .with_quantization(QuantizationMode::parse_lenient(&args.quantization));
    config.revision = args.revision.clone();
    if args.cpu {
        config = config.with_device(DevicePreference::Cpu);
    }

    println!("Loading model from: {}", args.model);
    let mut forecaster = GenerativeForecaster::new(config, class_tokens)?;
    if let Some(adapter) = &args.adapter {
        forecaster.load_adapter(Path::new(adapter))?;
    }
    if let Some(map) = forecaster.class_token_map() {
        println!("Class tokens: {map}");
    }

    let table = match &args.prompts_file {
        Some(file) => {
            let records = PromptTable::from_json_file(Path::new(file))?;
            let dataset = PromptDataset::new(records, forecaster.tokenizer()?.clone())?;
            forecaster.extract_from_dataset(&dataset, args.batch_size)?
        }
        None if !args.prompts.is_empty() => {
            forecaster.extract_probabilities(args.prompts.clone(), Some(args.batch_size))?
        }
        None => bail!("pass --prompt at least once or --prompts-file"),
    };

    println!("\n{table}");
    for (idx, label) in table.predicted_labels().iter().enumerate() {
        println!("  row {idx}: {label}");
    }
    Ok(())
}
