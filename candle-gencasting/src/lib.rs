//! # candle-gencasting
//!
//! Use a causal language model as a classifier: score prompts by the
//! next-token probabilities of a few class tokens, renormalized over just
//! those tokens. Models can be fine-tuned with LoRA adapters on a
//! completion-only loss.
//!
//! ## Modules
//! - [`core`]: errors and loading configuration
//! - [`model_architectures`]: decoder network, loader and LoRA adapters
//! - [`data`]: prompt datasets and right-padded batches
//! - [`forecasting`]: class tokens, the forecaster and its output table
//! - [`training`]: collator, loss and the LoRA training loop

pub mod core;
pub mod data;
pub mod forecasting;
pub mod model_architectures;
pub mod training;

pub use crate::core::{
    DevicePreference, ForecasterConfig, QuantizationMode, UnifiedError, UnifiedResult,
};
pub use data::{Batch, PromptDataset, PromptRecord, PromptSource, PromptTable};
pub use forecasting::{
    ClassTokenMap, ClassTokens, ExtractionInput, GenerativeForecaster, ProbabilityTable,
};
pub use training::{LoraTrainer, LrSchedulerType, TrainerOptions, TrainingArgs, TrainingSummary};
