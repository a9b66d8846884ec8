//! LoRA fine-tuning with a completion-only loss.

pub mod collator;
pub mod trainer;

pub use collator::{CompletionOnlyCollator, TrainingBatch, IGNORE_INDEX};
pub use trainer::{
    default_cache_dir, masked_cross_entropy, LoraTrainer, LogEntry, LrSchedulerType,
    TrainerOptions, TrainingArgs, TrainingSummary,
};
