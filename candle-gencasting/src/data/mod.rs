//! Prompt datasets and batch collation.

pub mod prompt_dataset;

pub use prompt_dataset::{
    Batch, BatchIter, PromptDataset, PromptRecord, PromptSource, PromptTable, DEFAULT_TEXT_COLUMN,
};
