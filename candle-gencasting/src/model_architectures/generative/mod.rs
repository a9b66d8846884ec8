//! Generative Model Architectures
//!
//! Decoder-only causal language models used for class-token forecasting.
//!
//! ## Models
//! - **DecoderModel**: Llama / Mistral / Qwen2 / Qwen3 decoder returning logits
//!   for every position or for each row's last real token
//!
//! ## Features
//! - Right-padded batches with a causal mask
//! - 8-bit / 4-bit GGML weight quantization
//! - LoRA adapters on any projection (PEFT tensor layout)
//! - Local directory or hub model resolution

pub mod causal_lm;
pub mod layers;
pub mod loader;

pub use causal_lm::{
    ArchitectureFamily, CausalLmConfig, DecoderModel, RopeScalingConfig, TokenIdOrList,
};
pub use layers::{Llama3RopeScaling, Projection, RmsNorm, RotaryEmbedding};
pub use loader::{
    configure_tokenizer, load_pretrained, load_tokenizer, model_dtype, resolve_model_files,
    LoadedModel, ModelFiles,
};
