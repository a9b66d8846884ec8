//! Model architectures: the decoder network and its LoRA adapters.

pub mod generative;
pub mod lora;
