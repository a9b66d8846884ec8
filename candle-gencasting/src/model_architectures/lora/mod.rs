//! LoRA adapters.

pub mod lora_adapter;

pub use lora_adapter::{
    LoRAAdapter, LoRAConfig, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, PEFT_LAYER_PREFIX,
};
