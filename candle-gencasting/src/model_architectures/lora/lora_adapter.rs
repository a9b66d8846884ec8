//! Low-rank adapters for decoder projections.
//!
//! An adapter adds `scaling * B(A(dropout(x)))` to a frozen projection, with
//! `A: [rank, in]`, `B: [out, rank]` and `scaling = alpha / rank`. Tensor names
//! follow the PEFT layout so adapters trained elsewhere can be loaded:
//!
//! ```text
//! base_model.model.model.layers.{i}.self_attn.q_proj.lora_A.weight
//! base_model.model.model.layers.{i}.self_attn.q_proj.lora_B.weight
//! ```

use crate::core::{model_error, ConfigErrorType, ModelErrorType, UnifiedError, UnifiedResult};
use candle_core::{DType, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Prefix PEFT puts in front of decoder layer tensors.
pub const PEFT_LAYER_PREFIX: &str = "base_model.model.model.layers";

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// LoRA hyperparameters, serialized in the `adapter_config.json` layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    #[serde(rename = "r", default = "default_rank")]
    pub rank: usize,
    #[serde(rename = "lora_alpha", default = "default_alpha")]
    pub alpha: f64,
    #[serde(rename = "lora_dropout", default = "default_dropout")]
    pub dropout: f64,
    #[serde(default, deserialize_with = "one_or_many")]
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_rank() -> usize {
    32
}

fn default_alpha() -> f64 {
    16.0
}

fn default_dropout() -> f64 {
    0.1
}

fn default_bias() -> String {
    "none".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

/// PEFT writes `target_modules` either as a list or as a single string.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(module)) => vec![module],
        Some(OneOrMany::Many(modules)) => modules,
        None => Vec::new(),
    })
}

impl Default for LoRAConfig {
    fn default() -> Self {
        Self {
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: default_dropout(),
            target_modules: Vec::new(),
            bias: default_bias(),
            task_type: default_task_type(),
        }
    }
}

impl LoRAConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    pub fn validate(&self) -> UnifiedResult<()> {
        if self.rank == 0 {
            return Err(UnifiedError::validation("lora_rank", "a rank >= 1", "0"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(UnifiedError::validation(
                "lora_dropout",
                "a probability in [0, 1)",
                self.dropout.to_string(),
            ));
        }
        if self.target_modules.is_empty() {
            return Err(UnifiedError::validation(
                "target_modules",
                "at least one projection name",
                "an empty list",
            ));
        }
        Ok(())
    }

    /// Read `adapter_config.json` from an adapter directory.
    pub fn from_adapter_dir(adapter_dir: &Path) -> UnifiedResult<Self> {
        let config_path = adapter_dir.join(ADAPTER_CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            UnifiedError::configuration(
                "load adapter_config.json",
                ConfigErrorType::FileNotFound(format!("{:?}", config_path)),
                Some(e.to_string()),
            )
        })?;
        serde_json::from_str(&content).map_err(|e| {
            UnifiedError::configuration(
                "parse adapter_config.json",
                ConfigErrorType::ParseError(e.to_string()),
                None,
            )
        })
    }
}

/// One trained (or trainable) low-rank update for a single projection.
#[derive(Debug, Clone)]
pub struct LoRAAdapter {
    lora_a: Linear,
    lora_b: Linear,
    scaling: f64,
    dropout: f32,
    dtype: DType,
}

impl LoRAAdapter {
    /// Create or load an adapter. `vb` must already point at the projection
    /// (for example `...layers.3.self_attn.q_proj`).
    ///
    /// With a `VarMap`-backed builder the weights are fresh trainable
    /// variables: `A` Kaiming-initialised, `B` zero so the adapted model
    /// starts out identical to the base model.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &LoRAConfig,
        vb: VarBuilder,
    ) -> UnifiedResult<Self> {
        let a = vb
            .pp("lora_A")
            .get_with_hints(
                (config.rank, in_features),
                "weight",
                candle_nn::init::DEFAULT_KAIMING_NORMAL,
            )
            .map_err(model_error(ModelErrorType::LoRA, "load lora_A"))?;
        let b = vb
            .pp("lora_B")
            .get_with_hints((out_features, config.rank), "weight", Init::Const(0.0))
            .map_err(model_error(ModelErrorType::LoRA, "load lora_B"))?;
        let dtype = a.dtype();

        Ok(Self {
            lora_a: Linear::new(a, None),
            lora_b: Linear::new(b, None),
            scaling: config.scaling(),
            dropout: config.dropout as f32,
            dtype,
        })
    }

    pub fn rank(&self) -> usize {
        self.lora_a.weight().dim(0).unwrap_or(0)
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Low-rank delta for `x`, returned in `x`'s dtype. Dropout only applies
    /// when `train` is set.
    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let input = x.to_dtype(self.dtype)?;
        let input = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&input, self.dropout)?
        } else {
            input
        };
        let delta = self.lora_b.forward(&self.lora_a.forward(&input)?)?;
        (delta * self.scaling)?.to_dtype(x.dtype())
    }
}
