//! Decoder-only causal language model (Llama / Mistral / Qwen2 / Qwen3).
//!
//! The network returns logits for every position, unlike the stock
//! `candle_transformers` heads which only keep the last one. That matters for
//! right-padded batches: the last *real* token sits at a different position in
//! each row.
//!
//! There is no KV cache; every call is a full forward pass over the batch.
//!
//! ## Usage Example
//! ```ignore
//! let config = CausalLmConfig::from_file(Path::new("./models/tiny/config.json"))?;
//! let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, DType::F32, &device)? };
//! let model = DecoderModel::new(&config, QuantizationMode::None, vb)?;
//! let logits = model.last_token_logits(&input_ids, &[12, 7])?; // [2, vocab]
//! ```

use super::layers::{Llama3RopeScaling, Projection, RmsNorm, RotaryEmbedding};
use crate::core::{
    model_error, processing, ConfigErrorType, ModelErrorType, QuantizationMode, UnifiedError,
    UnifiedResult,
};
use crate::model_architectures::lora::{LoRAConfig, PEFT_LAYER_PREFIX};
use candle_core::quantized::GgmlDType;
use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Embedding, VarBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// `bos_token_id` / `eos_token_id` are a single id or a list in `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIdOrList {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIdOrList {
    pub fn first(&self) -> Option<u32> {
        match self {
            Self::Single(id) => Some(*id),
            Self::Many(ids) => ids.first().copied(),
        }
    }
}

/// `rope_scaling` block of `config.json`. Older files name the kind `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeScalingConfig {
    #[serde(default)]
    pub rope_type: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub legacy_type: Option<String>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub low_freq_factor: Option<f64>,
    #[serde(default)]
    pub high_freq_factor: Option<f64>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
}

impl RopeScalingConfig {
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.legacy_type.as_deref())
            .unwrap_or("default")
    }
}

/// The subset of `config.json` the decoder needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalLmConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    #[serde(default)]
    pub attention_bias: Option<bool>,
    #[serde(default)]
    pub mlp_bias: Option<bool>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<TokenIdOrList>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIdOrList>,
}

fn default_model_type() -> String {
    "llama".to_string()
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

impl CausalLmConfig {
    pub fn from_file(config_path: &Path) -> UnifiedResult<Self> {
        let config_str = std::fs::read_to_string(config_path).map_err(|e| {
            UnifiedError::configuration(
                "config file loading",
                ConfigErrorType::FileNotFound(format!("{:?}", config_path)),
                Some(e.to_string()),
            )
        })?;
        serde_json::from_str(&config_str).map_err(|e| {
            UnifiedError::configuration(
                "config JSON parsing",
                ConfigErrorType::ParseError(e.to_string()),
                Some(format!("{:?}", config_path)),
            )
        })
    }

    pub fn family(&self) -> UnifiedResult<ArchitectureFamily> {
        ArchitectureFamily::from_model_type(&self.model_type)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// RoPE frequency scaling to apply. Only the Llama 3 scheme is
    /// implemented; any other non-default `rope_scaling` is rejected.
    pub fn llama3_rope_scaling(&self) -> UnifiedResult<Option<Llama3RopeScaling>> {
        let Some(scaling) = &self.rope_scaling else {
            return Ok(None);
        };
        match scaling.kind() {
            "default" => Ok(None),
            "llama3" => {
                let missing = |name: &str| {
                    UnifiedError::configuration(
                        "read rope_scaling",
                        ConfigErrorType::InvalidData(format!("llama3 rope_scaling without {name}")),
                        Some(format!("model_type {}", self.model_type)),
                    )
                };
                Ok(Some(Llama3RopeScaling {
                    factor: scaling.factor.ok_or_else(|| missing("factor"))?,
                    low_freq_factor: scaling
                        .low_freq_factor
                        .ok_or_else(|| missing("low_freq_factor"))?,
                    high_freq_factor: scaling
                        .high_freq_factor
                        .ok_or_else(|| missing("high_freq_factor"))?,
                    original_max_position_embeddings: scaling
                        .original_max_position_embeddings
                        .ok_or_else(|| missing("original_max_position_embeddings"))?,
                }))
            }
            other => Err(UnifiedError::configuration(
                "read rope_scaling",
                ConfigErrorType::Unsupported(format!("rope_type '{other}'")),
                Some("supported: default, llama3".to_string()),
            )),
        }
    }
}

/// Decoder families that share the RMSNorm / RoPE / GQA / SwiGLU layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchitectureFamily {
    Llama,
    Mistral,
    Qwen2,
    Qwen3,
}

impl ArchitectureFamily {
    pub fn from_model_type(model_type: &str) -> UnifiedResult<Self> {
        match model_type {
            "llama" => Ok(Self::Llama),
            "mistral" => Ok(Self::Mistral),
            "qwen2" => Ok(Self::Qwen2),
            "qwen3" => Ok(Self::Qwen3),
            other => Err(UnifiedError::configuration(
                "resolve architecture",
                ConfigErrorType::Unsupported(format!("model_type '{other}'")),
                Some("supported: llama, mistral, qwen2, qwen3".to_string()),
            )),
        }
    }

    /// Qwen2 puts biases on q/k/v; the others only when the config says so.
    fn qkv_bias(&self, config: &CausalLmConfig) -> bool {
        match self {
            Self::Qwen2 => config.attention_bias.unwrap_or(true),
            _ => config.attention_bias.unwrap_or(false),
        }
    }

    /// Qwen2 never biases `o_proj`; the others follow `attention_bias`.
    fn o_bias(&self, config: &CausalLmConfig) -> bool {
        match self {
            Self::Qwen2 => false,
            _ => config.attention_bias.unwrap_or(false),
        }
    }

    /// Qwen3 normalizes each head's queries and keys before RoPE.
    fn qk_norm(&self) -> bool {
        matches!(self, Self::Qwen3)
    }

    /// Projections that receive adapters when the caller does not choose.
    pub fn default_lora_targets(&self) -> Vec<String> {
        ["q_proj", "v_proj"].iter().map(|t| t.to_string()).collect()
    }
}

impl std::fmt::Display for ArchitectureFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Llama => "llama",
            Self::Mistral => "mistral",
            Self::Qwen2 => "qwen2",
            Self::Qwen3 => "qwen3",
        };
        f.write_str(name)
    }
}

/// Multi-head attention with grouped-query heads.
struct Attention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rotary_emb: Arc<RotaryEmbedding>,
}

impl Attention {
    fn new(
        config: &CausalLmConfig,
        family: ArchitectureFamily,
        rotary_emb: Arc<RotaryEmbedding>,
        quantize: Option<GgmlDType>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let bias = family.qkv_bias(config);

        let q_proj = Projection::load("q_proj", hidden_size, num_heads * head_dim, bias, quantize, vb.pp("q_proj"))?;
        let k_proj = Projection::load("k_proj", hidden_size, num_kv_heads * head_dim, bias, quantize, vb.pp("k_proj"))?;
        let v_proj = Projection::load("v_proj", hidden_size, num_kv_heads * head_dim, bias, quantize, vb.pp("v_proj"))?;
        let o_proj = Projection::load("o_proj", num_heads * head_dim, hidden_size, family.o_bias(config), quantize, vb.pp("o_proj"))?;

        let (q_norm, k_norm) = if family.qk_norm() {
            (
                Some(RmsNorm::load(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?),
                Some(RmsNorm::load(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
            rotary_emb,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self
            .q_proj
            .forward(hidden_states, train)?
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(hidden_states, train)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(hidden_states, train)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = match &self.q_norm {
            Some(norm) => norm.forward(&q.contiguous()?)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(norm) => norm.forward(&k.contiguous()?)?,
            None => k,
        };

        let (q, k) = self.rotary_emb.apply(&q, &k, seq_len, train)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.contiguous()?.matmul(&k.t()?)? * scale)?
            .broadcast_add(&mask.to_dtype(q.dtype())?)?
            .to_dtype(DType::F32)?;
        let attn_weights = if train {
            candle_nn::ops::softmax(&attn_weights, D::Minus1)?
        } else {
            candle_nn::ops::softmax_last_dim(&attn_weights)?
        };
        let attn_output = attn_weights
            .to_dtype(v.dtype())?
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&attn_output, train)
    }

    fn projections(&self) -> [&Projection; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
    }

    fn projections_mut(&mut self) -> [&mut Projection; 4] {
        [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.o_proj,
        ]
    }
}

/// SwiGLU feed-forward block.
struct Mlp {
    gate_proj: Projection,
    up_proj: Projection,
    down_proj: Projection,
}

impl Mlp {
    fn new(config: &CausalLmConfig, quantize: Option<GgmlDType>, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;
        let bias = config.mlp_bias.unwrap_or(false);
        Ok(Self {
            gate_proj: Projection::load("gate_proj", hidden_size, intermediate_size, bias, quantize, vb.pp("gate_proj"))?,
            up_proj: Projection::load("up_proj", hidden_size, intermediate_size, bias, quantize, vb.pp("up_proj"))?,
            down_proj: Projection::load("down_proj", intermediate_size, hidden_size, bias, quantize, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(hidden_states, train)?)?;
        let up = self.up_proj.forward(hidden_states, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }

    fn projections(&self) -> [&Projection; 3] {
        [&self.gate_proj, &self.up_proj, &self.down_proj]
    }

    fn projections_mut(&mut self) -> [&mut Projection; 3] {
        [&mut self.gate_proj, &mut self.up_proj, &mut self.down_proj]
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        config: &CausalLmConfig,
        family: ArchitectureFamily,
        rotary_emb: Arc<RotaryEmbedding>,
        quantize: Option<GgmlDType>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(config, family, rotary_emb, quantize, vb.pp("self_attn"))?,
            mlp: Mlp::new(config, quantize, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::load(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let residual = hidden_states;
        let attn = self
            .self_attn
            .forward(&self.input_layernorm.forward(hidden_states)?, mask, train)?;
        let hidden_states = (attn + residual)?;
        let mlp = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&hidden_states)?, train)?;
        mlp + hidden_states
    }
}

/// A loaded decoder: embeddings, transformer stack, final norm and LM head.
pub struct DecoderModel {
    config: CausalLmConfig,
    family: ArchitectureFamily,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Projection,
    device: Device,
    dtype: DType,
}

impl DecoderModel {
    /// Build the network from `vb` (HF tensor names: `model.layers.{i}...`,
    /// `model.norm`, `lm_head`). Projections inside the transformer stack are
    /// quantized according to `quantization`; embeddings, norms and the LM head
    /// stay in full precision.
    pub fn new(
        config: &CausalLmConfig,
        quantization: QuantizationMode,
        vb: VarBuilder,
    ) -> UnifiedResult<Self> {
        let family = config.family()?;
        if config.num_attention_heads % config.num_kv_heads() != 0 {
            return Err(UnifiedError::configuration(
                "validate config",
                ConfigErrorType::InvalidData(format!(
                    "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                    config.num_attention_heads,
                    config.num_kv_heads()
                )),
                None,
            ));
        }

        let rope_scaling = config.llama3_rope_scaling()?;

        let device = vb.device().clone();
        let dtype = vb.dtype();
        let quantize = quantization.ggml_dtype();
        let build_err = |operation: &str, e: candle_core::Error| {
            UnifiedError::configuration(
                operation.to_string(),
                ConfigErrorType::InvalidData(e.to_string()),
                Some(format!("model_type {}", config.model_type)),
            )
        };

        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("model.embed_tokens"),
        )
        .map_err(|e| build_err("create embeddings", e))?;

        let rotary_emb = Arc::new(
            RotaryEmbedding::new(
                config.head_dim(),
                config.max_position_embeddings,
                config.rope_theta,
                rope_scaling.as_ref(),
                dtype,
                &device,
            )
            .map_err(|e| build_err("create rotary embedding", e))?,
        );

        tracing::info!(
            "Building {} decoder: {} layers, hidden={}, vocab={}, quantization={:?}",
            family,
            config.num_hidden_layers,
            config.hidden_size,
            config.vocab_size,
            quantization
        );
        let layers_vb = vb.pp("model.layers");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for layer_idx in 0..config.num_hidden_layers {
            let layer = DecoderLayer::new(
                config,
                family,
                rotary_emb.clone(),
                quantize,
                layers_vb.pp(layer_idx),
            )
            .map_err(|e| build_err(&format!("load layer {layer_idx}"), e))?;
            layers.push(layer);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))
            .map_err(|e| build_err("load final norm", e))?;

        let lm_head = if config.tie_word_embeddings || !vb.contains_tensor("lm_head.weight") {
            Projection::from_weight("lm_head", embed_tokens.embeddings().clone())
        } else {
            Projection::load(
                "lm_head",
                config.hidden_size,
                config.vocab_size,
                false,
                None,
                vb.pp("lm_head"),
            )
            .map_err(|e| build_err("create lm_head", e))?
        };

        Ok(Self {
            config: config.clone(),
            family,
            embed_tokens,
            layers,
            norm,
            lm_head,
            device,
            dtype,
        })
    }

    pub fn config(&self) -> &CausalLmConfig {
        &self.config
    }

    pub fn family(&self) -> ArchitectureFamily {
        self.family
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn causal_mask(&self, seq_len: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Tensor::from_slice(&mask, (seq_len, seq_len), &self.device)
    }

    /// Final-norm hidden states, `[batch, seq, hidden]`.
    fn forward_hidden(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let mask = self.causal_mask(seq_len)?;
        let mut hidden_states = self.embed_tokens.forward(input_ids)?.to_dtype(self.dtype)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask, train)?;
        }
        self.norm.forward(&hidden_states)
    }

    /// Logits for every position, `[batch, seq, vocab]`.
    pub fn forward(&self, input_ids: &Tensor, train: bool) -> UnifiedResult<Tensor> {
        let hidden_states = self
            .forward_hidden(input_ids, train)
            .map_err(processing("decoder forward"))?;
        self.lm_head
            .forward(&hidden_states, train)
            .map_err(model_error(ModelErrorType::LmHead, "forward lm_head"))
    }

    /// Logits at each row's last real token, `[batch, vocab]`, in F32.
    ///
    /// `lengths[i]` is the unpadded length of row `i`; the LM head only runs on
    /// the selected positions.
    pub fn last_token_logits(&self, input_ids: &Tensor, lengths: &[usize]) -> UnifiedResult<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        if lengths.len() != batch_size {
            return Err(UnifiedError::validation(
                "lengths",
                format!("{batch_size} entries"),
                lengths.len().to_string(),
            ));
        }
        if let Some((row, len)) = lengths
            .iter()
            .enumerate()
            .find(|(_, len)| **len == 0 || **len > seq_len)
        {
            return Err(UnifiedError::validation(
                "lengths",
                format!("a length in 1..={seq_len}"),
                len.to_string(),
            )
            .with_context(format!("row {row}")));
        }

        let hidden_states = self
            .forward_hidden(input_ids, false)
            .map_err(processing("decoder forward"))?
            .detach();
        let last_hidden = lengths
            .iter()
            .enumerate()
            .map(|(row, &len)| hidden_states.i((row, len - 1)))
            .collect::<Result<Vec<_>>>()
            .map_err(processing("gather last token hidden states"))?;
        let last_hidden = Tensor::stack(&last_hidden, 0).map_err(processing("stack hidden states"))?;

        self.lm_head
            .forward(&last_hidden, false)
            .and_then(|logits| logits.to_dtype(DType::F32))
            .map_err(model_error(ModelErrorType::LmHead, "forward lm_head"))
    }

    /// Attach fresh (or loaded) adapters to every projection named in
    /// `config.target_modules`, replacing existing ones. Returns how many
    /// projections were adapted.
    pub fn attach_lora(&mut self, config: &LoRAConfig, vb: VarBuilder) -> UnifiedResult<usize> {
        self.detach_lora();
        let mut attached = 0;
        for (layer_idx, layer) in self.layers.iter_mut().enumerate() {
            let layer_vb = vb.pp(format!("{PEFT_LAYER_PREFIX}.{layer_idx}"));
            for proj in layer.self_attn.projections_mut() {
                if config.targets(proj.name()) {
                    proj.attach_lora(config, layer_vb.pp("self_attn").pp(proj.name()))?;
                    attached += 1;
                }
            }
            for proj in layer.mlp.projections_mut() {
                if config.targets(proj.name()) {
                    proj.attach_lora(config, layer_vb.pp("mlp").pp(proj.name()))?;
                    attached += 1;
                }
            }
        }
        if attached == 0 {
            return Err(UnifiedError::validation(
                "target_modules",
                "names of decoder projections (q_proj, k_proj, v_proj, o_proj, gate_proj, up_proj, down_proj)",
                format!("{:?}", config.target_modules),
            ));
        }
        tracing::info!(
            "Attached LoRA adapters to {} projections (r={}, alpha={})",
            attached,
            config.rank,
            config.alpha
        );
        Ok(attached)
    }

    pub fn detach_lora(&mut self) {
        for layer in &mut self.layers {
            for proj in layer.self_attn.projections_mut() {
                proj.detach_lora();
            }
            for proj in layer.mlp.projections_mut() {
                proj.detach_lora();
            }
        }
    }

    pub fn num_adapted_projections(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| {
                let attn = layer.self_attn.projections().into_iter().filter(|p| p.has_adapter()).count();
                let mlp = layer.mlp.projections().into_iter().filter(|p| p.has_adapter()).count();
                attn + mlp
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn config_json(model_type: &str) -> String {
        format!(
            r#"{{"model_type": "{model_type}", "vocab_size": 32, "hidden_size": 16,
                "intermediate_size": 32, "num_hidden_layers": 2, "num_attention_heads": 4,
                "num_key_value_heads": 2, "max_position_embeddings": 64,
                "eos_token_id": [2, 7], "head_dim": null}}"#
        )
    }

    #[test]
    fn test_config_defaults_and_derived_sizes() {
        let config: CausalLmConfig = serde_json::from_str(&config_json("mistral")).unwrap();
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.rope_theta, 10_000.0);
        assert_eq!(config.eos_token_id.as_ref().and_then(|e| e.first()), Some(2));
        assert_eq!(config.family().unwrap(), ArchitectureFamily::Mistral);
    }

    #[test]
    fn test_unknown_family_is_configuration_error() {
        let config: CausalLmConfig = serde_json::from_str(&config_json("gpt2")).unwrap();
        assert!(config.family().unwrap_err().is_configuration());
    }

    #[test]
    fn test_family_bias_and_norm_rules() {
        let config: CausalLmConfig = serde_json::from_str(&config_json("qwen2")).unwrap();
        assert!(ArchitectureFamily::Qwen2.qkv_bias(&config));
        assert!(!ArchitectureFamily::Llama.qkv_bias(&config));
        assert!(ArchitectureFamily::Qwen3.qk_norm());
        assert!(!ArchitectureFamily::Qwen2.o_bias(&config));
        assert_eq!(
            ArchitectureFamily::Mistral.default_lora_targets(),
            vec!["q_proj".to_string(), "v_proj".to_string()]
        );
    }

    fn config_with(model_type: &str, extra: serde_json::Value) -> CausalLmConfig {
        let mut value: serde_json::Value = serde_json::from_str(&config_json(model_type)).unwrap();
        for (key, field) in extra.as_object().unwrap() {
            value[key] = field.clone();
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_llama3_rope_scaling_is_read() {
        let config = config_with(
            "llama",
            serde_json::json!({"rope_scaling": {
                "rope_type": "llama3", "factor": 8.0, "low_freq_factor": 1.0,
                "high_freq_factor": 4.0, "original_max_position_embeddings": 8192
            }}),
        );
        let scaling = config.llama3_rope_scaling().unwrap().unwrap();
        assert_eq!(scaling.factor, 8.0);
        assert_eq!(scaling.original_max_position_embeddings, 8192);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(DecoderModel::new(&config, QuantizationMode::None, vb).is_ok());
    }

    #[test]
    fn test_other_rope_scaling_is_rejected() {
        let config = config_with("qwen2", serde_json::json!({"rope_scaling": {"type": "yarn", "factor": 4.0}}));
        let err = config.llama3_rope_scaling().unwrap_err();
        assert!(matches!(
            err,
            UnifiedError::Configuration { source: ConfigErrorType::Unsupported(_), .. }
        ));

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = DecoderModel::new(&config, QuantizationMode::None, vb).err().unwrap();
        assert!(err.is_configuration());

        let incomplete = config_with("llama", serde_json::json!({"rope_scaling": {"rope_type": "llama3"}}));
        assert!(incomplete.llama3_rope_scaling().unwrap_err().is_configuration());

        let default = config_with("llama", serde_json::json!({"rope_scaling": {"rope_type": "default"}}));
        assert!(default.llama3_rope_scaling().unwrap().is_none());
        assert!(config_with("llama", serde_json::json!({"rope_scaling": null}))
            .llama3_rope_scaling()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_attention_and_mlp_bias_are_loaded() {
        let config = config_with("llama", serde_json::json!({"attention_bias": true, "mlp_bias": true}));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DecoderModel::new(&config, QuantizationMode::None, vb).unwrap();
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            let name = format!("model.layers.0.self_attn.{proj}.bias");
            assert!(names.contains(&name), "missing {name}");
        }
        for proj in ["gate_proj", "up_proj", "down_proj"] {
            let name = format!("model.layers.1.mlp.{proj}.bias");
            assert!(names.contains(&name), "missing {name}");
        }

        let qwen2 = config_with("qwen2", serde_json::json!({}));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DecoderModel::new(&qwen2, QuantizationMode::None, vb).unwrap();
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"model.layers.0.self_attn.q_proj.bias".to_string()));
        assert!(!names.iter().any(|n| n.ends_with("o_proj.bias") || n.contains("mlp.gate_proj.bias")));
    }

    #[test]
    fn test_missing_config_file() {
        let err = CausalLmConfig::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(err.is_configuration());
    }
}
