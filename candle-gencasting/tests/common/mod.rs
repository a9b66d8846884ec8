//! Fixtures shared by the integration tests: a word-level tokenizer that
//! prepends `<s>` and a tiny randomly initialised Llama-style decoder, so the
//! whole pipeline runs on CPU without downloads.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device};
use candle_gencasting::model_architectures::generative::{
    configure_tokenizer, CausalLmConfig, DecoderModel,
};
use candle_gencasting::QuantizationMode;
use candle_nn::{VarBuilder, VarMap};
use std::path::PathBuf;
use std::str::FromStr;
use tokenizers::Tokenizer;

pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const MAX_POSITIONS: usize = 64;

/// Word-level vocabulary; ids follow array order.
pub const VOCAB: [&str; 32] = [
    "<unk>", "<s>", "</s>", "yes", "no", "positive", "negative", "Review", "great", "bad",
    "movie", "plot", "acting", "was", "the", "a", "very", "not", "Sentiment", ":", "###",
    "Answer", "I", "liked", "hated", "it", "and", ".", "boring", "fun", "up", "down",
];

pub fn vocab_id(word: &str) -> u32 {
    VOCAB
        .iter()
        .position(|w| *w == word)
        .map(|p| p as u32)
        .unwrap_or(0)
}

fn tokenizer_json() -> String {
    let vocab: Vec<String> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| format!("{word:?}: {id}"))
        .collect();
    let added = ["<unk>", "<s>", "</s>"]
        .iter()
        .enumerate()
        .map(|(id, token)| {
            format!(
                r#"{{"id": {id}, "content": "{token}", "single_word": false, "lstrip": false,
                    "rstrip": false, "normalized": false, "special": true}}"#
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [{added}],
  "normalizer": null,
  "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": {{
    "type": "TemplateProcessing",
    "single": [{{"SpecialToken": {{"id": "<s>", "type_id": 0}}}}, {{"Sequence": {{"id": "A", "type_id": 0}}}}],
    "pair": [{{"SpecialToken": {{"id": "<s>", "type_id": 0}}}}, {{"Sequence": {{"id": "A", "type_id": 0}}}},
             {{"Sequence": {{"id": "B", "type_id": 1}}}}],
    "special_tokens": {{"<s>": {{"id": "<s>", "ids": [{BOS_ID}], "tokens": ["<s>"]}}}}
  }},
  "decoder": null,
  "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "<unk>"}}
}}"#,
        vocab.join(", ")
    )
}

/// Tokenizer with right padding (pad = `</s>`) and truncation configured.
pub fn tiny_tokenizer() -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_str(&tokenizer_json()).map_err(anyhow::Error::msg)?;
    configure_tokenizer(&mut tokenizer, EOS_ID, "</s>", MAX_POSITIONS)?;
    Ok(tokenizer)
}

pub fn tiny_config() -> Result<CausalLmConfig> {
    let config = serde_json::json!({
        "model_type": "llama",
        "vocab_size": VOCAB.len(),
        "hidden_size": 32,
        "intermediate_size": 64,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "max_position_embeddings": MAX_POSITIONS,
        "rms_norm_eps": 1e-6,
        "bos_token_id": BOS_ID,
        "eos_token_id": EOS_ID
    });
    Ok(serde_json::from_value(config)?)
}

/// A decoder whose weights live in `varmap`. Building twice from the same
/// varmap yields identical weights.
pub fn tiny_model_from(varmap: &VarMap, quantization: QuantizationMode) -> Result<DecoderModel> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    Ok(DecoderModel::new(&tiny_config()?, quantization, vb)?)
}

pub fn tiny_model() -> Result<(DecoderModel, VarMap)> {
    let varmap = VarMap::new();
    let model = tiny_model_from(&varmap, QuantizationMode::None)?;
    Ok((model, varmap))
}

/// Fresh directory under the system temp dir, unique per test name.
pub fn scratch_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("gencasting-{name}-{}", std::process::id()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn assert_rows_are_distributions(rows: &[Vec<f32>]) {
    for row in rows {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "row {row:?} sums to {sum}");
        assert!(row.iter().all(|p| (0.0..=1.0).contains(p)), "row {row:?} out of range");
    }
}
