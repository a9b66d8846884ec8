//! Resolve a model identifier to files on disk and load model + tokenizer.
//!
//! A model identifier is either a local directory or a hub repository id.
//! Both must provide `config.json`, `tokenizer.json` and safetensors weights
//! (`model.safetensors` or a sharded `model.safetensors.index.json`).

use super::causal_lm::{CausalLmConfig, DecoderModel};
use crate::core::{ConfigErrorType, ForecasterConfig, UnifiedError, UnifiedResult};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Paths of everything needed to build a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

/// Where model files come from.
enum FileSource {
    Local(PathBuf),
    Hub(Box<ApiRepo>),
}

impl FileSource {
    fn get(&self, filename: &str) -> UnifiedResult<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(filename);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(UnifiedError::configuration(
                        format!("locate {filename}"),
                        ConfigErrorType::FileNotFound(format!("{:?}", path)),
                        None,
                    ))
                }
            }
            Self::Hub(repo) => repo.get(filename).map_err(|e| {
                UnifiedError::configuration(
                    format!("download {filename}"),
                    ConfigErrorType::Download(e.to_string()),
                    None,
                )
            }),
        }
    }
}

/// Find config, tokenizer and weights for `model_id`.
///
/// An existing local directory wins over a hub id of the same name.
pub fn resolve_model_files(model_id: &str, revision: Option<&str>) -> UnifiedResult<ModelFiles> {
    let local = Path::new(model_id);
    let source = if local.is_dir() {
        tracing::info!("Loading model from local directory {:?}", local);
        FileSource::Local(local.to_path_buf())
    } else {
        tracing::info!(
            "Resolving model {} (revision {}) from the hub",
            model_id,
            revision.unwrap_or("main")
        );
        let api = Api::new().map_err(|e| {
            UnifiedError::configuration(
                "initialize hub client",
                ConfigErrorType::Download(e.to_string()),
                Some(model_id.to_string()),
            )
        })?;
        let repo = match revision {
            Some(rev) => Repo::with_revision(model_id.to_string(), RepoType::Model, rev.to_string()),
            None => Repo::model(model_id.to_string()),
        };
        FileSource::Hub(Box::new(api.repo(repo)))
    };

    let config = source.get(CONFIG_FILE)?;
    let tokenizer = source.get(TOKENIZER_FILE)?;
    let tokenizer_config = source.get(TOKENIZER_CONFIG_FILE).ok();

    let weights = match source.get(SINGLE_WEIGHTS_FILE) {
        Ok(path) => vec![path],
        Err(single_err) => {
            let index = source.get(WEIGHTS_INDEX_FILE).map_err(|_| single_err)?;
            shard_names(&index)?
                .iter()
                .map(|shard| source.get(shard))
                .collect::<UnifiedResult<Vec<_>>>()?
        }
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

/// Distinct shard filenames listed in a safetensors index, in sorted order.
fn shard_names(index_path: &Path) -> UnifiedResult<Vec<String>> {
    let content = std::fs::read_to_string(index_path).map_err(|e| {
        UnifiedError::configuration(
            "read weights index",
            ConfigErrorType::FileNotFound(format!("{:?}", index_path)),
            Some(e.to_string()),
        )
    })?;
    let index: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        UnifiedError::configuration(
            "parse weights index",
            ConfigErrorType::ParseError(e.to_string()),
            Some(format!("{:?}", index_path)),
        )
    })?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| {
            UnifiedError::configuration(
                "parse weights index",
                ConfigErrorType::InvalidData("missing weight_map".to_string()),
                Some(format!("{:?}", index_path)),
            )
        })?;
    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

/// Look up the EOS token: `tokenizer_config.json` first, then `config.json`.
fn resolve_eos(
    tokenizer: &Tokenizer,
    tokenizer_config: Option<&Path>,
    config: &CausalLmConfig,
) -> Option<(u32, String)> {
    let from_tokenizer_config = tokenizer_config
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|value| {
            let eos = value.get("eos_token")?;
            // Either a plain string or an AddedToken object with "content".
            eos.as_str()
                .or_else(|| eos.get("content").and_then(|c| c.as_str()))
                .map(str::to_string)
        })
        .and_then(|token| tokenizer.token_to_id(&token).map(|id| (id, token)));

    from_tokenizer_config.or_else(|| {
        let id = config.eos_token_id.as_ref()?.first()?;
        let token = tokenizer.id_to_token(id)?;
        Some((id, token))
    })
}

/// Right padding with pad = EOS, truncation at `max_length`.
pub fn configure_tokenizer(
    tokenizer: &mut Tokenizer,
    pad_id: u32,
    pad_token: &str,
    max_length: usize,
) -> UnifiedResult<()> {
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        direction: PaddingDirection::Right,
        pad_to_multiple_of: None,
        pad_id,
        pad_type_id: 0,
        pad_token: pad_token.to_string(),
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| {
            UnifiedError::configuration(
                "configure truncation",
                ConfigErrorType::InvalidData(e.to_string()),
                Some(format!("max_length {max_length}")),
            )
        })?;
    Ok(())
}

/// Load and configure the tokenizer for a model.
pub fn load_tokenizer(files: &ModelFiles, config: &CausalLmConfig) -> UnifiedResult<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| {
        UnifiedError::configuration(
            "load tokenizer",
            ConfigErrorType::ParseError(e.to_string()),
            Some(format!("{:?}", files.tokenizer)),
        )
    })?;

    let (pad_id, pad_token) =
        resolve_eos(&tokenizer, files.tokenizer_config.as_deref(), config).ok_or_else(|| {
            UnifiedError::configuration(
                "resolve pad token",
                ConfigErrorType::InvalidData("no EOS token in tokenizer_config.json or config.json".to_string()),
                Some(format!("{:?}", files.tokenizer)),
            )
        })?;
    tracing::debug!("Padding with EOS token {:?} (id {})", pad_token, pad_id);
    configure_tokenizer(&mut tokenizer, pad_id, &pad_token, config.max_position_embeddings)?;
    Ok(tokenizer)
}

/// Weight dtype for a device: BF16 on CUDA for unquantized loads, F32 otherwise.
pub fn model_dtype(device: &Device, quantized: bool) -> DType {
    if device.is_cuda() && !quantized {
        DType::BF16
    } else {
        DType::F32
    }
}

/// Everything produced by a successful load.
pub struct LoadedModel {
    pub model: DecoderModel,
    pub tokenizer: Tokenizer,
    pub device: Device,
}

/// Resolve, read and build model + tokenizer. Every failure is reported as a
/// configuration error.
pub fn load_pretrained(config: &ForecasterConfig) -> UnifiedResult<LoadedModel> {
    let device = config.device.resolve()?;
    let files = resolve_model_files(&config.model_id, config.revision.as_deref())?;
    let model_config = CausalLmConfig::from_file(&files.config)?;
    let tokenizer = load_tokenizer(&files, &model_config)?;

    let dtype = model_dtype(&device, config.quantization.is_quantized());
    tracing::info!(
        "Loading {} weight file(s) on {:?} as {:?}",
        files.weights.len(),
        device,
        dtype
    );
    // SAFETY: the weight files are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device) }
        .map_err(|e| {
            UnifiedError::configuration(
                "map safetensors",
                ConfigErrorType::InvalidData(e.to_string()),
                Some(config.model_id.clone()),
            )
        })?;
    let model = DecoderModel::new(&model_config, config.quantization, vb)?;
    tracing::info!("Model {} loaded ({})", config.model_id, model.family());

    Ok(LoadedModel {
        model,
        tokenizer,
        device,
    })
}
