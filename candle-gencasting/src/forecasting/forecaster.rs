//! Class-token forecasting with a causal language model.
//!
//! The forecaster reads the model's next-token distribution after each prompt
//! and renormalizes it over a small set of class tokens:
//!
//! 1. Tokenize prompts and pad them on the right with the EOS token
//! 2. Run the decoder over the batch
//! 3. Take each row's logits at its last real token
//! 4. Keep only the class-token columns and softmax over them
//!
//! ## Usage Example
//! ```ignore
//! let forecaster = GenerativeForecaster::from_pretrained(
//!     "mistralai/Mistral-7B-v0.1",
//!     vec![("positive", 6785), ("negative", 7087)],
//!     QuantizationMode::Int4,
//! )?;
//! let table = forecaster.extract_probabilities(vec!["Review: great!\nSentiment:"], Some(8))?;
//! println!("{table}");
//! ```

use super::class_tokens::{ClassTokenMap, ClassTokens};
use super::probability_table::ProbabilityTable;
use crate::core::{
    processing, ConfigErrorType, ForecasterConfig, QuantizationMode, UnifiedError, UnifiedResult,
};
use crate::data::{Batch, PromptDataset, PromptSource};
use crate::model_architectures::generative::{load_pretrained, DecoderModel, LoadedModel};
use crate::model_architectures::lora::{LoRAConfig, ADAPTER_WEIGHTS_FILE};
use crate::training::{CompletionOnlyCollator, LoraTrainer, TrainerOptions};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Prompts to score: raw strings (batched by the forecaster) or ready batches.
#[derive(Debug, Clone)]
pub enum ExtractionInput {
    Prompts(Vec<String>),
    Batches(Vec<Batch>),
}

impl From<Vec<String>> for ExtractionInput {
    fn from(prompts: Vec<String>) -> Self {
        Self::Prompts(prompts)
    }
}

impl From<Vec<&str>> for ExtractionInput {
    fn from(prompts: Vec<&str>) -> Self {
        Self::Prompts(prompts.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<Batch>> for ExtractionInput {
    fn from(batches: Vec<Batch>) -> Self {
        Self::Batches(batches)
    }
}

struct LoadedState {
    model: DecoderModel,
    tokenizer: Arc<Tokenizer>,
    device: Device,
}

/// Class-token forecaster over a causal LM.
///
/// Owns the loaded model, tokenizer and resolved class tokens. Extraction
/// borrows it immutably; fine-tuning borrows it mutably through the trainer.
pub struct GenerativeForecaster {
    config: ForecasterConfig,
    requested_tokens: ClassTokens,
    token_map: Option<ClassTokenMap>,
    state: Option<LoadedState>,
}

impl GenerativeForecaster {
    /// Create a forecaster. Unless `config.load_model` is false the model is
    /// loaded and `class_tokens` resolved immediately.
    pub fn new(config: ForecasterConfig, class_tokens: impl Into<ClassTokens>) -> UnifiedResult<Self> {
        let mut forecaster = Self {
            config,
            requested_tokens: class_tokens.into(),
            token_map: None,
            state: None,
        };
        if forecaster.config.load_model {
            forecaster.load_model()?;
        }
        Ok(forecaster)
    }

    /// Load `model_id` (local directory or hub id) with the default device.
    pub fn from_pretrained(
        model_id: &str,
        class_tokens: impl Into<ClassTokens>,
        quantization: QuantizationMode,
    ) -> UnifiedResult<Self> {
        Self::new(
            ForecasterConfig::new(model_id).with_quantization(quantization),
            class_tokens,
        )
    }

    /// Wrap an already built model and tokenizer. The tokenizer should be
    /// configured with right padding (see
    /// [`configure_tokenizer`](crate::model_architectures::generative::configure_tokenizer)).
    pub fn from_parts(
        model: DecoderModel,
        tokenizer: Tokenizer,
        class_tokens: impl Into<ClassTokens>,
    ) -> UnifiedResult<Self> {
        let device = model.device().clone();
        let mut forecaster = Self {
            config: ForecasterConfig::new("<in-memory>").deferred(),
            requested_tokens: class_tokens.into(),
            token_map: None,
            state: Some(LoadedState {
                model,
                tokenizer: Arc::new(tokenizer),
                device,
            }),
        };
        let requested = forecaster.requested_tokens.clone();
        forecaster.identify_tokens(requested)?;
        Ok(forecaster)
    }

    /// Load model and tokenizer, then resolve the class tokens given at
    /// construction.
    pub fn load_model(&mut self) -> UnifiedResult<()> {
        let LoadedModel {
            model,
            tokenizer,
            device,
        } = load_pretrained(&self.config)?;
        self.state = Some(LoadedState {
            model,
            tokenizer: Arc::new(tokenizer),
            device,
        });
        let requested = self.requested_tokens.clone();
        self.identify_tokens(requested)?;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    fn loaded(&self, operation: &str) -> UnifiedResult<&LoadedState> {
        self.state.as_ref().ok_or_else(|| {
            UnifiedError::precondition(operation, "the model and tokenizer are not loaded")
        })
    }

    /// Resolve `class_tokens` into a new label -> token id map and make it
    /// the one used for extraction.
    pub fn identify_tokens(&mut self, class_tokens: impl Into<ClassTokens>) -> UnifiedResult<&ClassTokenMap> {
        let class_tokens = class_tokens.into();
        let state = self.loaded("identify class tokens")?;
        let map = ClassTokenMap::resolve(&class_tokens, &state.tokenizer, state.model.vocab_size())?;
        tracing::info!("Class tokens: {}", map);
        self.requested_tokens = class_tokens;
        Ok(&*self.token_map.insert(map))
    }

    pub fn class_token_map(&self) -> Option<&ClassTokenMap> {
        self.token_map.as_ref()
    }

    pub fn model(&self) -> UnifiedResult<&DecoderModel> {
        Ok(&self.loaded("access model")?.model)
    }

    pub fn tokenizer(&self) -> UnifiedResult<&Arc<Tokenizer>> {
        Ok(&self.loaded("access tokenizer")?.tokenizer)
    }

    pub fn device(&self) -> UnifiedResult<&Device> {
        Ok(&self.loaded("access device")?.device)
    }

    /// Wrap prompts in a dataset sharing this forecaster's tokenizer.
    pub fn dataset(&self, source: impl Into<PromptSource>) -> UnifiedResult<PromptDataset> {
        PromptDataset::new(source, self.tokenizer()?.clone())
    }

    /// Class probabilities for every prompt.
    ///
    /// Raw prompts need a `batch_size`; pre-built batches ignore it.
    pub fn extract_probabilities(
        &self,
        input: impl Into<ExtractionInput>,
        batch_size: Option<usize>,
    ) -> UnifiedResult<ProbabilityTable> {
        let state = self.loaded("extract probabilities")?;
        match input.into() {
            ExtractionInput::Prompts(prompts) => {
                let batch_size = batch_size.ok_or_else(|| {
                    UnifiedError::validation("batch_size", "a batch size for raw prompts", "none")
                })?;
                let dataset = PromptDataset::new(prompts, state.tokenizer.clone())?;
                self.extract_from_dataset(&dataset, batch_size)
            }
            ExtractionInput::Batches(batches) => self.extract_batches(batches),
        }
    }

    pub fn extract_from_dataset(
        &self,
        dataset: &PromptDataset,
        batch_size: usize,
    ) -> UnifiedResult<ProbabilityTable> {
        self.loaded("extract probabilities")?;
        self.collect_table(dataset.batches(batch_size)?)
    }

    pub fn extract_batches(
        &self,
        batches: impl IntoIterator<Item = Batch>,
    ) -> UnifiedResult<ProbabilityTable> {
        self.collect_table(batches.into_iter().map(Ok))
    }

    fn collect_table(
        &self,
        batches: impl Iterator<Item = UnifiedResult<Batch>>,
    ) -> UnifiedResult<ProbabilityTable> {
        let state = self.loaded("extract probabilities")?;
        let map = self.token_map.as_ref().ok_or_else(|| {
            UnifiedError::precondition("extract probabilities", "class tokens have not been identified")
        })?;
        let class_ids = Tensor::from_slice(&map.ids(), map.len(), &state.device)
            .map_err(processing("build class id tensor"))?;

        let mut table = ProbabilityTable::new(map.labels());
        for (batch_idx, batch) in batches.enumerate() {
            let batch = batch?;
            tracing::debug!(
                "Scoring batch {} ({} prompts, width {})",
                batch_idx,
                batch.len(),
                batch.width()
            );
            for row in self.batch_probabilities(state, &class_ids, &batch)? {
                table.push_row(row)?;
            }
        }
        tracing::info!(
            "Extracted probabilities for {} prompts over {} classes",
            table.num_rows(),
            table.num_columns()
        );
        Ok(table)
    }

    fn batch_probabilities(
        &self,
        state: &LoadedState,
        class_ids: &Tensor,
        batch: &Batch,
    ) -> UnifiedResult<Vec<Vec<f32>>> {
        let max_len = state.model.config().max_position_embeddings;
        if batch.width() > max_len {
            return Err(UnifiedError::validation(
                "batch width",
                format!("at most max_position_embeddings ({max_len})"),
                batch.width().to_string(),
            ));
        }
        let input_ids = batch
            .input_tensor(&state.device)
            .map_err(processing("build input tensor"))?;
        let logits = state.model.last_token_logits(&input_ids, batch.lengths())?;
        let class_logits = logits
            .index_select(class_ids, 1)
            .map_err(processing("select class-token logits"))?;
        candle_nn::ops::softmax_last_dim(&class_logits)
            .and_then(|probs| probs.to_vec2::<f32>())
            .map_err(processing("softmax over class tokens"))
    }

    /// Attach fresh LoRA adapters and return a trainer over `train_data`.
    ///
    /// `response_sequence` marks where the completion starts; the loss only
    /// covers tokens after its first occurrence. Nothing is trained until
    /// [`LoraTrainer::train`] is called.
    pub fn setup_trainer(
        &mut self,
        train_data: impl Into<PromptSource>,
        response_sequence: &str,
        options: TrainerOptions,
    ) -> UnifiedResult<LoraTrainer<'_>> {
        let state = self.state.as_mut().ok_or_else(|| {
            UnifiedError::precondition("setup trainer", "the model and tokenizer are not loaded")
        })?;
        if response_sequence.is_empty() {
            return Err(UnifiedError::validation(
                "response_sequence",
                "a non-empty marker string",
                "an empty string",
            ));
        }

        let dataset =
            PromptDataset::from_column(train_data, &options.text_field, state.tokenizer.clone())?;
        if dataset.is_empty() {
            return Err(UnifiedError::validation(
                "training dataset",
                "at least one example",
                "an empty dataset",
            ));
        }

        let lora_config = options.lora_config(state.model.family());
        lora_config.validate()?;
        let collator =
            CompletionOnlyCollator::new(response_sequence, &state.tokenizer, dataset.pad_id()?)?;
        let args = options.resolved_training_args();
        tracing::info!(
            "Setting up LoRA training: {} examples, targets {:?}, r={}, alpha={}, output {:?}",
            dataset.len(),
            lora_config.target_modules,
            lora_config.rank,
            lora_config.alpha,
            args.output_dir
        );

        LoraTrainer::new(
            &mut state.model,
            state.device.clone(),
            dataset,
            collator,
            lora_config,
            args,
        )
    }

    /// Attach adapters from a directory holding `adapter_config.json` and
    /// `adapter_model.safetensors`, replacing any attached adapters.
    pub fn load_adapter(&mut self, adapter_dir: &Path) -> UnifiedResult<()> {
        let state = self.state.as_mut().ok_or_else(|| {
            UnifiedError::precondition("load adapter", "the model and tokenizer are not loaded")
        })?;
        let lora_config = LoRAConfig::from_adapter_dir(adapter_dir)?;
        let weights = adapter_dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights.exists() {
            return Err(UnifiedError::configuration(
                "load adapter weights",
                ConfigErrorType::FileNotFound(format!("{:?}", weights)),
                None,
            ));
        }
        // SAFETY: the adapter file is not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, &state.device) }
            .map_err(|e| {
                UnifiedError::configuration(
                    "map adapter weights",
                    ConfigErrorType::InvalidData(e.to_string()),
                    Some(format!("{:?}", weights)),
                )
            })?;
        let attached = state.model.attach_lora(&lora_config, vb)?;
        tracing::info!("Loaded adapter from {:?} ({} projections)", adapter_dir, attached);
        Ok(())
    }
}
