//! LoRA fine-tuning loop.
//!
//! Only adapter weights are optimized (AdamW). The loss is next-token
//! cross-entropy restricted to completion tokens.

use super::collator::{CompletionOnlyCollator, TrainingBatch};
use crate::core::{processing, ConfigErrorType, UnifiedError, UnifiedResult};
use crate::data::{Batch, PromptDataset};
use crate::model_architectures::generative::{ArchitectureFamily, DecoderModel};
use crate::model_architectures::lora::{LoRAConfig, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `~/.cache/GenCasting`, falling back to the system temp dir without `HOME`.
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("GenCasting")
}

/// How the learning rate moves from `learning_rate` towards zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrSchedulerType {
    #[default]
    Constant,
    Linear,
    Cosine,
}

impl LrSchedulerType {
    /// Learning rate for optimizer step `step` (0-based) of `total_steps`.
    pub fn lr_at(&self, base_lr: f64, step: usize, total_steps: usize) -> f64 {
        let progress = if total_steps == 0 {
            0.0
        } else {
            (step as f64 / total_steps as f64).min(1.0)
        };
        match self {
            Self::Constant => base_lr,
            Self::Linear => base_lr * (1.0 - progress),
            Self::Cosine => base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        }
    }
}

/// Optimization hyperparameters. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    /// Halve the batch size and restart when a training step fails.
    pub auto_find_batch_size: bool,
    pub gradient_accumulation_steps: usize,
    pub optim: String,
    pub logging_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub lr_scheduler_type: LrSchedulerType,
    /// Stop after this many optimizer steps, overriding epochs. `Some(0)`
    /// means no limit.
    pub max_steps: Option<usize>,
    pub seed: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: default_cache_dir(),
            num_train_epochs: 1,
            per_device_train_batch_size: 8,
            auto_find_batch_size: true,
            gradient_accumulation_steps: 1,
            optim: "adamw".to_string(),
            logging_steps: 2,
            learning_rate: 2e-4,
            weight_decay: 0.001,
            max_grad_norm: 0.3,
            lr_scheduler_type: LrSchedulerType::Constant,
            max_steps: None,
            seed: 42,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> UnifiedResult<()> {
        let positive = [
            ("num_train_epochs", self.num_train_epochs),
            ("per_device_train_batch_size", self.per_device_train_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(UnifiedError::validation(field, "a value >= 1", "0"));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(UnifiedError::validation(
                "learning_rate",
                "a positive value",
                self.learning_rate.to_string(),
            ));
        }
        if !self.optim.to_ascii_lowercase().contains("adamw") {
            return Err(UnifiedError::validation("optim", "an AdamW variant", self.optim.clone()));
        }
        Ok(())
    }
}

/// Everything `setup_trainer` accepts besides the data and response marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerOptions {
    /// Table column holding the training text.
    pub text_field: String,
    pub lora_alpha: f64,
    pub lora_rank: usize,
    pub lora_dropout: f64,
    /// Projections to adapt; the architecture's defaults when unset.
    pub target_modules: Option<Vec<String>>,
    /// Full training arguments; defaults writing to `cache_dir` when unset.
    pub training_args: Option<TrainingArgs>,
    pub cache_dir: PathBuf,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            text_field: "prompt".to_string(),
            lora_alpha: 16.0,
            lora_rank: 32,
            lora_dropout: 0.1,
            target_modules: None,
            training_args: None,
            cache_dir: default_cache_dir(),
        }
    }
}

impl TrainerOptions {
    pub fn from_json_file(path: &Path) -> UnifiedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UnifiedError::configuration(
                "load trainer options",
                ConfigErrorType::FileNotFound(format!("{:?}", path)),
                Some(e.to_string()),
            )
        })?;
        serde_json::from_str(&content).map_err(|e| {
            UnifiedError::configuration(
                "parse trainer options",
                ConfigErrorType::ParseError(e.to_string()),
                Some(format!("{:?}", path)),
            )
        })
    }

    pub fn lora_config(&self, family: ArchitectureFamily) -> LoRAConfig {
        LoRAConfig {
            rank: self.lora_rank,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self
                .target_modules
                .clone()
                .unwrap_or_else(|| family.default_lora_targets()),
            ..Default::default()
        }
    }

    pub fn resolved_training_args(&self) -> TrainingArgs {
        self.training_args.clone().unwrap_or_else(|| TrainingArgs {
            output_dir: self.cache_dir.clone(),
            ..Default::default()
        })
    }
}

/// One logged point of the loss curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
}

/// Outcome of [`LoraTrainer::train`]. `final_batch_size` is smaller than the
/// configured one when batch-size backoff kicked in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub global_steps: usize,
    pub epochs_completed: f64,
    pub final_batch_size: usize,
    pub examples_without_template: usize,
    pub log_history: Vec<LogEntry>,
}

impl TrainingSummary {
    pub fn final_loss(&self) -> Option<f64> {
        self.log_history.last().map(|entry| entry.loss)
    }
}

/// Trainer returned by `setup_trainer`. Holds the model mutably for its whole
/// lifetime; adapters stay attached after it is dropped.
pub struct LoraTrainer<'a> {
    model: &'a mut DecoderModel,
    device: Device,
    varmap: VarMap,
    dataset: PromptDataset,
    collator: CompletionOnlyCollator,
    lora_config: LoRAConfig,
    args: TrainingArgs,
}

impl<'a> LoraTrainer<'a> {
    /// Attach fresh adapters (F32, registered in a private `VarMap`) to
    /// `model`.
    pub fn new(
        model: &'a mut DecoderModel,
        device: Device,
        dataset: PromptDataset,
        collator: CompletionOnlyCollator,
        lora_config: LoRAConfig,
        args: TrainingArgs,
    ) -> UnifiedResult<Self> {
        args.validate()?;
        lora_config.validate()?;
        let mut trainer = Self {
            model,
            device,
            varmap: VarMap::new(),
            dataset,
            collator,
            lora_config,
            args,
        };
        trainer.reinitialize_adapters()?;
        Ok(trainer)
    }

    /// Replace the model's adapters with freshly initialised ones, discarding
    /// any training so far.
    pub fn reinitialize_adapters(&mut self) -> UnifiedResult<()> {
        if !self.device.is_cpu() {
            self.device.set_seed(self.args.seed)?;
        }
        self.varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        self.model.attach_lora(&self.lora_config, vb)?;
        Ok(())
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    pub fn lora_config(&self) -> &LoRAConfig {
        &self.lora_config
    }

    pub fn dataset(&self) -> &PromptDataset {
        &self.dataset
    }

    pub fn collator(&self) -> &CompletionOnlyCollator {
        &self.collator
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Run the configured number of epochs (or `max_steps`).
    ///
    /// With `auto_find_batch_size`, a failing step halves the batch size and
    /// restarts from freshly initialised adapters.
    pub fn train(&mut self) -> UnifiedResult<TrainingSummary> {
        let batch_size = self.args.per_device_train_batch_size;
        let auto_find = self.args.auto_find_batch_size;
        run_with_backoff(self, batch_size, auto_find)
    }

    fn train_with_batch_size(&mut self, batch_size: usize) -> UnifiedResult<TrainingSummary> {
        let args = self.args.clone();
        let n = self.dataset.len();
        let accumulation = args.gradient_accumulation_steps;
        let micro_per_epoch = n.div_ceil(batch_size);
        let steps_per_epoch = micro_per_epoch.div_ceil(accumulation);
        let total_steps = args
            .max_steps
            .filter(|&steps| steps > 0)
            .unwrap_or(steps_per_epoch * args.num_train_epochs);
        let pad_id = self.dataset.pad_id()?;

        let vars = self.varmap.all_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: args.learning_rate,
                weight_decay: args.weight_decay,
                ..Default::default()
            },
        )
        .map_err(processing("create optimizer"))?;

        tracing::info!(
            "Training {} trainable parameters on {} examples: batch size {}, {} optimizer steps",
            self.num_trainable_parameters(),
            n,
            batch_size,
            total_steps
        );

        let mut rng = StdRng::seed_from_u64(args.seed);
        let mut order: Vec<usize> = (0..n).collect();
        let mut accumulated: Vec<Option<Tensor>> = vec![None; vars.len()];
        let mut grad_store: Option<GradStore> = None;
        let mut pending_micro = 0;
        let mut global_step = 0;
        let mut window_loss = 0.0;
        let mut window_count = 0;
        let mut without_template = 0;
        let mut log_history = Vec::new();
        let mut epochs_completed = 0.0;

        'epochs: for epoch in 0..args.num_train_epochs {
            order.shuffle(&mut rng);
            let chunks: Vec<&[usize]> = order.chunks(batch_size).collect();
            for (micro_idx, chunk) in chunks.iter().enumerate() {
                let records = chunk
                    .iter()
                    .map(|&idx| self.dataset.get_item(idx))
                    .collect::<UnifiedResult<Vec<_>>>()?;
                let batch = self.collator.label_batch(Batch::collate(&records, pad_id)?);
                if batch.missing_template() > 0 {
                    tracing::warn!(
                        "{} example(s) do not contain the response template and are ignored in the loss",
                        batch.missing_template()
                    );
                    without_template += batch.missing_template();
                }

                if let Some((loss, grads)) = self.micro_step(&batch, accumulation)? {
                    window_loss += loss;
                    window_count += 1;
                    accumulate(&mut accumulated, &vars, &grads)?;
                    grad_store = Some(grads);
                }
                pending_micro += 1;

                let last_micro = micro_idx + 1 == chunks.len();
                if pending_micro < accumulation && !last_micro {
                    continue;
                }
                pending_micro = 0;

                let lr = args
                    .lr_scheduler_type
                    .lr_at(args.learning_rate, global_step, total_steps);
                optimizer.set_learning_rate(lr);
                if let Some(store) = grad_store.take() {
                    let grads = clip_into(store, &mut accumulated, &vars, args.max_grad_norm)?;
                    optimizer.step(&grads).map_err(processing("optimizer step"))?;
                }
                global_step += 1;
                epochs_completed = epoch as f64 + (micro_idx + 1) as f64 / chunks.len() as f64;

                if global_step % args.logging_steps == 0 && window_count > 0 {
                    let entry = LogEntry {
                        step: global_step,
                        epoch: epochs_completed,
                        loss: window_loss / window_count as f64,
                        learning_rate: lr,
                    };
                    tracing::info!(
                        "step {} epoch {:.2}: loss {:.4}, lr {:.2e}",
                        entry.step,
                        entry.epoch,
                        entry.loss,
                        entry.learning_rate
                    );
                    log_history.push(entry);
                    window_loss = 0.0;
                    window_count = 0;
                }
                if global_step >= total_steps {
                    break 'epochs;
                }
            }
        }

        if window_count > 0 {
            log_history.push(LogEntry {
                step: global_step,
                epoch: epochs_completed,
                loss: window_loss / window_count as f64,
                learning_rate: args
                    .lr_scheduler_type
                    .lr_at(args.learning_rate, global_step.saturating_sub(1), total_steps),
            });
        }

        Ok(TrainingSummary {
            global_steps: global_step,
            epochs_completed,
            final_batch_size: batch_size,
            examples_without_template: without_template,
            log_history,
        })
    }

    /// Forward + backward for one micro-batch. `None` when no position in the
    /// batch carries a label.
    fn micro_step(
        &self,
        batch: &TrainingBatch,
        accumulation: usize,
    ) -> UnifiedResult<Option<(f64, GradStore)>> {
        if batch.num_targets() == 0 {
            return Ok(None);
        }
        let input_ids = batch
            .batch
            .input_tensor(&self.device)
            .map_err(processing("build input tensor"))?;
        let (targets, mask) = batch
            .shifted_targets(&self.device)
            .map_err(processing("build targets"))?;
        let logits = self.model.forward(&input_ids, true)?;
        let loss = masked_cross_entropy(&logits, &targets, &mask)
            .map_err(processing("compute loss"))?;
        let loss_value = loss
            .to_scalar::<f32>()
            .map_err(processing("read loss"))? as f64;
        let grads = (loss / accumulation as f64)
            .and_then(|scaled| scaled.backward())
            .map_err(processing("backward pass"))?;
        Ok(Some((loss_value, grads)))
    }

    /// Write `adapter_config.json` and `adapter_model.safetensors` into
    /// `output_dir`.
    pub fn save_adapter(&self) -> UnifiedResult<PathBuf> {
        let output_dir = self.args.output_dir.clone();
        self.save_adapter_to(&output_dir)
    }

    pub fn save_adapter_to(&self, dir: &Path) -> UnifiedResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let mut config = serde_json::to_value(&self.lora_config)?;
        if let Some(object) = config.as_object_mut() {
            object.insert("peft_type".to_string(), "LORA".into());
        }
        std::fs::write(dir.join(ADAPTER_CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;
        self.varmap
            .save(dir.join(ADAPTER_WEIGHTS_FILE))
            .map_err(processing("save adapter weights"))?;
        tracing::info!("Saved adapter to {:?}", dir);
        Ok(dir.to_path_buf())
    }
}

/// A training run that can start over with a smaller batch.
trait BatchSizeSearch {
    type Output;

    fn run(&mut self, batch_size: usize) -> UnifiedResult<Self::Output>;

    fn restart(&mut self) -> UnifiedResult<()>;
}

impl BatchSizeSearch for LoraTrainer<'_> {
    type Output = TrainingSummary;

    fn run(&mut self, batch_size: usize) -> UnifiedResult<TrainingSummary> {
        self.train_with_batch_size(batch_size)
    }

    fn restart(&mut self) -> UnifiedResult<()> {
        self.reinitialize_adapters()
    }
}

/// Run at `batch_size`; when `enabled`, every step failure halves the batch
/// size and restarts until the batch holds a single example.
fn run_with_backoff<S: BatchSizeSearch>(
    search: &mut S,
    mut batch_size: usize,
    enabled: bool,
) -> UnifiedResult<S::Output> {
    loop {
        match search.run(batch_size) {
            Ok(output) => return Ok(output),
            Err(e) if enabled && batch_size > 1 && is_step_failure(&e) => {
                tracing::warn!(
                    "Training step failed with batch size {}: {}; retrying with {}",
                    batch_size,
                    e,
                    batch_size / 2
                );
                batch_size /= 2;
                search.restart()?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn accumulate(accumulated: &mut [Option<Tensor>], vars: &[Var], grads: &GradStore) -> UnifiedResult<()> {
    for (slot, var) in accumulated.iter_mut().zip(vars) {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let grad = grad.detach();
            *slot = Some(match slot.take() {
                Some(acc) => (acc + grad).map_err(processing("accumulate gradients"))?,
                None => grad,
            });
        }
    }
    Ok(())
}

/// Move the accumulated gradients into `store`, scaled so their global L2
/// norm is at most `max_grad_norm` (no clipping when it is not positive).
fn clip_into(
    mut store: GradStore,
    accumulated: &mut [Option<Tensor>],
    vars: &[Var],
    max_grad_norm: f64,
) -> UnifiedResult<GradStore> {
    let grads: Vec<(usize, Tensor)> = accumulated
        .iter_mut()
        .enumerate()
        .filter_map(|(idx, grad)| grad.take().map(|g| (idx, g)))
        .collect();

    let mut sq_norm = 0f64;
    for (_, grad) in &grads {
        sq_norm += grad
            .sqr()
            .and_then(|g| g.sum_all())
            .and_then(|g| g.to_dtype(DType::F64))
            .and_then(|g| g.to_scalar::<f64>())
            .map_err(processing("gradient norm"))?;
    }
    let norm = sq_norm.sqrt();
    let scale = if max_grad_norm > 0.0 && norm > max_grad_norm {
        max_grad_norm / (norm + 1e-6)
    } else {
        1.0
    };

    for (idx, grad) in grads {
        let grad = (grad * scale).map_err(processing("clip gradients"))?;
        store.insert(vars[idx].as_tensor(), grad);
    }
    Ok(store)
}

/// Failures that a smaller batch might avoid.
fn is_step_failure(error: &UnifiedError) -> bool {
    matches!(
        error,
        UnifiedError::Processing { .. } | UnifiedError::Model { .. } | UnifiedError::Candle(_)
    )
}

/// Mean next-token cross-entropy over masked positions.
///
/// `logits` is `[batch, seq, vocab]`; `targets` (u32) and `mask` (f32) are
/// `[batch, seq - 1]`, with position `t` predicting token `t + 1`.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let (_, seq_len, _) = logits.dims3()?;
    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let total = mask.sum_all()?;
    (picked * mask)?.sum_all()?.neg()?.broadcast_div(&total)
}
