//! LoRA fine-tuning on the tiny decoder: setup validation, a short training
//! run, and saving then reloading the adapter.

mod common;

use anyhow::Result;
use candle_gencasting::model_architectures::lora::{ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use candle_gencasting::{
    ForecasterConfig, GenerativeForecaster, LrSchedulerType, PromptTable, TrainerOptions,
    TrainingArgs, UnifiedError,
};
use candle_nn::VarMap;
use common::{scratch_dir, tiny_model, tiny_model_from, tiny_tokenizer};
use std::collections::HashMap;
use std::path::Path;

const RESPONSE: &str = "Sentiment :";

const TRAIN: [&str; 5] = [
    "Review : great movie . Sentiment : positive",
    "Review : the acting was bad . Sentiment : negative",
    "Review : very fun plot . Sentiment : positive",
    "Review : boring and not great . Sentiment : negative",
    "I liked it",
];

const EVAL: [&str; 2] = ["Review : great acting . Sentiment :", "Review : bad plot . Sentiment :"];

fn options(output_dir: &Path, max_steps: Option<usize>) -> TrainerOptions {
    TrainerOptions {
        lora_rank: 4,
        lora_alpha: 8.0,
        lora_dropout: 0.0,
        training_args: Some(TrainingArgs {
            output_dir: output_dir.to_path_buf(),
            per_device_train_batch_size: 2,
            auto_find_batch_size: false,
            learning_rate: 1e-2,
            logging_steps: 1,
            max_steps,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Vec<f32>>> {
    let data = varmap.data().lock().map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut values = HashMap::new();
    for (name, var) in data.iter() {
        values.insert(name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(values)
}

fn count_zero_vars(vars: &[candle_core::Var]) -> Result<usize> {
    let mut zeros = 0;
    for var in vars {
        if var.as_tensor().abs()?.sum_all()?.to_scalar::<f32>()? == 0.0 {
            zeros += 1;
        }
    }
    Ok(zeros)
}

fn max_abs(vars: &[candle_core::Var]) -> Result<f32> {
    let mut max = 0f32;
    for var in vars {
        max = max.max(var.as_tensor().abs()?.max_all()?.to_scalar::<f32>()?);
    }
    Ok(max)
}

fn setup_error(
    forecaster: &mut GenerativeForecaster,
    data: impl Into<candle_gencasting::PromptSource>,
    response: &str,
    options: TrainerOptions,
) -> UnifiedError {
    match forecaster.setup_trainer(data, response, options) {
        Ok(_) => panic!("setup_trainer should fail"),
        Err(e) => e,
    }
}

#[test]
fn test_setup_trainer_requires_loaded_model() -> Result<()> {
    let dir = scratch_dir("trainer-deferred")?;
    let mut forecaster = GenerativeForecaster::new(
        ForecasterConfig::new(dir.to_string_lossy()).deferred(),
        vec!["positive", "negative"],
    )?;
    let err = setup_error(&mut forecaster, TRAIN.to_vec(), RESPONSE, options(&dir, Some(1)));
    assert!(err.is_precondition());
    Ok(())
}

#[test]
fn test_setup_trainer_rejects_bad_inputs() -> Result<()> {
    let dir = scratch_dir("trainer-invalid")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;

    let empty_marker = setup_error(&mut forecaster, TRAIN.to_vec(), "", options(&dir, Some(1)));
    assert!(empty_marker.is_validation());

    let blank_marker = setup_error(&mut forecaster, TRAIN.to_vec(), "   ", options(&dir, Some(1)));
    assert!(blank_marker.is_validation());

    let empty_data =
        setup_error(&mut forecaster, Vec::<String>::new(), RESPONSE, options(&dir, Some(1)));
    assert!(empty_data.is_validation());

    let table = PromptTable::from_json_str(r#"[{"text": "Review : great . Sentiment : positive"}]"#)?;
    let missing_column = setup_error(&mut forecaster, table, RESPONSE, options(&dir, Some(1)));
    assert!(missing_column.is_validation());

    let unknown_targets = TrainerOptions {
        target_modules: Some(vec!["c_attn".to_string()]),
        ..options(&dir, Some(1))
    };
    let err = setup_error(&mut forecaster, TRAIN.to_vec(), RESPONSE, unknown_targets);
    assert!(err.is_validation());
    Ok(())
}

#[test]
fn test_text_field_selects_table_column() -> Result<()> {
    let dir = scratch_dir("trainer-text-field")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let table = PromptTable::from_json_str(
        r#"[{"text": "Review : great . Sentiment : positive", "label": 1},
            {"text": "Review : bad . Sentiment : negative", "label": 0}]"#,
    )?;
    let trainer = forecaster.setup_trainer(
        table,
        RESPONSE,
        TrainerOptions {
            text_field: "text".to_string(),
            ..options(&dir, Some(1))
        },
    )?;
    assert_eq!(trainer.dataset().len(), 2);
    assert_eq!(trainer.lora_config().target_modules, vec!["q_proj", "v_proj"]);
    // rank 4 on q_proj (32 -> 32) and v_proj (32 -> 16) in two layers.
    assert_eq!(trainer.num_trainable_parameters(), 2 * (4 * 32 + 32 * 4 + 4 * 32 + 16 * 4));
    Ok(())
}

#[test]
fn test_training_updates_only_adapters() -> Result<()> {
    let dir = scratch_dir("trainer-run")?;
    let (model, base_varmap) = tiny_model()?;
    let before = snapshot(&base_varmap)?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let untrained = forecaster.extract_probabilities(EVAL.to_vec(), Some(2))?;

    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, options(&dir, Some(3)))?;
    // lora_B starts at zero, so fresh adapters leave the model unchanged.
    let vars = trainer.trainable_vars();
    assert_eq!(count_zero_vars(&vars)?, vars.len() / 2);

    let summary = trainer.train()?;
    assert_eq!(summary.global_steps, 3);
    assert_eq!(summary.final_batch_size, 2);
    assert!(!summary.log_history.is_empty());
    assert!(summary.final_loss().is_some_and(f64::is_finite));
    assert_eq!(count_zero_vars(&trainer.trainable_vars())?, 0);
    drop(trainer);
    assert_eq!(forecaster.model()?.num_adapted_projections(), 4);

    let after = snapshot(&base_varmap)?;
    assert_eq!(before, after, "base weights must stay frozen");

    let trained = forecaster.extract_probabilities(EVAL.to_vec(), Some(2))?;
    let max_diff = trained
        .rows()
        .iter()
        .flatten()
        .zip(untrained.rows().iter().flatten())
        .map(|(a, b)| (a - b).abs())
        .fold(0f32, f32::max);
    assert!(max_diff > 1e-6);
    Ok(())
}

#[test]
fn test_full_epoch_counts_examples_without_template() -> Result<()> {
    let dir = scratch_dir("trainer-epoch")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, options(&dir, None))?;
    let summary = trainer.train()?;

    // Five examples in batches of two.
    assert_eq!(summary.global_steps, 3);
    assert_eq!(summary.examples_without_template, 1);
    assert!((summary.epochs_completed - 1.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_gradient_accumulation_groups_micro_batches() -> Result<()> {
    let dir = scratch_dir("trainer-accumulation")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let mut opts = options(&dir, None);
    if let Some(args) = opts.training_args.as_mut() {
        args.gradient_accumulation_steps = 2;
        args.num_train_epochs = 2;
        args.lr_scheduler_type = LrSchedulerType::Cosine;
    }
    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, opts)?;
    let summary = trainer.train()?;

    // Three micro-batches per epoch, two per optimizer step.
    assert_eq!(summary.global_steps, 4);
    assert!((summary.epochs_completed - 2.0).abs() < 1e-9);
    assert_eq!(summary.final_batch_size, 2);
    assert!(!summary.log_history.is_empty());
    assert!(summary.log_history.iter().all(|entry| entry.learning_rate <= 1e-2));
    for pair in summary.log_history.windows(2) {
        assert!(pair[1].step > pair[0].step);
        assert!(pair[1].learning_rate < pair[0].learning_rate);
    }
    Ok(())
}

/// Largest value a zero-initialised adapter matrix reaches after one step.
fn first_step_update(name: &str, max_grad_norm: f64) -> Result<f32> {
    let dir = scratch_dir(name)?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let mut opts = options(&dir, Some(1));
    if let Some(args) = opts.training_args.as_mut() {
        args.max_grad_norm = max_grad_norm;
    }
    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, opts)?;
    let mut lora_b = Vec::new();
    for var in trainer.trainable_vars() {
        if count_zero_vars(std::slice::from_ref(&var))? == 1 {
            lora_b.push(var);
        }
    }
    assert!(!lora_b.is_empty());
    trainer.train()?;
    max_abs(&lora_b)
}

#[test]
fn test_gradient_clipping_bounds_the_update() -> Result<()> {
    // AdamW moves every weight with a non-negligible gradient by about lr.
    let unclipped = first_step_update("trainer-unclipped", 0.0)?;
    assert!(unclipped > 1e-3, "unclipped update {unclipped}");
    // A clipped norm far below AdamW's epsilon leaves the weights almost still.
    let clipped = first_step_update("trainer-clipped", 1e-12)?;
    assert!(clipped < 1e-4, "clipped update {clipped}");
    Ok(())
}

#[test]
fn test_zero_max_steps_trains_for_epochs() -> Result<()> {
    let dir = scratch_dir("trainer-zero-steps")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, options(&dir, Some(0)))?;
    let summary = trainer.train()?;
    assert_eq!(summary.global_steps, 3);
    assert!((summary.epochs_completed - 1.0).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_reinitialized_adapters_restore_base_predictions() -> Result<()> {
    let dir = scratch_dir("trainer-reinit")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    let untrained = forecaster.extract_probabilities(EVAL.to_vec(), Some(2))?;

    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, options(&dir, Some(2)))?;
    let parameters = trainer.num_trainable_parameters();
    trainer.train()?;
    assert_eq!(count_zero_vars(&trainer.trainable_vars())?, 0);

    trainer.reinitialize_adapters()?;
    let vars = trainer.trainable_vars();
    assert_eq!(count_zero_vars(&vars)?, vars.len() / 2);
    assert_eq!(trainer.num_trainable_parameters(), parameters);
    drop(trainer);
    assert_eq!(forecaster.model()?.num_adapted_projections(), 4);

    let restored = forecaster.extract_probabilities(EVAL.to_vec(), Some(2))?;
    for (a, b) in restored.rows().iter().flatten().zip(untrained.rows().iter().flatten()) {
        assert!((a - b).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_saved_adapter_reloads_with_same_probabilities() -> Result<()> {
    let dir = scratch_dir("trainer-save")?;
    let (model, base_varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;

    let mut trainer = forecaster.setup_trainer(TRAIN.to_vec(), RESPONSE, options(&dir, Some(2)))?;
    trainer.train()?;
    let saved = trainer.save_adapter()?;
    drop(trainer);
    assert_eq!(saved, dir);
    assert!(dir.join(ADAPTER_CONFIG_FILE).exists());
    assert!(dir.join(ADAPTER_WEIGHTS_FILE).exists());

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))?)?;
    assert_eq!(config["peft_type"], "LORA");
    assert_eq!(config["r"], 4);

    let expected = forecaster.extract_probabilities(EVAL.to_vec(), Some(2))?;

    let mut reloaded = GenerativeForecaster::from_parts(
        tiny_model_from(&base_varmap, candle_gencasting::QuantizationMode::None)?,
        tiny_tokenizer()?,
        vec!["positive", "negative"],
    )?;
    reloaded.load_adapter(&dir)?;
    let actual = reloaded.extract_probabilities(EVAL.to_vec(), Some(2))?;
    for (a, b) in expected.rows().iter().flatten().zip(actual.rows().iter().flatten()) {
        assert!((a - b).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn test_load_adapter_without_files_is_configuration_error() -> Result<()> {
    let dir = scratch_dir("trainer-no-adapter")?;
    let (model, _varmap) = tiny_model()?;
    let mut forecaster =
        GenerativeForecaster::from_parts(model, tiny_tokenizer()?, vec!["positive", "negative"])?;
    assert!(forecaster.load_adapter(&dir).unwrap_err().is_configuration());
    Ok(())
}
