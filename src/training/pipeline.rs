//! End-to-end fine-tuning run for one dataset variant
//!
//! load base model -> attach LoRA -> load and tokenize data -> train -> save
//! the final adapter and tokenizer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::callbacks::{EarlyStoppingCallback, EventDispatcher, EventKind, LoggingCallback};
use super::checkpoint::CheckpointManager;
use super::dataset::{
    DatasetLoader, DatasetSource, DatasetVariant, PreparedDataset, PromptConfig, TargetField,
};
use super::device::{select_device, DevicePreference};
use super::hub::ModelLoader;
use super::lora::LoraConfig;
use super::models::{CausalLm, Qwen2LoraModel, TextTokenizer, TokenizerWrapper};
use super::trainer::{Trainer, TrainingConfig, TrainingResult};

/// Base model fine-tuned by default
pub const DEFAULT_BASE_MODEL: &str = "Qwen/Qwen2.5-Coder-1.5B-Instruct";

/// Base model selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace model ID or local path
    pub model_id: String,
    /// Quantize frozen projections to 8 bits
    pub load_in_8bit: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_BASE_MODEL.to_string(),
            load_in_8bit: false,
        }
    }
}

impl ModelConfig {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_8bit(mut self, enabled: bool) -> Self {
        self.load_in_8bit = enabled;
        self
    }
}

/// Everything one fine-tuning run needs
#[derive(Debug, Clone)]
pub struct FineTuneConfig {
    pub variant: DatasetVariant,
    pub target: TargetField,
    /// Local dataset path replacing the Hub dataset
    pub data_dir: Option<PathBuf>,
    pub model: ModelConfig,
    pub lora: LoraConfig,
    pub prompts: PromptConfig,
    pub training: TrainingConfig,
    pub device: DevicePreference,
}

impl FineTuneConfig {
    /// Defaults for a variant, writing to `./checkpoints/<variant>`
    pub fn new(variant: DatasetVariant) -> Self {
        Self {
            variant,
            target: TargetField::Solution,
            data_dir: None,
            model: ModelConfig::default(),
            lora: LoraConfig::default(),
            prompts: PromptConfig::default(),
            training: TrainingConfig::default().with_output_dir(variant.default_output_dir()),
            device: DevicePreference::Auto,
        }
    }

    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.target = if reasoning {
            TargetField::Reasoning
        } else {
            TargetField::Solution
        };
        self
    }

    /// Loader for this run's variant, target and source
    pub fn dataset_loader<'t, T: TextTokenizer>(&self, tokenizer: &'t T) -> DatasetLoader<'t, T> {
        let loader = DatasetLoader::new(self.variant, tokenizer, self.target)
            .with_prompts(self.prompts.clone())
            .with_seed(self.training.seed);
        match &self.data_dir {
            Some(dir) => loader.with_source(DatasetSource::Local(dir.clone())),
            None => loader,
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct FineTuneOutcome {
    pub result: TrainingResult,
    pub final_model_dir: PathBuf,
}

/// Logging for every log event and the run end, early stopping on evaluations
pub fn build_dispatcher(config: &TrainingConfig) -> Result<EventDispatcher> {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(
        Box::new(LoggingCallback::new(config.log_dir())?),
        &[EventKind::Log, EventKind::TrainEnd],
    );
    dispatcher.register(
        Box::new(EarlyStoppingCallback::new(config.early_stopping_patience)),
        &[EventKind::Evaluate],
    );
    Ok(dispatcher)
}

/// Train on prepared data and write the final adapter
pub fn fine_tune(
    trainer: &mut Trainer,
    model: &dyn CausalLm,
    dataset: &PreparedDataset,
    checkpoints: &CheckpointManager,
) -> Result<FineTuneOutcome> {
    let mut dispatcher = build_dispatcher(trainer.config())?;
    let result = trainer.train(
        model,
        &dataset.train,
        &dataset.test,
        &mut dispatcher,
        checkpoints,
    )?;

    let final_model_dir = checkpoints.save_final(trainer.var_map())?;
    Ok(FineTuneOutcome {
        result,
        final_model_dir,
    })
}

/// Full run: download, adapt, train, save
pub fn run(config: &FineTuneConfig) -> Result<FineTuneOutcome> {
    tracing::info!("=== {} ===", config.variant.run_name());

    let device = select_device(config.device)?;
    let loader = ModelLoader::new()?;
    let model_path = loader
        .load_model_path(&config.model.model_id)
        .with_context(|| format!("Failed to resolve base model {}", config.model.model_id))?;
    let tokenizer = TokenizerWrapper::from_model_path(&model_path)?;

    let mut trainer = Trainer::new(config.training.clone(), device.clone());
    let model = Qwen2LoraModel::from_model_path(
        &model_path,
        &config.lora,
        config.model.load_in_8bit,
        config.training.bf16,
        trainer.var_map(),
        &device,
    )?;

    let dataset = config
        .dataset_loader(&tokenizer)
        .load_and_prepare()
        .with_context(|| format!("Failed to load {} dataset", config.variant))?;

    let checkpoints = CheckpointManager::new(
        &config.training.output_dir,
        config.lora.adapter_config(&model_path.model_id),
    )
    .with_save_total_limit(config.training.save_total_limit)
    .with_tokenizer_file(model_path.tokenizer_file.clone());

    let outcome = fine_tune(&mut trainer, &model, &dataset, &checkpoints)?;
    tracing::info!(
        "Training complete: {} steps, final model at {:?}",
        outcome.result.global_step,
        outcome.final_model_dir
    );
    Ok(outcome)
}
