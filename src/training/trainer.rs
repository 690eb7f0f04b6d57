//! Training loop for LoRA fine-tuning of causal language models
//!
//! Provides a high-level API for training with:
//! - Gradient accumulation and clipping
//! - Learning rate scheduling with warmup
//! - Periodic evaluation, logging and checkpointing
//! - Early stopping through listeners and best-model reloading

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarMap;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::callbacks::{CallbackAction, EventDispatcher, Metrics, MetricsEvent, RunSummary};
use super::checkpoint::{load_adapter, CheckpointManager, TrainerState};
use super::collator::collate;
use super::dataset::TokenizedExample;
use super::loss::causal_lm_loss;
use super::models::CausalLm;
use super::optimizer::{AdamW, AdamWConfig, GradAccumulator, LearningRateScheduler, SchedulerKind};

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Output directory for checkpoints, logs and the final model
    pub output_dir: PathBuf,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Micro-batch size
    pub batch_size: usize,
    /// Batch size for eval-loss passes
    pub eval_batch_size: usize,
    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,
    /// Base learning rate
    pub learning_rate: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping
    pub max_grad_norm: f64,
    /// Warmup steps (fraction of total)
    pub warmup_ratio: f64,
    /// Schedule after warmup
    pub lr_scheduler: SchedulerKind,
    /// Logging steps
    pub logging_steps: usize,
    /// Evaluation steps (0 to disable)
    pub eval_steps: usize,
    /// Save checkpoint every N steps (0 to disable)
    pub save_steps: usize,
    /// Keep at most this many step checkpoints
    pub save_total_limit: Option<usize>,
    /// Reload the lowest-eval-loss checkpoint after training
    pub load_best_model_at_end: bool,
    /// Selection metric for the best checkpoint (lower is better)
    pub metric_for_best_model: String,
    /// Run frozen weights in bf16 on accelerators
    pub bf16: bool,
    /// Seed for shuffling and device RNG
    pub seed: u64,
    /// Evaluations without improvement before stopping
    pub early_stopping_patience: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./checkpoints"),
            num_epochs: 3,
            batch_size: 1,
            eval_batch_size: 1,
            gradient_accumulation_steps: 16,
            learning_rate: 2e-4,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            warmup_ratio: 0.03,
            lr_scheduler: SchedulerKind::Cosine,
            logging_steps: 20,
            eval_steps: 100,
            save_steps: 100,
            save_total_limit: Some(5),
            load_best_model_at_end: true,
            metric_for_best_model: "eval_loss".to_string(),
            bf16: true,
            seed: 42,
            early_stopping_patience: 2,
        }
    }
}

impl TrainingConfig {
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.num_epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.eval_batch_size = batch_size;
        self
    }

    pub fn with_gradient_accumulation(mut self, steps: usize) -> Self {
        self.gradient_accumulation_steps = steps;
        self
    }

    /// Log directory under the output directory
    pub fn log_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    /// Optimizer steps in one epoch over `num_examples`
    pub fn steps_per_epoch(&self, num_examples: usize) -> usize {
        let batches = num_examples.div_ceil(self.batch_size.max(1));
        batches.div_ceil(self.gradient_accumulation_steps.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            anyhow::bail!("Batch size must be positive");
        }
        if self.gradient_accumulation_steps == 0 {
            anyhow::bail!("Gradient accumulation steps must be positive");
        }
        if self.logging_steps == 0 {
            anyhow::bail!("Logging steps must be positive");
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            anyhow::bail!("Warmup ratio must be in [0, 1], got {}", self.warmup_ratio);
        }
        if self.load_best_model_at_end
            && self.eval_steps > 0
            && self.save_steps > 0
            && self.save_steps % self.eval_steps != 0
        {
            anyhow::bail!(
                "load_best_model_at_end needs save_steps ({}) to be a multiple of eval_steps ({})",
                self.save_steps,
                self.eval_steps
            );
        }
        if self.metric_for_best_model != "eval_loss" {
            anyhow::bail!(
                "Unsupported metric_for_best_model: {} (only eval_loss)",
                self.metric_for_best_model
            );
        }
        Ok(())
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Fractional epoch reached
    pub epoch: f64,
    /// Per-micro-batch training loss
    pub history: Vec<f64>,
    /// Lowest eval loss seen at a save
    pub best_metric: Option<f64>,
    /// Checkpoint holding the best eval loss
    pub best_checkpoint: Option<PathBuf>,
    pub stopped_early: bool,
}

/// Trainer for LoRA fine-tuning
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    var_map: VarMap,
}

impl Trainer {
    /// Create a new trainer
    pub fn new(config: TrainingConfig, device: Device) -> Self {
        Self {
            config,
            device,
            var_map: VarMap::new(),
        }
    }

    /// Get the device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the config
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Get the var_map
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Create optimizer
    pub fn create_optimizer(&self) -> Result<AdamW> {
        let config = AdamWConfig {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        AdamW::new(&self.var_map, config)
    }

    /// Create learning rate scheduler
    pub fn create_scheduler(&self, total_steps: usize) -> LearningRateScheduler {
        let warmup_steps =
            LearningRateScheduler::warmup_steps_for(total_steps, self.config.warmup_ratio);
        LearningRateScheduler::with_kind(
            self.config.lr_scheduler,
            self.config.learning_rate,
            warmup_steps,
            total_steps,
        )
    }

    /// Load checkpoint
    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        load_adapter(&mut self.var_map, path.as_ref())
    }

    /// Train the model on the dataset
    pub fn train(
        &mut self,
        model: &dyn CausalLm,
        train_data: &[TokenizedExample],
        eval_data: &[TokenizedExample],
        dispatcher: &mut EventDispatcher,
        checkpoints: &CheckpointManager,
    ) -> Result<TrainingResult> {
        self.config.validate()?;
        if train_data.is_empty() {
            anyhow::bail!("Training set is empty");
        }

        if !self.device.is_cpu() {
            self.device.set_seed(self.config.seed)?;
        }

        let num_batches = train_data.len().div_ceil(self.config.batch_size);
        let steps_per_epoch = self.config.steps_per_epoch(train_data.len());
        let total_steps = steps_per_epoch * self.config.num_epochs;

        tracing::info!("Starting training:");
        tracing::info!("  Train examples: {}", train_data.len());
        tracing::info!("  Eval examples: {}", eval_data.len());
        tracing::info!("  Batch size: {}", self.config.batch_size);
        tracing::info!("  Gradient accumulation steps: {}", self.config.gradient_accumulation_steps);
        tracing::info!(
            "  Effective batch size: {}",
            self.config.batch_size * self.config.gradient_accumulation_steps
        );
        tracing::info!("  Epochs: {}", self.config.num_epochs);
        tracing::info!("  Total optimization steps: {}", total_steps);
        tracing::info!("  Learning rate: {} ({})", self.config.learning_rate, self.config.lr_scheduler);
        tracing::info!("  Max gradient norm: {}", self.config.max_grad_norm);

        let mut optimizer = self.create_optimizer()?;
        let mut scheduler = self.create_scheduler(total_steps);
        let mut accumulator = GradAccumulator::new(optimizer.vars().to_vec());

        let mut state = TrainerState::default();
        let mut history = Vec::new();
        let mut best_checkpoint: Option<PathBuf> = None;
        let mut last_eval: Option<(usize, f64)> = None;
        let mut running_loss = 0.0;
        let mut running_count = 0usize;
        let mut last_grad_norm = 0.0;
        let mut stopped_early = false;

        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create output directory {:?}", self.config.output_dir)
        })?;

        'epochs: for epoch in 0..self.config.num_epochs {
            let epoch_start = Instant::now();
            let mut epoch_loss = 0.0;

            let mut order: Vec<usize> = (0..train_data.len()).collect();
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.config.seed + epoch as u64);
            order.shuffle(&mut rng);

            for (batch_idx, chunk) in order.chunks(self.config.batch_size).enumerate() {
                let examples: Vec<TokenizedExample> =
                    chunk.iter().map(|&i| train_data[i].clone()).collect();
                let batch = collate(&examples, &self.device)?;

                let logits = model.forward_train(&batch.input_ids, &batch.attention_mask, true)?;
                let loss = causal_lm_loss(&logits, &batch.labels)?;
                let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;

                let scaled = (loss / self.config.gradient_accumulation_steps as f64)?;
                let mut grads = scaled.backward()?;
                accumulator.accumulate(&grads)?;

                history.push(loss_value);
                epoch_loss += loss_value;
                running_loss += loss_value;
                running_count += 1;

                let end_of_epoch = batch_idx + 1 == num_batches;
                if accumulator.micro_batches() < self.config.gradient_accumulation_steps && !end_of_epoch {
                    continue;
                }

                accumulator.drain_into(&mut grads);
                optimizer.set_learning_rate(scheduler.get_lr());
                last_grad_norm = optimizer.step_with_clipping(&mut grads, self.config.max_grad_norm)?;
                scheduler.step();

                state.global_step += 1;
                state.epoch = epoch as f64 + (batch_idx + 1) as f64 / num_batches as f64;
                let step = state.global_step;

                if step % self.config.logging_steps == 0 && running_count > 0 {
                    let event = MetricsEvent {
                        step,
                        epoch: state.epoch,
                        metrics: Metrics::train(
                            running_loss / running_count as f64,
                            scheduler.get_lr(),
                            last_grad_norm,
                        ),
                    };
                    dispatcher.log(&event)?;
                    state.log_history.push(event);
                    running_loss = 0.0;
                    running_count = 0;
                }

                if self.config.eval_steps > 0 && step % self.config.eval_steps == 0 && !eval_data.is_empty() {
                    let eval_loss = self.evaluate(model, eval_data)?;
                    last_eval = Some((step, eval_loss));

                    let event = MetricsEvent {
                        step,
                        epoch: state.epoch,
                        metrics: Metrics::eval(eval_loss),
                    };
                    dispatcher.log(&event)?;
                    if dispatcher.evaluate(&event)? == CallbackAction::Stop {
                        stopped_early = true;
                    }
                    state.log_history.push(event);
                }

                if self.config.save_steps > 0 && step % self.config.save_steps == 0 {
                    // Only an evaluation of these exact weights ranks the checkpoint
                    state.eval_loss = last_eval
                        .filter(|(eval_step, _)| *eval_step == step)
                        .map(|(_, loss)| loss);
                    let dir = checkpoints.checkpoint_dir(step);
                    if let Some(loss) = state.eval_loss {
                        if state.best_metric.map(|best| loss < best).unwrap_or(true) {
                            state.best_metric = Some(loss);
                            state.best_model_checkpoint = Some(dir.to_string_lossy().to_string());
                            best_checkpoint = Some(dir.clone());
                        }
                    }
                    checkpoints.save(&self.var_map, &state)?;
                    checkpoints.rotate(best_checkpoint.as_deref())?;
                }

                if stopped_early {
                    tracing::info!("Stopping training at step {}", step);
                    break 'epochs;
                }
            }

            tracing::info!(
                "Epoch {} completed in {:.1}s | Avg loss: {:.4}",
                epoch + 1,
                epoch_start.elapsed().as_secs_f64(),
                epoch_loss / num_batches as f64
            );
        }

        if self.config.load_best_model_at_end {
            if let Some(best) = &best_checkpoint {
                tracing::info!(
                    "Loading best model from {:?} (eval_loss={:.4})",
                    best,
                    state.best_metric.unwrap_or(f64::NAN)
                );
                self.load_checkpoint(best)?;
            }
        }

        dispatcher.train_end(&RunSummary {
            total_steps: state.global_step,
            total_epochs: state.epoch,
            stopped_early,
        })?;

        Ok(TrainingResult {
            global_step: state.global_step,
            epoch: state.epoch,
            history,
            best_metric: state.best_metric,
            best_checkpoint,
            stopped_early,
        })
    }

    /// Mean causal-LM loss over `data`, weighted by batch size
    pub fn evaluate(&self, model: &dyn CausalLm, data: &[TokenizedExample]) -> Result<f64> {
        let mut total_loss = 0.0;
        let mut total_examples = 0usize;

        for chunk in data.chunks(self.config.eval_batch_size) {
            let batch = collate(chunk, &self.device)?;
            let logits = model.forward_train(&batch.input_ids, &batch.attention_mask, false)?;
            let loss = causal_lm_loss(&logits, &batch.labels)?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()? as f64;
            total_loss += loss * chunk.len() as f64;
            total_examples += chunk.len();
        }

        Ok(if total_examples > 0 {
            total_loss / total_examples as f64
        } else {
            0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::callbacks::{EarlyStoppingCallback, EventKind, LoggingCallback, TrainingSummary};
    use crate::training::checkpoint::FINAL_MODEL_DIR;
    use crate::training::lora::{LoraConfig, ADAPTER_WEIGHTS_FILE};
    use crate::training::models::common::testing::TinyLm;
    use crate::training::models::KvCache;
    use candle_core::Tensor;
    use std::cell::Cell;
    use tempfile::tempdir;

    /// Trains like `TinyLm`; eval batches after the first pass are confidently wrong
    struct WorseningEval {
        inner: TinyLm,
        batches_per_pass: usize,
        evals: Cell<usize>,
    }

    impl CausalLm for WorseningEval {
        fn forward_train(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
            let logits = self.inner.forward_train(input_ids, attention_mask, train)?;
            if train {
                return Ok(logits);
            }
            let call = self.evals.get();
            self.evals.set(call + 1);
            let zeros = logits.zeros_like()?;
            if call < self.batches_per_pass {
                return Ok(zeros);
            }
            // All mass on token 0, which never appears as a shifted label in `toy_data`
            let mut bias = vec![0f32; logits.dim(2)?];
            bias[0] = 20.0;
            Ok(zeros.broadcast_add(&Tensor::new(bias.as_slice(), logits.device())?)?)
        }

        fn forward_step(&self, input_ids: &Tensor, offset: usize, cache: &mut KvCache) -> Result<Tensor> {
            self.inner.forward_step(input_ids, offset, cache)
        }

        fn num_layers(&self) -> usize {
            self.inner.num_layers()
        }

        fn device(&self) -> &Device {
            self.inner.device()
        }
    }

    fn saved_weights(dir: &Path) -> std::collections::HashMap<String, Vec<f32>> {
        candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), &Device::Cpu)
            .unwrap()
            .into_iter()
            .map(|(name, t)| (name, t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    fn current_weights(var_map: &VarMap) -> std::collections::HashMap<String, Vec<f32>> {
        var_map
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| {
                (name.clone(), var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            })
            .collect()
    }

    fn example(ids: &[u32]) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            labels: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
        }
    }

    fn toy_data() -> Vec<TokenizedExample> {
        (0..8)
            .map(|i| {
                let start = (i % 4) as u32;
                example(&[start, start + 1, start + 2, start + 3])
            })
            .collect()
    }

    fn test_config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            output_dir: dir.to_path_buf(),
            num_epochs: 2,
            batch_size: 2,
            eval_batch_size: 2,
            gradient_accumulation_steps: 2,
            learning_rate: 0.05,
            warmup_ratio: 0.0,
            lr_scheduler: SchedulerKind::Constant,
            logging_steps: 1,
            eval_steps: 2,
            save_steps: 2,
            save_total_limit: Some(1),
            bf16: false,
            early_stopping_patience: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_training_config_default() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.gradient_accumulation_steps, 16);
        assert_eq!(config.num_epochs, 3);
        assert!((config.learning_rate - 2e-4).abs() < 1e-12);
        assert_eq!(config.save_total_limit, Some(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_steps_per_epoch_counts_partial_accumulation() {
        let config = TrainingConfig::default();
        // 33 micro-batches -> 2 full steps plus one partial
        assert_eq!(config.steps_per_epoch(33), 3);
        assert_eq!(config.steps_per_epoch(32), 2);
    }

    #[test]
    fn test_training_reduces_loss_and_writes_artifacts() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let mut trainer = Trainer::new(config.clone(), Device::Cpu);
        let model = TinyLm::new(8, 6, trainer.var_map()).unwrap();

        let data = toy_data();
        let before = trainer.evaluate(&model, &data).unwrap();

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(
            Box::new(LoggingCallback::new(config.log_dir()).unwrap()),
            &[EventKind::Log, EventKind::TrainEnd],
        );
        let checkpoints = CheckpointManager::new(
            dir.path(),
            LoraConfig::new(4, 8.0).adapter_config("tiny"),
        )
        .with_save_total_limit(config.save_total_limit);

        let result = trainer
            .train(&model, &data, &data, &mut dispatcher, &checkpoints)
            .unwrap();

        // 4 micro-batches per epoch, 2 per step, 2 epochs
        assert_eq!(result.global_step, 4);
        assert!((result.epoch - 2.0).abs() < 1e-9);
        assert_eq!(result.history.len(), 8);
        assert!(!result.stopped_early);

        let after = trainer.evaluate(&model, &data).unwrap();
        assert!(after < before, "loss did not drop: {} -> {}", before, after);

        // Best checkpoint survives rotation
        let best = result.best_checkpoint.unwrap();
        assert!(best.exists());
        assert!(checkpoints.list().unwrap().len() <= 2);

        let summary: TrainingSummary = serde_json::from_str(
            &std::fs::read_to_string(config.log_dir().join("training_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary.total_steps, 4);
        assert_eq!(summary.train_losses.len(), 4);
        assert_eq!(summary.eval_losses.len(), 2);

        checkpoints.save_final(trainer.var_map()).unwrap();
        assert!(dir.path().join(FINAL_MODEL_DIR).join("adapter_model.safetensors").exists());
    }

    #[test]
    fn test_early_stop_ends_run() {
        let dir = tempdir().unwrap();
        let config = TrainingConfig {
            num_epochs: 5,
            eval_steps: 1,
            save_steps: 0,
            learning_rate: 0.0,
            ..test_config(dir.path())
        };
        let mut trainer = Trainer::new(config, Device::Cpu);
        let model = TinyLm::new(8, 6, trainer.var_map()).unwrap();

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(Box::new(EarlyStoppingCallback::new(2)), &[EventKind::Evaluate]);
        let checkpoints = CheckpointManager::new(dir.path(), LoraConfig::default().adapter_config("tiny"));

        let data = toy_data();
        let result = trainer
            .train(&model, &data, &data, &mut dispatcher, &checkpoints)
            .unwrap();

        // With lr 0 the eval loss never improves after the first evaluation
        assert!(result.stopped_early);
        assert_eq!(result.global_step, 3);
        assert!(result.best_checkpoint.is_none());
    }

    #[test]
    fn test_save_steps_must_align_with_eval_steps_for_best_model() {
        let dir = tempdir().unwrap();
        let config = TrainingConfig {
            eval_steps: 2,
            save_steps: 3,
            ..test_config(dir.path())
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("multiple of eval_steps"));

        let config = TrainingConfig {
            save_steps: 4,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_checkpoint_without_same_step_eval_is_unranked() {
        let dir = tempdir().unwrap();
        let config = TrainingConfig {
            eval_steps: 2,
            save_steps: 3,
            save_total_limit: None,
            load_best_model_at_end: false,
            ..test_config(dir.path())
        };
        let mut trainer = Trainer::new(config, Device::Cpu);
        let model = TinyLm::new(8, 6, trainer.var_map()).unwrap();
        let checkpoints = CheckpointManager::new(dir.path(), LoraConfig::new(4, 8.0).adapter_config("tiny"));

        let data = toy_data();
        let result = trainer
            .train(&model, &data, &data, &mut EventDispatcher::new(), &checkpoints)
            .unwrap();

        // Step 3 is saved while the latest evaluation belongs to step 2
        assert_eq!(result.global_step, 4);
        let state = TrainerState::load(checkpoints.checkpoint_dir(3)).unwrap();
        assert_eq!(state.global_step, 3);
        assert!(state.eval_loss.is_none());
        assert!(result.best_checkpoint.is_none());
        assert!(result.best_metric.is_none());
    }

    #[test]
    fn test_best_adapter_reloaded_at_end() {
        let dir = tempdir().unwrap();
        let config = TrainingConfig {
            save_total_limit: None,
            ..test_config(dir.path())
        };
        let mut trainer = Trainer::new(config, Device::Cpu);
        let model = WorseningEval {
            inner: TinyLm::new(8, 6, trainer.var_map()).unwrap(),
            // 8 examples in eval batches of 2
            batches_per_pass: 4,
            evals: Cell::new(0),
        };
        let checkpoints = CheckpointManager::new(dir.path(), LoraConfig::new(4, 8.0).adapter_config("tiny"));

        let data = toy_data();
        let result = trainer
            .train(&model, &data, &data, &mut EventDispatcher::new(), &checkpoints)
            .unwrap();

        let best = result.best_checkpoint.unwrap();
        assert_eq!(best, checkpoints.checkpoint_dir(2));
        assert!((result.best_metric.unwrap() - (8f64).ln()).abs() < 1e-4);

        let last = saved_weights(&checkpoints.checkpoint_dir(4));
        let best_weights = saved_weights(&best);
        let current = current_weights(trainer.var_map());
        assert_eq!(current.len(), best_weights.len());
        assert_eq!(current, best_weights);
        assert_ne!(current, last);
    }

    #[test]
    fn test_empty_training_set_rejected() {
        let dir = tempdir().unwrap();
        let mut trainer = Trainer::new(test_config(dir.path()), Device::Cpu);
        let model = TinyLm::new(8, 6, trainer.var_map()).unwrap();
        let checkpoints = CheckpointManager::new(dir.path(), LoraConfig::default().adapter_config("tiny"));
        let err = trainer.train(&model, &[], &[], &mut EventDispatcher::new(), &checkpoints);
        assert!(err.is_err());
    }
}
