//! Checkpoint discovery, per-checkpoint evaluation and best-of-N selection

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::evaluator::{EvaluationOutput, EvaluationResult, Evaluator};
use super::metrics::EvaluationMetrics;
use crate::generator::{CandleGenerator, Generator, GeneratorConfig, SamplingParams};
use crate::training::checkpoint::CHECKPOINT_PREFIX;
use crate::training::dataset::{DatasetLoader, DatasetSource, DatasetVariant, Example, TargetField};
use crate::training::lora::AdapterConfig;
use crate::training::models::tokenizer::TextTokenizer;
use crate::training::pipeline::DEFAULT_BASE_MODEL;
use crate::training::DevicePreference;

/// Per-checkpoint sample cap when scanning without an explicit one
pub const DEFAULT_SCAN_SAMPLES: usize = 100;

/// Metrics recorded for one checkpoint during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointScore {
    pub checkpoint: PathBuf,
    pub metrics: EvaluationMetrics,
}

/// `checkpoint-*` subdirectories of `base_dir`, sorted by name
pub fn find_checkpoints(base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut checkpoints = Vec::new();
    for entry in std::fs::read_dir(base_dir)
        .with_context(|| format!("Failed to list checkpoints in {:?}", base_dir))?
    {
        let path = entry?.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(CHECKPOINT_PREFIX))
            .unwrap_or(false);
        if path.is_dir() && is_checkpoint {
            checkpoints.push(path);
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}

/// Highest exact match; ties go to the earliest entry
pub fn select_best(scores: &[CheckpointScore]) -> Option<&CheckpointScore> {
    let mut best: Option<&CheckpointScore> = None;
    for score in scores {
        match best {
            Some(current) if score.metrics.exact_match <= current.metrics.exact_match => {}
            _ => best = Some(score),
        }
    }
    best
}

/// Evaluate every checkpoint under `base_dir` in name order.
///
/// `evaluate` receives the checkpoint and the sample cap.
pub fn scan_checkpoints<F>(
    base_dir: &Path,
    num_samples: Option<usize>,
    mut evaluate: F,
) -> Result<Vec<CheckpointScore>>
where
    F: FnMut(&Path, usize) -> Result<EvaluationMetrics>,
{
    let checkpoints = find_checkpoints(base_dir)?;
    if checkpoints.is_empty() {
        anyhow::bail!("No checkpoints found in {:?}", base_dir);
    }
    tracing::info!("Found {} checkpoints", checkpoints.len());

    let cap = num_samples.unwrap_or(DEFAULT_SCAN_SAMPLES);
    let mut scores = Vec::with_capacity(checkpoints.len());
    for checkpoint in checkpoints {
        tracing::info!("Evaluating {:?}", checkpoint);
        let metrics = evaluate(&checkpoint, cap)?;
        scores.push(CheckpointScore {
            checkpoint,
            metrics,
        });
    }
    Ok(scores)
}

/// Shared settings for evaluating adapter checkpoints
#[derive(Debug, Clone)]
pub struct CheckpointEvaluator {
    /// Base model override; defaults to the adapter's recorded base
    pub base_model: Option<String>,
    pub dataset: DatasetVariant,
    /// Local dataset path replacing the Hub dataset
    pub data_dir: Option<PathBuf>,
    pub device: DevicePreference,
    pub params: SamplingParams,
}

impl CheckpointEvaluator {
    pub fn new(dataset: DatasetVariant) -> Self {
        Self {
            base_model: None,
            dataset,
            data_dir: None,
            device: DevicePreference::Auto,
            params: SamplingParams::default(),
        }
    }

    /// Base model for a checkpoint: override, then `adapter_config.json`, then the default
    pub fn resolve_base_model(&self, checkpoint: &Path) -> Result<String> {
        if let Some(model) = &self.base_model {
            return Ok(model.clone());
        }
        let adapter = AdapterConfig::load(checkpoint)?;
        Ok(if adapter.base_model_name_or_path.is_empty() {
            DEFAULT_BASE_MODEL.to_string()
        } else {
            adapter.base_model_name_or_path
        })
    }

    /// Raw solution-only test split
    pub fn load_test_examples<T: TextTokenizer>(&self, tokenizer: &T) -> Result<Vec<Example>> {
        let mut loader = DatasetLoader::new(self.dataset, tokenizer, TargetField::Solution);
        if let Some(dir) = &self.data_dir {
            loader = loader.with_source(DatasetSource::Local(dir.clone()));
        }
        let test = loader.load_raw()?.test;
        tracing::info!("Loaded {} test examples", test.len());
        Ok(test)
    }

    fn generator_config(&self, checkpoint: &Path) -> Result<GeneratorConfig> {
        Ok(GeneratorConfig::new(&self.resolve_base_model(checkpoint)?)
            .with_adapter(checkpoint)
            .with_device(self.device))
    }

    /// Evaluate one generator on `examples` and write the result file
    pub fn evaluate_with(
        &self,
        generator: &dyn Generator,
        checkpoint: &Path,
        examples: &[Example],
        num_samples: Option<usize>,
    ) -> Result<EvaluationOutput> {
        let output = Evaluator::new(generator)
            .with_params(self.params.clone())
            .evaluate_dataset(examples, num_samples);

        let result = EvaluationResult::new(checkpoint, self.dataset, output.metrics.clone());
        let path = result.save(checkpoint, self.dataset)?;

        tracing::info!("Checkpoint: {:?}", checkpoint);
        tracing::info!("Dataset: {}", self.dataset);
        tracing::info!("exact_match: {:.4}", output.metrics.exact_match);
        tracing::info!("Results saved to {:?}", path);
        Ok(output)
    }

    /// Load base model + adapter and evaluate one checkpoint
    pub fn evaluate_checkpoint(
        &self,
        checkpoint: &Path,
        num_samples: Option<usize>,
    ) -> Result<EvaluationOutput> {
        let generator = CandleGenerator::new(self.generator_config(checkpoint)?)?;
        let examples = self.load_test_examples(generator.tokenizer())?;
        self.evaluate_with(&generator, checkpoint, &examples, num_samples)
    }

    /// Evaluate every checkpoint under `base_dir` and return the best.
    ///
    /// The base model is loaded once; each checkpoint swaps in its adapter.
    pub fn find_best_checkpoint(
        &self,
        base_dir: &Path,
        num_samples: Option<usize>,
    ) -> Result<CheckpointScore> {
        let mut generator: Option<CandleGenerator> = None;
        let mut examples: Vec<Example> = Vec::new();

        let scores = scan_checkpoints(base_dir, num_samples, |checkpoint, cap| {
            let loaded = match generator.take() {
                Some(mut loaded) => {
                    loaded.load_adapter(checkpoint)?;
                    loaded
                }
                None => {
                    let loaded = CandleGenerator::new(self.generator_config(checkpoint)?)?;
                    examples = self.load_test_examples(loaded.tokenizer())?;
                    loaded
                }
            };
            let metrics = self
                .evaluate_with(&loaded, checkpoint, &examples, Some(cap))?
                .metrics;
            generator = Some(loaded);
            Ok(metrics)
        })?;

        let best = select_best(&scores)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No checkpoint was evaluated"))?;
        tracing::info!(
            "Best checkpoint: {:?} (exact_match={:.4})",
            best.checkpoint,
            best.metrics.exact_match
        );
        Ok(best)
    }
}
