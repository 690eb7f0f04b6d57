//! Command-line interface
//!
//! Provides CLI commands for train, evaluate, stats, and generate.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::evaluation::{training_stats, CheckpointEvaluator};
use crate::generator::{GenerationContext, GeneratorConfig, SamplingParams};
use crate::training::dataset::DatasetVariant;
use crate::training::device::ensure_accelerator_or_confirm;
use crate::training::pipeline::{self, FineTuneConfig, DEFAULT_BASE_MODEL};
use crate::training::DevicePreference;

/// Arguments of `codetune train`
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Dataset variant: deep or diverse
    #[arg(short, long)]
    pub dataset: String,

    /// Train on the reasoning trace instead of the clean solution
    #[arg(long)]
    pub reasoning: bool,

    /// Output directory (default: ./checkpoints/<dataset>)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Local dataset file or directory instead of the Hub dataset
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Base model name or HuggingFace model ID
    #[arg(short, long, default_value = DEFAULT_BASE_MODEL)]
    pub model: String,

    /// Number of epochs
    #[arg(long, default_value = "3")]
    pub epochs: usize,

    /// Learning rate
    #[arg(long, default_value = "2e-4")]
    pub learning_rate: f64,

    /// Per-device batch size
    #[arg(long, default_value = "1")]
    pub batch_size: usize,

    /// Gradient accumulation steps
    #[arg(long, default_value = "16")]
    pub gradient_accumulation: usize,

    /// LoRA rank
    #[arg(long, default_value = "32")]
    pub lora_rank: usize,

    /// LoRA alpha
    #[arg(long, default_value = "64")]
    pub lora_alpha: f32,

    /// Quantize the frozen base projections to 8 bits
    #[arg(long)]
    pub load_in_8bit: bool,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    pub device: String,

    /// Continue on CPU without asking
    #[arg(short, long)]
    pub yes: bool,
}

impl TrainArgs {
    /// Run configuration with the CLI overrides applied
    pub fn to_config(&self) -> Result<FineTuneConfig> {
        let variant: DatasetVariant = self.dataset.parse()?;
        let mut config = FineTuneConfig::new(variant).with_reasoning(self.reasoning);

        config.data_dir = self.data_dir.clone();
        config.device = self.device.parse()?;
        config.model.model_id = self.model.clone();
        config.model.load_in_8bit = self.load_in_8bit;
        config.lora.rank = self.lora_rank;
        config.lora.alpha = self.lora_alpha;
        config.lora.validate()?;

        config.training = config
            .training
            .with_epochs(self.epochs)
            .with_learning_rate(self.learning_rate)
            .with_batch_size(self.batch_size)
            .with_gradient_accumulation(self.gradient_accumulation);
        if let Some(dir) = &self.output_dir {
            config.training.output_dir = dir.clone();
        }
        config.training.validate()?;
        Ok(config)
    }
}

/// Arguments of `codetune evaluate`
#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Dataset variant: deep or diverse
    #[arg(long)]
    pub dataset: String,

    /// Evaluate a single checkpoint directory
    #[arg(long = "checkpoint_path", alias = "checkpoint-path", conflicts_with = "base_dir")]
    pub checkpoint_path: Option<PathBuf>,

    /// Evaluate every checkpoint-* directory under this path
    #[arg(long = "base_dir", alias = "base-dir")]
    pub base_dir: Option<PathBuf>,

    /// Maximum number of test samples per checkpoint
    #[arg(long = "num_samples", alias = "num-samples")]
    pub num_samples: Option<usize>,

    /// Local dataset file or directory instead of the Hub dataset
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Base model (default: the one recorded in adapter_config.json)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    pub device: String,
}

/// Where an evaluation run reads checkpoints from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationTarget {
    Checkpoint(PathBuf),
    BaseDir(PathBuf),
}

impl EvaluateArgs {
    pub fn target(&self) -> Result<EvaluationTarget> {
        match (&self.checkpoint_path, &self.base_dir) {
            (Some(path), _) => Ok(EvaluationTarget::Checkpoint(path.clone())),
            (None, Some(dir)) => Ok(EvaluationTarget::BaseDir(dir.clone())),
            (None, None) => anyhow::bail!("Either --checkpoint_path or --base_dir must be given"),
        }
    }

    pub fn to_evaluator(&self) -> Result<CheckpointEvaluator> {
        let mut evaluator = CheckpointEvaluator::new(self.dataset.parse()?);
        evaluator.base_model = self.model.clone();
        evaluator.data_dir = self.data_dir.clone();
        evaluator.device = self.device.parse()?;
        Ok(evaluator)
    }
}

/// Arguments of `codetune stats`
#[derive(Args, Debug, Clone)]
pub struct StatsArgs {
    /// Directory holding training_log_*.jsonl
    #[arg(short, long)]
    pub log_dir: PathBuf,
}

/// Arguments of `codetune generate`
#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Problem statement
    #[arg(short, long)]
    pub problem: String,

    /// Which fine-tuned model to use: deep, diverse, or both
    #[arg(short, long, default_value = "both")]
    pub model: String,

    /// Adapter for the deep model
    #[arg(long, default_value = "./checkpoints/deep/final_model")]
    pub deep_path: PathBuf,

    /// Adapter for the diverse model
    #[arg(long, default_value = "./checkpoints/diverse/final_model")]
    pub diverse_path: PathBuf,

    /// Base model name or HuggingFace model ID
    #[arg(long, default_value = DEFAULT_BASE_MODEL)]
    pub base_model: String,

    /// Sampling temperature
    #[arg(long, default_value = "0.7")]
    pub temperature: f64,

    /// Nucleus-sampling threshold
    #[arg(long, default_value = "0.95")]
    pub top_p: f64,

    /// Maximum new tokens
    #[arg(long, default_value = "512")]
    pub max_tokens: usize,

    /// Greedy decoding
    #[arg(long)]
    pub no_sample: bool,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, default_value = "auto")]
    pub device: String,
}

impl GenerateArgs {
    /// Variants and adapter paths selected by `--model`
    pub fn adapters(&self) -> Result<Vec<(DatasetVariant, PathBuf)>> {
        let deep = (DatasetVariant::Deep, self.deep_path.clone());
        let diverse = (DatasetVariant::Diverse, self.diverse_path.clone());
        match self.model.to_lowercase().as_str() {
            "both" => Ok(vec![deep, diverse]),
            other => match other.parse::<DatasetVariant>()? {
                DatasetVariant::Deep => Ok(vec![deep]),
                DatasetVariant::Diverse => Ok(vec![diverse]),
            },
        }
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams::default()
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
            .with_max_new_tokens(self.max_tokens)
            .with_sampling(!self.no_sample)
    }
}

/// Execute the train command
pub fn train(args: TrainArgs) -> Result<()> {
    let config = args.to_config()?;

    tracing::info!("Starting fine-tuning");
    tracing::info!("  Dataset: {}", config.variant);
    tracing::info!("  Target: {:?}", config.target);
    tracing::info!("  Model: {}", config.model.model_id);
    tracing::info!("  Output: {:?}", config.training.output_dir);
    tracing::info!("  LoRA: rank={}, alpha={}", config.lora.rank, config.lora.alpha);

    if !ensure_accelerator_or_confirm(config.device, args.yes)? {
        println!("Training cancelled.");
        return Ok(());
    }

    let outcome = pipeline::run(&config)?;

    println!("\nTraining Summary:");
    println!("  Steps: {}", outcome.result.global_step);
    println!("  Epochs: {:.2}", outcome.result.epoch);
    if let Some(best) = outcome.result.best_metric {
        println!("  Best eval loss: {:.4}", best);
    }
    if outcome.result.stopped_early {
        println!("  Stopped early");
    }
    println!("  Final model: {}", outcome.final_model_dir.display());
    Ok(())
}

/// Execute the evaluate command
pub fn evaluate(args: EvaluateArgs) -> Result<()> {
    let target = args.target()?;
    let evaluator = args.to_evaluator()?;

    match target {
        EvaluationTarget::Checkpoint(path) => {
            let output = evaluator.evaluate_checkpoint(&path, args.num_samples)?;
            println!("\nEvaluation Results");
            println!("Checkpoint: {}", path.display());
            println!("Dataset: {}", evaluator.dataset);
            print!("{}", output.metrics);
        }
        EvaluationTarget::BaseDir(dir) => {
            let best = evaluator.find_best_checkpoint(&dir, args.num_samples)?;
            println!("\nBest Checkpoint");
            println!("Checkpoint: {}", best.checkpoint.display());
            print!("{}", best.metrics);
        }
    }
    Ok(())
}

/// Execute the stats command
pub fn stats(args: StatsArgs) -> Result<()> {
    let stats = training_stats(&args.log_dir)?;
    print!("{}", stats);
    Ok(())
}

/// Execute the generate command
pub fn generate(args: GenerateArgs) -> Result<()> {
    let adapters = args.adapters()?;
    let device: DevicePreference = args.device.parse()?;
    let base = GeneratorConfig::new(&args.base_model).with_device(device);

    let context = GenerationContext::load(&base, &adapters)?;
    let params = args.sampling_params();

    for (variant, solution) in context.compare(&args.problem, &params)? {
        println!("=== {} ===", variant.to_string().to_uppercase());
        println!("{}\n", solution);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    enum TestCli {
        Train(TrainArgs),
        Evaluate(EvaluateArgs),
        Generate(GenerateArgs),
    }

    fn parse(argv: &[&str]) -> Result<TestCli, clap::Error> {
        TestCli::try_parse_from(std::iter::once("codetune").chain(argv.iter().copied()))
    }

    fn train_args(argv: &[&str]) -> TrainArgs {
        let mut full = vec!["train"];
        full.extend_from_slice(argv);
        match parse(&full).unwrap() {
            TestCli::Train(args) => args,
            _ => unreachable!(),
        }
    }

    fn evaluate_args(argv: &[&str]) -> Result<EvaluateArgs, clap::Error> {
        let mut full = vec!["evaluate"];
        full.extend_from_slice(argv);
        parse(&full).map(|cli| match cli {
            TestCli::Evaluate(args) => args,
            _ => unreachable!(),
        })
    }

    fn generate_args(argv: &[&str]) -> GenerateArgs {
        let mut full = vec!["generate"];
        full.extend_from_slice(argv);
        match parse(&full).unwrap() {
            TestCli::Generate(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_train_args_to_config() {
        let args = train_args(&["--dataset", "Diverse", "--reasoning", "--epochs", "1"]);
        let config = args.to_config().unwrap();

        assert_eq!(config.variant, DatasetVariant::Diverse);
        assert_eq!(config.training.num_epochs, 1);
        assert_eq!(config.training.gradient_accumulation_steps, 16);
        assert_eq!(config.training.output_dir, PathBuf::from("./checkpoints/diverse"));
        assert_eq!(config.lora.rank, 32);
        assert_eq!(config.model.model_id, DEFAULT_BASE_MODEL);
    }

    #[test]
    fn test_unknown_dataset_rejected() {
        let args = train_args(&["--dataset", "wide"]);
        let err = args.to_config().unwrap_err();
        assert!(err.to_string().contains("wide"));
    }

    #[test]
    fn test_evaluate_requires_a_path() {
        let args = evaluate_args(&["--dataset", "deep"]).unwrap();
        let err = args.target().unwrap_err().to_string();
        assert!(err.contains("--checkpoint_path"));
        assert!(err.contains("--base_dir"));
    }

    #[test]
    fn test_evaluate_flags() {
        let args =
            evaluate_args(&["--dataset", "deep", "--base_dir", "ckpts", "--num_samples", "5"]).unwrap();
        assert_eq!(args.target().unwrap(), EvaluationTarget::BaseDir(PathBuf::from("ckpts")));
        assert_eq!(args.num_samples, Some(5));

        let both = evaluate_args(&[
            "--dataset",
            "deep",
            "--base_dir",
            "a",
            "--checkpoint_path",
            "b",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_generate_model_selection() {
        let args = generate_args(&["--problem", "fib", "--model", "deep", "--no-sample"]);
        let adapters = args.adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].0, DatasetVariant::Deep);
        assert!(!args.sampling_params().do_sample);

        let args = generate_args(&["--problem", "fib"]);
        assert_eq!(args.adapters().unwrap().len(), 2);

        let args = generate_args(&["--problem", "fib", "--model", "other"]);
        assert!(args.adapters().is_err());
    }
}
