use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codetune::cli::{self, EvaluateArgs, GenerateArgs, StatsArgs, TrainArgs};

#[derive(Parser)]
#[command(name = "codetune")]
#[command(about = "LoRA fine-tuning and evaluation of code-generation models", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the base model on the deep or diverse dataset
    Train(TrainArgs),

    /// Evaluate one checkpoint or pick the best under a directory
    Evaluate(EvaluateArgs),

    /// Summarise the loss curve of a training run
    Stats(StatsArgs),

    /// Generate solutions with the fine-tuned adapters
    Generate(GenerateArgs),
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codetune=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => cli::train(args)?,
        Commands::Evaluate(args) => cli::evaluate(args)?,
        Commands::Stats(args) => cli::stats(args)?,
        Commands::Generate(args) => cli::generate(args)?,
    }

    Ok(())
}
