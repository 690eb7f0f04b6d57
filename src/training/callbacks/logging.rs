//! Structured JSONL training log and end-of-run summary

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{CallbackAction, MetricsEvent, RunSummary, TrainingListener};

/// Name of the summary written at the end of a run
pub const SUMMARY_FILE: &str = "training_summary.json";
/// Prefix of per-run log files
pub const LOG_FILE_PREFIX: &str = "training_log_";

/// One line of the JSONL log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub step: usize,
    pub epoch: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
}

/// A (step, loss) pair in the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossPoint {
    pub step: usize,
    pub loss: f64,
}

/// Contents of `training_summary.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub total_steps: usize,
    pub total_epochs: f64,
    pub train_losses: Vec<LossPoint>,
    pub eval_losses: Vec<LossPoint>,
}

/// Appends every log event to a timestamped JSONL file
pub struct LoggingCallback {
    log_dir: PathBuf,
    log_file: PathBuf,
    train_losses: Vec<LossPoint>,
    eval_losses: Vec<LossPoint>,
}

impl LoggingCallback {
    /// Create the log directory and pick the log file name
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_file = log_dir.join(format!("{}{}.jsonl", LOG_FILE_PREFIX, stamp));

        Ok(Self {
            log_dir,
            log_file,
            train_losses: Vec::new(),
            eval_losses: Vec::new(),
        })
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn summary_file(&self) -> PathBuf {
        self.log_dir.join(SUMMARY_FILE)
    }

    pub fn train_losses(&self) -> &[LossPoint] {
        &self.train_losses
    }

    pub fn eval_losses(&self) -> &[LossPoint] {
        &self.eval_losses
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file {:?}", self.log_file))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to write log file {:?}", self.log_file))?;
        Ok(())
    }
}

impl TrainingListener for LoggingCallback {
    fn name(&self) -> &'static str {
        "LoggingCallback"
    }

    fn handle_log(&mut self, event: &MetricsEvent) -> Result<CallbackAction> {
        let record = LogRecord {
            step: event.step,
            epoch: event.epoch,
            timestamp: chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            train_loss: event.metrics.loss,
            eval_loss: event.metrics.eval_loss,
            learning_rate: event.metrics.learning_rate,
        };

        self.append(&record)?;

        if let Some(loss) = record.train_loss {
            self.train_losses.push(LossPoint {
                step: event.step,
                loss,
            });
        }
        if let Some(loss) = record.eval_loss {
            self.eval_losses.push(LossPoint {
                step: event.step,
                loss,
            });
        }

        tracing::info!(
            "Step {} | epoch {:.2} | train_loss {} | eval_loss {} | lr {}",
            record.step,
            record.epoch,
            fmt_opt(record.train_loss),
            fmt_opt(record.eval_loss),
            record
                .learning_rate
                .map(|lr| format!("{:.2e}", lr))
                .unwrap_or_else(|| "-".to_string())
        );

        Ok(CallbackAction::Continue)
    }

    fn handle_train_end(&mut self, summary: &RunSummary) -> Result<()> {
        let out = TrainingSummary {
            total_steps: summary.total_steps,
            total_epochs: summary.total_epochs,
            train_losses: self.train_losses.clone(),
            eval_losses: self.eval_losses.clone(),
        };

        let path = self.summary_file();
        let content = serde_json::to_string_pretty(&out)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write summary {:?}", path))?;

        tracing::info!("Training finished. Log file: {:?}", self.log_file);
        Ok(())
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| "-".to_string())
}
