//! Loss statistics from a training log directory

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::training::callbacks::{LogRecord, LOG_FILE_PREFIX};

/// Summary of one run's JSONL log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub log_file: PathBuf,
    /// Number of records carrying a train loss
    pub train_records: usize,
    pub first_loss: f64,
    pub last_loss: f64,
    /// Relative drop from first to last train loss, in percent (0 when the first loss is 0)
    pub improvement: f64,
    pub best_eval_loss: Option<f64>,
    /// Step of the best eval loss (first one on ties)
    pub best_eval_step: Option<usize>,
}

impl std::fmt::Display for TrainingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Log file: {}", self.log_file.display())?;
        writeln!(f, "  Total steps: {}", self.train_records)?;
        writeln!(f, "  First loss: {:.4}", self.first_loss)?;
        writeln!(f, "  Last loss: {:.4}", self.last_loss)?;
        writeln!(f, "  Improvement: {:.1}%", self.improvement)?;
        if let (Some(loss), Some(step)) = (self.best_eval_loss, self.best_eval_step) {
            writeln!(f, "  Best eval loss: {:.4}", loss)?;
            writeln!(f, "  Best checkpoint: step-{}", step)?;
        }
        Ok(())
    }
}

/// First `training_log_*.jsonl` in `log_dir` by name
pub fn find_log_file(log_dir: &Path) -> Result<PathBuf> {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory {:?}", log_dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    logs.sort();
    logs.into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No training log found in {:?}", log_dir))
}

/// Parse every line of a JSONL log
pub fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid log record at line {} of {:?}", i + 1, path))
        })
        .collect()
}

/// Compute statistics from the records of one log file
pub fn compute_stats(log_file: &Path, records: &[LogRecord]) -> Result<TrainingStats> {
    let train: Vec<f64> = records.iter().filter_map(|r| r.train_loss).collect();
    let (first_loss, last_loss) = match (train.first(), train.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => anyhow::bail!("No train loss found in {:?}", log_file),
    };

    let mut best: Option<(f64, usize)> = None;
    for record in records {
        if let Some(loss) = record.eval_loss {
            if best.map(|(b, _)| loss < b).unwrap_or(true) {
                best = Some((loss, record.step));
            }
        }
    }

    Ok(TrainingStats {
        log_file: log_file.to_path_buf(),
        train_records: train.len(),
        first_loss,
        last_loss,
        improvement: improvement_percent(first_loss, last_loss),
        best_eval_loss: best.map(|(l, _)| l),
        best_eval_step: best.map(|(_, s)| s),
    })
}

fn improvement_percent(first: f64, last: f64) -> f64 {
    if first == 0.0 {
        return 0.0;
    }
    (first - last) / first * 100.0
}

/// Locate, read and summarise the log in `log_dir`
pub fn training_stats(log_dir: &Path) -> Result<TrainingStats> {
    let log_file = find_log_file(log_dir)?;
    let records = read_log(&log_file)?;
    compute_stats(&log_file, &records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LOG: &str = r#"{"step":20,"epoch":0.1,"timestamp":"t","train_loss":2.0,"learning_rate":0.0002}
{"step":40,"epoch":0.2,"timestamp":"t","train_loss":1.5}
{"step":40,"epoch":0.2,"timestamp":"t","eval_loss":1.4}
{"step":60,"epoch":0.3,"timestamp":"t","train_loss":1.0}
{"step":80,"epoch":0.4,"timestamp":"t","eval_loss":1.2}
{"step":100,"epoch":0.5,"timestamp":"t","eval_loss":1.2}
"#;

    #[test]
    fn test_stats_from_log_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("training_log_20240101_000000.jsonl"), LOG).unwrap();
        std::fs::write(dir.path().join("training_log_20250101_000000.jsonl"), "garbage").unwrap();
        std::fs::write(dir.path().join("training_summary.json"), "{}").unwrap();

        let stats = training_stats(dir.path()).unwrap();
        assert!(stats.log_file.ends_with("training_log_20240101_000000.jsonl"));
        assert_eq!(stats.train_records, 3);
        assert_eq!(stats.first_loss, 2.0);
        assert_eq!(stats.last_loss, 1.0);
        assert!((stats.improvement - 50.0).abs() < 1e-9);
        assert_eq!(stats.best_eval_loss, Some(1.2));
        assert_eq!(stats.best_eval_step, Some(80));
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(training_stats(dir.path()).is_err());
    }

    #[test]
    fn test_zero_first_loss_reports_no_improvement() {
        let path = PathBuf::from("training_log_x.jsonl");
        let records: Vec<LogRecord> = [0.0, 0.5]
            .iter()
            .enumerate()
            .map(|(i, loss)| {
                serde_json::from_value(serde_json::json!({
                    "step": i + 1,
                    "epoch": 0.1,
                    "timestamp": "t",
                    "train_loss": loss,
                }))
                .unwrap()
            })
            .collect();

        let stats = compute_stats(&path, &records).unwrap();
        assert_eq!(stats.improvement, 0.0);
        assert!(stats.to_string().contains("Improvement: 0.0%"));
    }

    #[test]
    fn test_eval_only_log_has_no_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("training_log_x.jsonl");
        std::fs::write(&path, "{\"step\":1,\"epoch\":0.1,\"timestamp\":\"t\",\"eval_loss\":1.0}\n").unwrap();
        let records = read_log(&path).unwrap();
        assert!(compute_stats(&path, &records).is_err());
    }
}
