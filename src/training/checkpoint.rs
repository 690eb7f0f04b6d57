//! Adapter checkpoints: writing, rotation and reloading
//!
//! A checkpoint is a directory `checkpoint-<step>` holding the adapter weights,
//! `adapter_config.json`, the tokenizer and `trainer_state.json`.

use anyhow::{Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::callbacks::MetricsEvent;
use super::lora::{AdapterConfig, ADAPTER_WEIGHTS_FILE};

/// Directory-name prefix of step checkpoints
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
/// Trainer state file inside a checkpoint
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
/// Directory for the final artifacts
pub const FINAL_MODEL_DIR: &str = "final_model";

/// Run state persisted with each checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub eval_loss: Option<f64>,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<String>,
    #[serde(default)]
    pub log_history: Vec<MetricsEvent>,
}

impl TrainerState {
    pub fn load(checkpoint_dir: impl AsRef<Path>) -> Result<Self> {
        let path = checkpoint_dir.as_ref().join(TRAINER_STATE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Step number encoded in a checkpoint directory name
pub fn checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// Writes and prunes checkpoints under one output directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
    adapter_config: AdapterConfig,
    tokenizer_file: Option<PathBuf>,
}

impl CheckpointManager {
    pub fn new(output_dir: impl AsRef<Path>, adapter_config: AdapterConfig) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            save_total_limit: None,
            adapter_config,
            tokenizer_file: None,
        }
    }

    /// Keep at most `limit` step checkpoints
    pub fn with_save_total_limit(mut self, limit: Option<usize>) -> Self {
        self.save_total_limit = limit;
        self
    }

    /// Copy this `tokenizer.json` into every checkpoint
    pub fn with_tokenizer_file(mut self, path: Option<PathBuf>) -> Self {
        self.tokenizer_file = path;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
    }

    /// Adapter weights, adapter config and tokenizer into `dir`
    pub fn save_artifacts(&self, var_map: &VarMap, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint directory {:?}", dir))?;

        var_map
            .save(dir.join(ADAPTER_WEIGHTS_FILE))
            .context("Failed to save adapter weights")?;
        self.adapter_config.save(dir)?;

        if let Some(tokenizer) = &self.tokenizer_file {
            std::fs::copy(tokenizer, dir.join("tokenizer.json"))
                .with_context(|| format!("Failed to copy tokenizer from {:?}", tokenizer))?;
        }
        Ok(())
    }

    /// Write `checkpoint-<step>` with the trainer state
    pub fn save(&self, var_map: &VarMap, state: &TrainerState) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(state.global_step);
        self.save_artifacts(var_map, &dir)?;

        let path = dir.join(TRAINER_STATE_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Failed to write {:?}", path))?;

        tracing::info!("Saved checkpoint to {:?}", dir);
        Ok(dir)
    }

    /// Write the final adapter to `output_dir/final_model`
    pub fn save_final(&self, var_map: &VarMap) -> Result<PathBuf> {
        let dir = self.output_dir.join(FINAL_MODEL_DIR);
        self.save_artifacts(var_map, &dir)?;
        tracing::info!("Saved final model to {:?}", dir);
        Ok(dir)
    }

    /// Step checkpoints ordered by step
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.output_dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(usize, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.output_dir)
            .with_context(|| format!("Failed to list {:?}", self.output_dir))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(step) = checkpoint_step(&path) {
                found.push((step, path));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found.into_iter().map(|(_, p)| p).collect())
    }

    /// Delete the oldest checkpoints beyond the limit, never `best`.
    ///
    /// Returns the removed directories.
    pub fn rotate(&self, best: Option<&Path>) -> Result<Vec<PathBuf>> {
        let limit = match self.save_total_limit {
            Some(limit) => limit,
            None => return Ok(Vec::new()),
        };

        let checkpoints = self.list()?;
        let mut excess = checkpoints.len().saturating_sub(limit);
        let mut removed = Vec::new();

        for path in checkpoints {
            if excess == 0 {
                break;
            }
            if best.map(|b| b == path.as_path()).unwrap_or(false) {
                continue;
            }
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to delete old checkpoint {:?}", path))?;
            tracing::info!("Deleted old checkpoint {:?}", path);
            removed.push(path);
            excess -= 1;
        }
        Ok(removed)
    }
}

/// Load adapter weights from a checkpoint into already registered variables
pub fn load_adapter(var_map: &mut VarMap, checkpoint_dir: &Path) -> Result<()> {
    let path = checkpoint_dir.join(ADAPTER_WEIGHTS_FILE);
    var_map
        .load(&path)
        .with_context(|| format!("Failed to load adapter weights from {:?}", path))?;
    tracing::info!("Loaded adapter weights from {:?}", path);
    Ok(())
}
