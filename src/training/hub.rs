//! HuggingFace Hub integration for model and dataset downloading
//!
//! Provides functionality to download models and datasets from HuggingFace Hub
//! and to resolve local model directories.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const SHARD_INDEX: &str = "model.safetensors.index.json";

/// File extensions accepted as dataset shards
pub const DATASET_EXTENSIONS: &[&str] = &["jsonl", "json", "parquet"];

/// HuggingFace Hub API wrapper
pub struct HubApi {
    api: Api,
}

impl HubApi {
    /// Create a new HubApi instance
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Download a model from HuggingFace Hub
    ///
    /// Fetches `config.json`, the safetensors weights (single file or sharded)
    /// and the tokenizer files when present.
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        tracing::debug!("Downloaded config.json: {:?}", config_path);

        let weights_files = if let Ok(path) = repo.get("model.safetensors") {
            tracing::debug!("Downloaded model.safetensors: {:?}", path);
            vec![path]
        } else {
            let index = repo
                .get(SHARD_INDEX)
                .context("No model weights found (tried model.safetensors and sharded index)")?;
            let mut paths = Vec::new();
            for shard in shard_names(&index)? {
                paths.push(
                    repo.get(&shard)
                        .with_context(|| format!("Failed to download weight shard {}", shard))?,
                );
            }
            paths
        };

        let tokenizer_path = repo.get("tokenizer.json").ok();
        let tokenizer_config_path = repo.get("tokenizer_config.json").ok();

        if tokenizer_path.is_some() {
            tracing::debug!("Downloaded tokenizer.json");
        }

        let model_dir = config_path
            .parent()
            .ok_or_else(|| anyhow!("Invalid config path"))?
            .to_path_buf();

        Ok(ModelPath {
            path: model_dir,
            model_id: model_id.to_string(),
            is_local: false,
            config_file: config_path,
            weights_files,
            tokenizer_file: tokenizer_path,
            tokenizer_config_file: tokenizer_config_path,
        })
    }

    /// Download every data file of a dataset repository
    ///
    /// Returns the local paths of all `.jsonl`, `.json` and `.parquet` files,
    /// sorted by their repository file name.
    pub fn download_dataset_files(&self, dataset_id: &str) -> Result<Vec<PathBuf>> {
        tracing::info!("Downloading dataset from HuggingFace Hub: {}", dataset_id);

        let repo: ApiRepo = self.api.dataset(dataset_id.to_string());
        let info = repo
            .info()
            .with_context(|| format!("Failed to list files of dataset {}", dataset_id))?;

        let mut names: Vec<String> = info
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .filter(|name| is_dataset_file(Path::new(name)))
            .collect();
        names.sort();

        if names.is_empty() {
            anyhow::bail!("Dataset {} has no jsonl/json/parquet data files", dataset_id);
        }

        names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {} from {}", name, dataset_id))
            })
            .collect()
    }
}

/// Whether a path looks like a dataset shard
pub fn is_dataset_file(path: &Path) -> bool {
    let is_data = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| DATASET_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false);
    let is_metadata = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') || n == "dataset_infos.json" || n == "dataset_info.json")
        .unwrap_or(true);
    is_data && !is_metadata
}

/// Read the shard file names out of a safetensors index
fn shard_names(index_file: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_file)
        .with_context(|| format!("Failed to read {:?}", index_file))?;
    let index: serde_json::Value =
        serde_json::from_str(&content).context("Failed to parse safetensors index")?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("Safetensors index has no weight_map"))?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

/// Represents a downloaded or local model path
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Original model ID (e.g., "Qwen/Qwen2.5-Coder-1.5B-Instruct")
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Safetensors weight files (one, or all shards in order)
    pub weights_files: Vec<PathBuf>,
    /// Path to tokenizer.json (optional)
    pub tokenizer_file: Option<PathBuf>,
    /// Path to tokenizer_config.json (optional)
    pub tokenizer_config_file: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weights_files = if path.join("model.safetensors").exists() {
            vec![path.join("model.safetensors")]
        } else if path.join(SHARD_INDEX).exists() {
            shard_names(&path.join(SHARD_INDEX))?
                .into_iter()
                .map(|name| path.join(name))
                .collect()
        } else {
            return Err(anyhow!(
                "No model weights found in {:?} (tried model.safetensors and {})",
                path,
                SHARD_INDEX
            ));
        };

        let tokenizer_file = path.join("tokenizer.json");
        let tokenizer_config_file = path.join("tokenizer_config.json");

        Ok(Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            path: path.clone(),
            is_local: true,
            config_file,
            weights_files,
            tokenizer_file: tokenizer_file.exists().then_some(tokenizer_file),
            tokenizer_config_file: tokenizer_config_file
                .exists()
                .then_some(tokenizer_config_file),
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        for weights in &self.weights_files {
            if !weights.exists() {
                return Err(anyhow!("Weights file not found: {:?}", weights));
            }
        }
        Ok(())
    }
}

/// Model loader that handles both local and HuggingFace models
pub struct ModelLoader {
    hub: HubApi,
}

impl ModelLoader {
    /// Create a new ModelLoader
    pub fn new() -> Result<Self> {
        Ok(Self {
            hub: HubApi::new()?,
        })
    }

    /// Load model path - auto-detects local vs HuggingFace
    ///
    /// If the path exists locally, treats it as a local path.
    /// Otherwise, downloads from HuggingFace Hub.
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        let local_path = Path::new(model_id_or_path);
        let looks_local = model_id_or_path.starts_with('.')
            || model_id_or_path.starts_with('/')
            || model_id_or_path.starts_with('~');

        if local_path.exists() {
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            ModelPath::from_local(model_id_or_path)
        } else if looks_local {
            Err(anyhow!(
                "Local model path does not exist: {}",
                model_id_or_path
            ))
        } else {
            self.hub.download_model(model_id_or_path)
        }
    }

    /// Access the underlying Hub client
    pub fn hub(&self) -> &HubApi {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dataset_file_filter() {
        assert!(is_dataset_file(Path::new("data/train-00000-of-00001.parquet")));
        assert!(is_dataset_file(Path::new("train.jsonl")));
        assert!(is_dataset_file(Path::new("test.JSON")));
        assert!(!is_dataset_file(Path::new("README.md")));
        assert!(!is_dataset_file(Path::new(".gitattributes")));
        assert!(!is_dataset_file(Path::new("dataset_infos.json")));
    }

    #[test]
    fn test_local_sharded_model_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(
            dir.path().join(SHARD_INDEX),
            r#"{"weight_map": {"a": "model-00002-of-00002.safetensors", "b": "model-00001-of-00002.safetensors", "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();

        let path = ModelPath::from_local(dir.path()).unwrap();
        assert_eq!(path.weights_files.len(), 2);
        assert!(path.weights_files[0].ends_with("model-00001-of-00002.safetensors"));
        assert!(path.tokenizer_file.is_none());
        // Shards were never written
        assert!(path.validate().is_err());
    }

    #[test]
    fn test_missing_local_path() {
        assert!(ModelPath::from_local("/definitely/not/here").is_err());
    }
}
