//! Candle-based generator over the LoRA-adapted Qwen2 decoder

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use std::path::Path;

use super::{generate_with, Generator, GeneratorConfig, SamplingParams};
use crate::training::checkpoint::load_adapter;
use crate::training::hub::ModelLoader;
use crate::training::lora::{AdapterConfig, LoraConfig};
use crate::training::models::{Qwen2LoraModel, TokenizerWrapper};
use crate::training::select_device;

/// Qwen2 generator with an optional adapter checkpoint
pub struct CandleGenerator {
    model: Qwen2LoraModel,
    var_map: VarMap,
    tokenizer: TokenizerWrapper,
    eos_token_ids: Vec<u32>,
    name: String,
    device: Device,
}

impl CandleGenerator {
    /// Create a new Candle generator from config
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let device = select_device(config.device)?;

        tracing::info!("Loading generator model: {}", config.base_model);
        tracing::info!("  Device: {:?}", device);
        if let Some(adapter) = &config.adapter_path {
            tracing::info!("  Adapter: {:?}", adapter);
        }

        // Adapter shape must match the checkpoint
        let lora = match &config.adapter_path {
            Some(path) => AdapterConfig::load(path)?.lora_config(),
            None => LoraConfig::default(),
        };

        let loader = ModelLoader::new()?;
        let model_path = loader.load_model_path(&config.base_model)?;

        let tokenizer = match &config.adapter_path {
            Some(path) if path.join("tokenizer.json").exists() => {
                TokenizerWrapper::from_file(path.join("tokenizer.json"))?
            }
            _ => TokenizerWrapper::from_model_path(&model_path)
                .context("Failed to load tokenizer")?,
        };

        let eos_token_ids = tokenizer.eos_token_ids();
        if eos_token_ids.is_empty() {
            tracing::warn!("Tokenizer defines no EOS token; generation runs to max_new_tokens");
        }

        let mut var_map = VarMap::new();
        let model = Qwen2LoraModel::from_model_path(
            &model_path,
            &lora,
            false,
            config.bf16,
            &var_map,
            &device,
        )?;

        if let Some(path) = &config.adapter_path {
            load_adapter(&mut var_map, path)?;
        }

        let name = match &config.adapter_path {
            Some(path) => format!("{}+{}", config.base_model, path.display()),
            None => config.base_model.clone(),
        };

        tracing::info!("Generator loaded successfully");

        Ok(Self {
            model,
            var_map,
            tokenizer,
            eos_token_ids,
            name,
            device,
        })
    }

    /// Swap in the adapter weights from another checkpoint of the same shape
    pub fn load_adapter(&mut self, path: impl AsRef<Path>) -> Result<()> {
        load_adapter(&mut self.var_map, path.as_ref())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &TokenizerWrapper {
        &self.tokenizer
    }
}

impl Generator for CandleGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        generate_with(
            &self.model,
            &self.tokenizer,
            &self.eos_token_ids,
            prompt,
            params,
        )
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}
