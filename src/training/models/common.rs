//! Common traits and utilities for all model types

use anyhow::Result;
use candle_core::{Device, Tensor};

/// A causal language model that can be trained and sampled from
pub trait CausalLm {
    /// Full-sequence logits `(batch, seq, vocab)`
    fn forward_train(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;

    /// Logits `(batch, vocab)` for the last position of `input_ids`, which starts at `offset`
    fn forward_step(&self, input_ids: &Tensor, offset: usize, cache: &mut KvCache) -> Result<Tensor>;

    /// Number of decoder layers (for sizing the KV cache)
    fn num_layers(&self) -> usize;

    fn device(&self) -> &Device;
}

/// Trait for models that carry LoRA adapters
pub trait LoraModel: CausalLm {
    fn num_trainable_params(&self) -> usize;
    fn num_total_params(&self) -> usize;
    fn num_lora_layers(&self) -> usize;
}

/// Per-layer key/value cache for incremental decoding
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
        }
    }

    /// Append new keys/values `(b, heads, seq, dim)` for a layer and return the full history
    pub fn append(&mut self, layer: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| anyhow::anyhow!("KV cache has no layer {}", layer))?;

        let (k, v) = match slot.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, &k], 2)?.contiguous()?,
                Tensor::cat(&[&prev_v, &v], 2)?.contiguous()?,
            ),
            None => (k, v),
        };
        *slot = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    /// Cached sequence length
    pub fn seq_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|l| l.as_ref())
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.layers.iter_mut().for_each(|l| *l = None);
    }
}

/// Model architecture types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    Qwen2,
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Qwen2 => write!(f, "qwen2"),
        }
    }
}

/// Detect model architecture from config
pub fn detect_architecture(
    model_type: Option<&str>,
    architectures: &[String],
) -> Result<ModelArchitecture> {
    if let Some(mt) = model_type {
        if mt.to_lowercase().contains("qwen2") {
            return Ok(ModelArchitecture::Qwen2);
        }
    }

    for arch in architectures {
        if arch.to_lowercase().contains("qwen2") {
            return Ok(ModelArchitecture::Qwen2);
        }
    }

    anyhow::bail!(
        "Could not detect model architecture from type={:?}, architectures={:?}. Supported: qwen2",
        model_type,
        architectures
    )
}
