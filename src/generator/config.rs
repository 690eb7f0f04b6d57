//! Configuration for text generators
//!
//! Defines configuration structures for generator initialization
//! and sampling parameters for controlling generation behavior.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::training::pipeline::DEFAULT_BASE_MODEL;
use crate::training::DevicePreference;

/// Configuration for initializing a generator model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// HuggingFace model ID or local path of the base model
    pub base_model: String,

    /// Adapter checkpoint (directory with `adapter_model.safetensors`)
    pub adapter_path: Option<PathBuf>,

    /// Device preference (auto, cuda, metal, cpu)
    pub device: DevicePreference,

    /// Run the frozen base weights in bf16 on accelerators
    pub bf16: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_BASE_MODEL.to_string(),
            adapter_path: None,
            device: DevicePreference::Auto,
            bf16: true,
        }
    }
}

impl GeneratorConfig {
    /// Create a new generator config with the given base model
    pub fn new(base_model: &str) -> Self {
        Self {
            base_model: base_model.to_string(),
            ..Default::default()
        }
    }

    /// Set the adapter checkpoint
    pub fn with_adapter(mut self, path: impl Into<PathBuf>) -> Self {
        self.adapter_path = Some(path.into());
        self
    }

    /// Set the device preference
    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_bf16(mut self, bf16: bool) -> Self {
        self.bf16 = bf16;
        self
    }
}

/// Sampling parameters for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Softmax temperature, ignored without sampling
    pub temperature: f64,

    /// Nucleus-sampling threshold (1.0 disables it)
    pub top_p: f64,

    /// Sample from the distribution instead of taking the argmax
    pub do_sample: bool,

    /// Maximum new tokens to generate
    pub max_new_tokens: usize,

    /// Sampler seed
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            do_sample: true,
            max_new_tokens: 512,
            seed: 42,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_sampling(mut self, do_sample: bool) -> Self {
        self.do_sample = do_sample;
        self
    }

    pub fn with_max_new_tokens(mut self, max_tokens: usize) -> Self {
        self.max_new_tokens = max_tokens;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// `(temperature, top_p)` as the logits sampler expects them.
    ///
    /// `None` temperature means argmax.
    pub fn sampler_settings(&self) -> (Option<f64>, Option<f64>) {
        if !self.do_sample || self.temperature <= 0.0 {
            return (None, None);
        }
        let top_p = (self.top_p < 1.0).then_some(self.top_p);
        (Some(self.temperature), top_p)
    }
}
