//! LoRA fine-tuning
//!
//! Parameter-efficient fine-tuning using Candle.
//!
//! # LoRA (Low-Rank Adaptation)
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices:
//!
//! ```text
//! W' = W + BA * (alpha / rank)
//! ```
//!
//! Where:
//! - W is the frozen pretrained weight
//! - B ∈ ℝ^(out × rank) initialized to zeros
//! - A ∈ ℝ^(rank × in) initialized with Kaiming uniform
//! - alpha is a scaling factor
//!
//! Adapter tensors are stored under PEFT names so that `adapter_model.safetensors`
//! can be loaded by other tooling.

use anyhow::{Context, Result};
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Module, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Projection layers that can carry an adapter
pub const SUPPORTED_TARGETS: &[&str] = &[
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "gate_proj",
    "up_proj",
    "down_proj",
];

/// Prefix PEFT puts in front of every adapter tensor
pub const PEFT_PREFIX: &str = "base_model.model";

/// File name of the adapter weights inside a checkpoint
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// File name of the adapter configuration inside a checkpoint
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// LoRA configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition
    pub rank: usize,
    /// Scaling factor numerator
    pub alpha: f32,
    /// Dropout probability applied to the adapter input
    pub dropout: f32,
    /// Projection layers to wrap
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 32,
            alpha: 64.0,
            dropout: 0.1,
            target_modules: SUPPORTED_TARGETS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl LoraConfig {
    /// Create a new LoRA config
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            ..Default::default()
        }
    }

    /// Set dropout
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set target modules
    pub fn with_target_modules(mut self, modules: Vec<String>) -> Self {
        self.target_modules = modules;
        self
    }

    /// Get the scaling factor
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    /// Whether a projection gets an adapter
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    /// Reject ranks of zero and unknown target names
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            anyhow::bail!("LoRA rank must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("LoRA dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.target_modules.is_empty() {
            anyhow::bail!("LoRA needs at least one target module");
        }
        for module in &self.target_modules {
            if !SUPPORTED_TARGETS.contains(&module.as_str()) {
                anyhow::bail!(
                    "Unsupported LoRA target module: {}. Supported: {}",
                    module,
                    SUPPORTED_TARGETS.join(", ")
                );
            }
        }
        Ok(())
    }

    /// PEFT adapter config for a given base model
    pub fn adapter_config(&self, base_model: &str) -> AdapterConfig {
        AdapterConfig {
            r: self.rank,
            lora_alpha: self.alpha,
            lora_dropout: self.dropout,
            target_modules: self.target_modules.clone(),
            bias: "none".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            peft_type: "LORA".to_string(),
            base_model_name_or_path: base_model.to_string(),
        }
    }
}

/// On-disk `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f32,
    #[serde(default)]
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default)]
    pub base_model_name_or_path: String,
}

fn default_bias() -> String {
    "none".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

impl AdapterConfig {
    /// Read `adapter_config.json` from a checkpoint directory
    pub fn load(checkpoint_dir: impl AsRef<Path>) -> Result<Self> {
        let path = checkpoint_dir.as_ref().join(ADAPTER_CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Write `adapter_config.json` into a directory
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))
    }

    /// Back to a runtime config
    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            rank: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
        }
    }
}

/// Frozen base projection
enum BaseProjection {
    Dense(Linear),
    /// Q8_0 weight, dequantized on every forward
    Quantized {
        weight: Arc<QTensor>,
        bias: Option<Tensor>,
        dtype: DType,
    },
}

impl BaseProjection {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(linear) => Ok(linear.forward(x)?),
            Self::Quantized {
                weight,
                bias,
                dtype,
            } => {
                let w = weight.dequantize(x.device())?.to_dtype(*dtype)?;
                let out = x.broadcast_matmul(&w.t()?)?;
                match bias {
                    Some(b) => Ok(out.broadcast_add(b)?),
                    None => Ok(out),
                }
            }
        }
    }

    fn num_params(&self) -> usize {
        match self {
            Self::Dense(linear) => {
                linear.weight().elem_count() + linear.bias().map(|b| b.elem_count()).unwrap_or(0)
            }
            Self::Quantized { weight, bias, .. } => {
                weight.shape().elem_count() + bias.as_ref().map(|b| b.elem_count()).unwrap_or(0)
            }
        }
    }
}

/// Trainable low-rank pair
struct Adapter {
    /// Down projection: input_dim -> rank
    lora_a: Tensor,
    /// Up projection: rank -> output_dim
    lora_b: Tensor,
    scaling: f64,
    dropout: Option<Dropout>,
}

/// LoRA linear layer
///
/// Wraps a frozen base linear layer with an optional trainable adapter.
pub struct LoraLinear {
    base: BaseProjection,
    adapter: Option<Adapter>,
    in_features: usize,
    out_features: usize,
}

impl LoraLinear {
    /// Wrap a base projection.
    ///
    /// `base_vb` points at the frozen weights (e.g. `model.layers.0.self_attn.q_proj`),
    /// `lora_vb` at the matching trainable prefix. With `lora_vb = None` the layer stays frozen.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        base_vb: VarBuilder,
        lora_vb: Option<VarBuilder>,
        config: &LoraConfig,
        quantize: bool,
    ) -> Result<Self> {
        let linear = if bias {
            candle_nn::linear(in_features, out_features, base_vb)?
        } else {
            candle_nn::linear_no_bias(in_features, out_features, base_vb)?
        };
        Self::from_linear(linear, lora_vb, config, quantize)
    }

    /// Wrap an already loaded linear layer
    pub fn from_linear(
        linear: Linear,
        lora_vb: Option<VarBuilder>,
        config: &LoraConfig,
        quantize: bool,
    ) -> Result<Self> {
        let (out_features, in_features) = linear.weight().dims2()?;

        let base = if quantize {
            let block = GgmlDType::Q8_0.block_size();
            if in_features % block != 0 {
                anyhow::bail!(
                    "Cannot quantize projection with input dim {} (not a multiple of {})",
                    in_features,
                    block
                );
            }
            let dtype = linear.weight().dtype();
            let weight = QTensor::quantize(&linear.weight().to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
            BaseProjection::Quantized {
                weight: Arc::new(weight),
                bias: linear.bias().cloned(),
                dtype,
            }
        } else {
            BaseProjection::Dense(linear)
        };

        let adapter = match lora_vb {
            Some(vb) => {
                let lora_a = vb.pp("lora_A").get_with_hints(
                    (config.rank, in_features),
                    "weight",
                    Init::Kaiming {
                        dist: candle_nn::init::NormalOrUniform::Uniform,
                        fan: candle_nn::init::FanInOut::FanIn,
                        non_linearity: candle_nn::init::NonLinearity::Linear,
                    },
                )?;
                let lora_b = vb.pp("lora_B").get_with_hints(
                    (out_features, config.rank),
                    "weight",
                    Init::Const(0.0),
                )?;
                Some(Adapter {
                    lora_a,
                    lora_b,
                    scaling: config.scaling() as f64,
                    dropout: (config.dropout > 0.0).then(|| Dropout::new(config.dropout)),
                })
            }
            None => None,
        };

        Ok(Self {
            base,
            adapter,
            in_features,
            out_features,
        })
    }

    /// Forward pass; dropout on the adapter path only runs when `train` is set
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let base_out = self.base.forward(x)?;

        let adapter = match &self.adapter {
            Some(adapter) => adapter,
            None => return Ok(base_out),
        };

        let h = x.to_dtype(DType::F32)?;
        let h = match &adapter.dropout {
            Some(dropout) => dropout.forward(&h, train)?,
            None => h,
        };

        // x @ A^T @ B^T * scaling
        let lora_out = h
            .broadcast_matmul(&adapter.lora_a.t()?)?
            .broadcast_matmul(&adapter.lora_b.t()?)?;
        let scaled = (lora_out * adapter.scaling)?.to_dtype(base_out.dtype())?;
        Ok((base_out + scaled)?)
    }

    /// Whether the layer carries an adapter
    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// Whether the frozen weight is stored quantized
    pub fn is_quantized(&self) -> bool {
        matches!(self.base, BaseProjection::Quantized { .. })
    }

    /// Get number of trainable parameters
    pub fn num_trainable_params(&self) -> usize {
        self.adapter
            .as_ref()
            .map(|a| a.lora_a.elem_count() + a.lora_b.elem_count())
            .unwrap_or(0)
    }

    /// Get number of frozen parameters
    pub fn num_frozen_params(&self) -> usize {
        self.base.num_params()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

/// Statistics about LoRA parameters
#[derive(Debug, Clone)]
pub struct LoraStats {
    /// Total parameters in the model
    pub total_params: usize,
    /// Trainable parameters (LoRA only)
    pub trainable_params: usize,
    /// Percentage of trainable parameters
    pub trainable_percent: f64,
    /// Number of LoRA layers
    pub num_lora_layers: usize,
}

impl LoraStats {
    /// Create stats from counts
    pub fn new(total: usize, trainable: usize, num_layers: usize) -> Self {
        let trainable_percent = if total == 0 {
            0.0
        } else {
            trainable as f64 / total as f64 * 100.0
        };
        Self {
            total_params: total,
            trainable_params: trainable,
            trainable_percent,
            num_lora_layers: num_layers,
        }
    }
}

impl std::fmt::Display for LoraStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4} ({} LoRA layers)",
            self.trainable_params, self.total_params, self.trainable_percent, self.num_lora_layers
        )
    }
}
