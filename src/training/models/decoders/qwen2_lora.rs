//! Qwen2 decoder with trainable LoRA adapters on every projection
//!
//! Attention, MLP, norms and rotary embeddings are written out with plain
//! tensor ops so gradients flow through the whole stack to the adapters.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use serde::Deserialize;

use crate::training::hub::{ModelLoader, ModelPath};
use crate::training::lora::{LoraConfig, LoraLinear, LoraStats, PEFT_PREFIX};
use crate::training::models::common::{
    detect_architecture, CausalLm, KvCache, LoraModel, ModelArchitecture,
};

/// The subset of `config.json` the decoder needs
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
}

fn default_max_position_embeddings() -> usize {
    32768
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Read and check `config.json`
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse decoder config")?;
        detect_architecture(config.model_type.as_deref(), &config.architectures)?;

        if config.hidden_size % config.num_attention_heads != 0 {
            anyhow::bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                config.hidden_size,
                config.num_attention_heads
            );
        }
        if config.num_attention_heads % config.num_key_value_heads != 0 {
            anyhow::bail!(
                "num_attention_heads {} is not divisible by num_key_value_heads {}",
                config.num_attention_heads,
                config.num_key_value_heads
            );
        }
        Ok(config)
    }
}

/// RMS norm computed in F32
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// `keep_f32` stores the weight in F32 whatever the base dtype (8-bit mode)
    fn new(size: usize, eps: f64, keep_f32: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        let weight = if keep_f32 {
            weight.to_dtype(DType::F32)?
        } else {
            weight
        };
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(x
            .to_dtype(self.weight.dtype())?
            .broadcast_mul(&self.weight)?
            .to_dtype(dtype)?)
    }
}

/// Precomputed rotary tables `(max_pos, head_dim)`
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &DecoderConfig, dtype: DType, device: &Device) -> Result<Self> {
        let dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / config.rope_theta.powf(i as f64 / dim as f64) as f32)
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, config.max_position_embeddings as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((config.max_position_embeddings, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?.to_dtype(dtype)?,
            sin: emb.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `(b, heads, seq, dim)` starting at position `offset`
    fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (_, _, seq_len, dim) = x.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;

        let x1 = x.narrow(D::Minus1, 0, dim / 2)?;
        let x2 = x.narrow(D::Minus1, dim / 2, dim / 2)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        Ok((x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?)
    }
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl Attention {
    fn new(
        config: &DecoderConfig,
        lora: &LoraConfig,
        quantize: bool,
        vb: VarBuilder,
        lora_vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_out = config.num_attention_heads * head_dim;
        let kv_out = config.num_key_value_heads * head_dim;

        let proj = |name: &str, inp: usize, out: usize, bias: bool| {
            LoraLinear::new(
                inp,
                out,
                bias,
                vb.pp(name),
                lora.targets(name).then(|| lora_vb.pp(name)),
                lora,
                quantize,
            )
            .with_context(|| format!("Failed to build {}", name))
        };

        Ok(Self {
            q_proj: proj("q_proj", hidden, q_out, true)?,
            k_proj: proj("k_proj", hidden, kv_out, true)?,
            v_proj: proj("v_proj", hidden, kv_out, true)?,
            o_proj: proj("o_proj", q_out, hidden, false)?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
            hidden_size: hidden,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: Option<&Tensor>,
        offset: usize,
        cache: Option<(&mut KvCache, usize)>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward_t(x, train)?;
        let k = self.k_proj.forward_t(x, train)?;
        let v = self.v_proj.forward_t(x, train)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q, offset)?;
        let k = rotary.apply(&k, offset)?;

        let (k, v) = match cache {
            Some((cache, layer)) => cache.append(layer, k, v)?,
            None => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?.to_dtype(DType::F32)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.hidden_size))?;
        self.o_proj.forward_t(&out, train)
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn new(
        config: &DecoderConfig,
        lora: &LoraConfig,
        quantize: bool,
        vb: VarBuilder,
        lora_vb: VarBuilder,
    ) -> Result<Self> {
        let proj = |name: &str, inp: usize, out: usize| {
            LoraLinear::new(
                inp,
                out,
                false,
                vb.pp(name),
                lora.targets(name).then(|| lora_vb.pp(name)),
                lora,
                quantize,
            )
            .with_context(|| format!("Failed to build {}", name))
        };
        let (h, i) = (config.hidden_size, config.intermediate_size);

        Ok(Self {
            gate_proj: proj("gate_proj", h, i)?,
            up_proj: proj("up_proj", h, i)?,
            down_proj: proj("down_proj", i, h)?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = self.gate_proj.forward_t(x, train)?.silu()?;
        let up = self.up_proj.forward_t(x, train)?;
        self.down_proj.forward_t(&(gate * up)?, train)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: Option<&Tensor>,
        offset: usize,
        cache: Option<(&mut KvCache, usize)>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, rotary, mask, offset, cache, train)?;
        let x = (h + residual)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h, train)?;
        Ok((h + residual)?)
    }

    fn lora_layers(&self) -> impl Iterator<Item = &LoraLinear> {
        [
            &self.self_attn.q_proj,
            &self.self_attn.k_proj,
            &self.self_attn.v_proj,
            &self.self_attn.o_proj,
            &self.mlp.gate_proj,
            &self.mlp.up_proj,
            &self.mlp.down_proj,
        ]
        .into_iter()
    }
}

/// Qwen2 causal LM with LoRA adapters
pub struct Qwen2LoraModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: DecoderConfig,
    device: Device,
    dtype: DType,
    stats: LoraStats,
}

impl Qwen2LoraModel {
    /// Build from frozen weights in `base_vb` and register adapters in `var_map`
    pub fn new(
        config: DecoderConfig,
        lora: &LoraConfig,
        quantize: bool,
        base_vb: VarBuilder,
        var_map: &VarMap,
    ) -> Result<Self> {
        lora.validate()?;
        let device = base_vb.device().clone();
        let dtype = base_vb.dtype();
        let lora_vb = VarBuilder::from_varmap(var_map, DType::F32, &device).pp(PEFT_PREFIX);

        let vb_m = base_vb.pp("model");
        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb_m.pp("embed_tokens"))
                .context("Failed to load embed_tokens")?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let vb_l = vb_m.pp(format!("layers.{}", i));
            let lora_l = lora_vb.pp(format!("model.layers.{}", i));
            layers.push(DecoderLayer {
                self_attn: Attention::new(
                    &config,
                    lora,
                    quantize,
                    vb_l.pp("self_attn"),
                    lora_l.pp("self_attn"),
                )?,
                mlp: Mlp::new(&config, lora, quantize, vb_l.pp("mlp"), lora_l.pp("mlp"))?,
                input_layernorm: RmsNorm::new(
                    config.hidden_size,
                    config.rms_norm_eps,
                    quantize,
                    vb_l.pp("input_layernorm"),
                )?,
                post_attention_layernorm: RmsNorm::new(
                    config.hidden_size,
                    config.rms_norm_eps,
                    quantize,
                    vb_l.pp("post_attention_layernorm"),
                )?,
            });
        }

        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, quantize, vb_m.pp("norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, base_vb.pp("lm_head"))?
        };
        let rotary = RotaryEmbedding::new(&config, dtype, &device)?;

        let mut trainable = 0;
        let mut frozen = embed_tokens.embeddings().elem_count() + norm.weight.elem_count();
        if !config.tie_word_embeddings {
            frozen += lm_head.weight().elem_count();
        }
        let mut lora_layers = 0;
        for layer in &layers {
            frozen += layer.input_layernorm.weight.elem_count()
                + layer.post_attention_layernorm.weight.elem_count();
            for proj in layer.lora_layers() {
                frozen += proj.num_frozen_params();
                trainable += proj.num_trainable_params();
                lora_layers += usize::from(proj.has_adapter());
            }
        }
        let stats = LoraStats::new(frozen + trainable, trainable, lora_layers);

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            device,
            dtype,
            stats,
        })
    }

    /// Load base weights from a model path.
    ///
    /// `bf16` is honoured only on accelerators; CPU runs stay in F32.
    pub fn from_model_path(
        model_path: &ModelPath,
        lora: &LoraConfig,
        quantize: bool,
        bf16: bool,
        var_map: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        model_path.validate()?;
        let config = DecoderConfig::from_file(&model_path.config_file)?;

        let dtype = if bf16 && !device.is_cpu() {
            DType::BF16
        } else {
            DType::F32
        };

        tracing::info!(
            "Loading Qwen2 with LoRA: hidden={}, layers={}, vocab={}, rank={}, dtype={:?}, 8bit={}",
            config.hidden_size,
            config.num_hidden_layers,
            config.vocab_size,
            lora.rank,
            dtype,
            quantize
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&model_path.weights_files, dtype, device)
                .context("Failed to load model weights")?
        };

        let model = Self::new(config, lora, quantize, vb, var_map)?;
        tracing::info!("{}", model.stats);
        Ok(model)
    }

    /// Load from a HuggingFace model ID or local path
    pub fn from_pretrained(
        model_id: &str,
        lora: &LoraConfig,
        quantize: bool,
        bf16: bool,
        var_map: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        let loader = ModelLoader::new()?;
        let model_path = loader.load_model_path(model_id)?;
        Self::from_model_path(&model_path, lora, quantize, bf16, var_map, device)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn stats(&self) -> &LoraStats {
        &self.stats
    }

    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::Qwen2
    }

    fn forward_inner(
        &self,
        input_ids: &Tensor,
        mask: Option<&Tensor>,
        offset: usize,
        mut cache: Option<&mut KvCache>,
        train: bool,
    ) -> Result<Tensor> {
        let mut h = self.embed_tokens.forward(input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_deref_mut().map(|c| (c, i));
            h = layer.forward(&h, &self.rotary, mask, offset, layer_cache, train)?;
        }
        let h = self.norm.forward(&h)?;
        Ok(self.lm_head.forward(&h)?)
    }
}

/// Additive `(b, 1, q, k)` mask: causal, padded keys hidden, diagonal always visible
pub fn build_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (b, seq_len) = attention_mask.dims2()?;
    let keep: Vec<Vec<u32>> = attention_mask.to_dtype(DType::U32)?.to_vec2()?;

    let mut data = Vec::with_capacity(b * seq_len * seq_len);
    for row in &keep {
        for i in 0..seq_len {
            for (j, &k) in row.iter().enumerate() {
                let visible = j == i || (j < i && k != 0);
                data.push(if visible { 0f32 } else { f32::NEG_INFINITY });
            }
        }
    }
    Ok(Tensor::from_vec(data, (b, 1, seq_len, seq_len), attention_mask.device())?)
}

/// Causal mask for `seq_len` new positions following `offset` cached ones
fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total = offset + seq_len;
    let data: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0f32 })
        })
        .collect();
    Ok(Tensor::from_vec(data, (1, 1, seq_len, total), device)?)
}

impl CausalLm for Qwen2LoraModel {
    fn forward_train(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let mask = build_attention_mask(attention_mask)?;
        self.forward_inner(input_ids, Some(&mask), 0, None, train)
    }

    fn forward_step(&self, input_ids: &Tensor, offset: usize, cache: &mut KvCache) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, &self.device)?)
        } else {
            None
        };
        let logits = self.forward_inner(input_ids, mask.as_ref(), offset, Some(cache), false)?;
        Ok(logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?.to_dtype(DType::F32)?)
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl LoraModel for Qwen2LoraModel {
    fn num_trainable_params(&self) -> usize {
        self.stats.trainable_params
    }

    fn num_total_params(&self) -> usize {
        self.stats.total_params
    }

    fn num_lora_layers(&self) -> usize {
        self.stats.num_lora_layers
    }
}

impl std::fmt::Debug for Qwen2LoraModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qwen2LoraModel")
            .field("layers", &self.layers.len())
            .field("dtype", &self.dtype)
            .field("stats", &self.stats.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tiny_config() -> DecoderConfig {
        DecoderConfig {
            vocab_size: 32,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            max_position_embeddings: 64,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-6,
            tie_word_embeddings: true,
            model_type: Some("qwen2".to_string()),
            architectures: vec![],
        }
    }

    /// Deterministic frozen weights for every tensor the decoder asks for
    fn base_weights(config: &DecoderConfig) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let mut ws = HashMap::new();
        let mut seed = 0f32;
        let mut fill = |shape: &[usize]| {
            seed += 1.0;
            let n: usize = shape.iter().product();
            let t = Tensor::arange(0f32, n as f32, &dev)
                .unwrap()
                .affine(0.37, seed as f64)
                .unwrap()
                .sin()
                .unwrap()
                .affine(0.05, 0.0)
                .unwrap();
            t.reshape(shape).unwrap()
        };

        let (h, i, v) = (config.hidden_size, config.intermediate_size, config.vocab_size);
        let kv = config.num_key_value_heads * config.head_dim();
        ws.insert("model.embed_tokens.weight".to_string(), fill(&[v, h]));
        ws.insert("model.norm.weight".to_string(), Tensor::ones(h, DType::F32, &dev).unwrap());
        for l in 0..config.num_hidden_layers {
            let p = format!("model.layers.{}", l);
            for (name, shape) in [
                ("self_attn.q_proj.weight", vec![h, h]),
                ("self_attn.q_proj.bias", vec![h]),
                ("self_attn.k_proj.weight", vec![kv, h]),
                ("self_attn.k_proj.bias", vec![kv]),
                ("self_attn.v_proj.weight", vec![kv, h]),
                ("self_attn.v_proj.bias", vec![kv]),
                ("self_attn.o_proj.weight", vec![h, h]),
                ("mlp.gate_proj.weight", vec![i, h]),
                ("mlp.up_proj.weight", vec![i, h]),
                ("mlp.down_proj.weight", vec![h, i]),
            ] {
                ws.insert(format!("{}.{}", p, name), fill(&shape));
            }
            for norm in ["input_layernorm.weight", "post_attention_layernorm.weight"] {
                ws.insert(format!("{}.{}", p, norm), Tensor::ones(h, DType::F32, &dev).unwrap());
            }
        }
        ws
    }

    fn tiny_model(var_map: &VarMap, lora: &LoraConfig) -> Qwen2LoraModel {
        let config = tiny_config();
        let vb = VarBuilder::from_tensors(base_weights(&config), DType::F32, &Device::Cpu);
        Qwen2LoraModel::new(config, lora, false, vb, var_map).unwrap()
    }

    #[test]
    fn test_adapter_names_follow_peft() {
        let var_map = VarMap::new();
        let model = tiny_model(&var_map, &LoraConfig::new(4, 8.0));

        let names: Vec<String> = var_map.data().lock().unwrap().keys().cloned().collect();
        assert_eq!(names.len(), 2 * 7 * 2);
        assert!(names.contains(&"base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string()));
        assert!(names.contains(&"base_model.model.model.layers.1.mlp.down_proj.lora_B.weight".to_string()));

        assert_eq!(model.num_lora_layers(), 14);
        let expected: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(model.num_trainable_params(), expected);
        assert!(model.num_total_params() > expected);
    }

    #[test]
    fn test_partial_targets() {
        let var_map = VarMap::new();
        let lora = LoraConfig::new(4, 8.0).with_target_modules(vec!["q_proj".into(), "v_proj".into()]);
        let model = tiny_model(&var_map, &lora);
        assert_eq!(model.num_lora_layers(), 4);
        assert_eq!(var_map.all_vars().len(), 8);
    }

    #[test]
    fn test_forward_shapes_and_cache_agree() {
        let var_map = VarMap::new();
        let model = tiny_model(&var_map, &LoraConfig::new(4, 8.0).with_dropout(0.0));

        let ids = Tensor::new(&[[3u32, 7, 1, 9, 4]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 5), DType::U32, &Device::Cpu).unwrap();
        let logits = model.forward_train(&ids, &mask, false).unwrap();
        assert_eq!(logits.dims(), &[1, 5, 32]);
        let last_full: Vec<f32> = logits.get(0).unwrap().get(4).unwrap().to_vec1().unwrap();

        // Prefill four tokens then decode the fifth through the cache
        let mut cache = KvCache::new(model.num_layers());
        let prefix = ids.narrow(1, 0, 4).unwrap();
        model.forward_step(&prefix, 0, &mut cache).unwrap();
        let step = model
            .forward_step(&ids.narrow(1, 4, 1).unwrap(), 4, &mut cache)
            .unwrap();
        let last_cached: Vec<f32> = step.get(0).unwrap().to_vec1().unwrap();

        for (a, b) in last_full.iter().zip(&last_cached) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_gradients_reach_every_adapter() {
        let var_map = VarMap::new();
        let model = tiny_model(&var_map, &LoraConfig::new(4, 8.0).with_dropout(0.0));

        // Make B non-zero so that A receives gradient as well
        for var in var_map.all_vars() {
            let t = (Tensor::ones(var.shape(), DType::F32, &Device::Cpu).unwrap() * 0.01).unwrap();
            var.set(&t).unwrap();
        }

        let ids = Tensor::new(&[[3u32, 7, 1, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 0]], &Device::Cpu).unwrap();
        let logits = model.forward_train(&ids, &mask, true).unwrap();
        let loss = crate::training::loss::causal_lm_loss(&logits, &ids).unwrap();
        let grads = loss.backward().unwrap();

        for var in var_map.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_quantized_model_keeps_norms_in_f32() {
        let config = tiny_config();
        let vb = VarBuilder::from_tensors(base_weights(&config), DType::BF16, &Device::Cpu);
        let var_map = VarMap::new();
        let model = Qwen2LoraModel::new(config.clone(), &LoraConfig::new(4, 8.0), true, vb, &var_map).unwrap();

        assert_eq!(model.norm.weight.dtype(), DType::F32);
        for layer in &model.layers {
            assert_eq!(layer.input_layernorm.weight.dtype(), DType::F32);
            assert_eq!(layer.post_attention_layernorm.weight.dtype(), DType::F32);
            assert!(layer.lora_layers().all(|proj| proj.is_quantized()));
        }

        let vb = VarBuilder::from_tensors(base_weights(&config), DType::BF16, &Device::Cpu);
        let dense = Qwen2LoraModel::new(config, &LoraConfig::new(4, 8.0), false, vb, &VarMap::new()).unwrap();
        assert_eq!(dense.norm.weight.dtype(), DType::BF16);
    }

    #[test]
    fn test_attention_mask_hides_padding() {
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();
        let additive = build_attention_mask(&mask).unwrap();
        assert_eq!(additive.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = additive.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();

        assert_eq!(rows[0], vec![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0, 0.0, f32::NEG_INFINITY]);
        // Padded query still sees itself
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }
}
