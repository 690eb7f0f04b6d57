//! Generator module for text generation
//!
//! Provides a trait-based abstraction over decoder LLMs with a Candle
//! implementation that runs the LoRA-adapted Qwen2 model.

pub mod candle;
pub mod config;
pub mod context;

pub use candle::CandleGenerator;
pub use config::{GeneratorConfig, SamplingParams};
pub use context::GenerationContext;

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_transformers::generation::LogitsProcessor;

use crate::training::dataset::SOLUTION_MARKER;
use crate::training::models::{CausalLm, KvCache, TextTokenizer};

/// Trait for text generation models
pub trait Generator {
    /// Generate a completion for `prompt`; the prompt itself is not included
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String>;

    /// Get the model name/identifier
    fn model_name(&self) -> &str;
}

/// Text after the last `Solution:\n` marker, trimmed.
///
/// Text without the marker is returned trimmed as a whole.
pub fn extract_solution(text: &str) -> String {
    text.rsplit(SOLUTION_MARKER)
        .next()
        .unwrap_or(text)
        .trim()
        .to_string()
}

/// Autoregressive decoding loop shared by all generators.
///
/// Stops after `max_new_tokens` or at the first token in `eos_token_ids`.
pub fn generate_with(
    model: &dyn CausalLm,
    tokenizer: &dyn TextTokenizer,
    eos_token_ids: &[u32],
    prompt: &str,
    params: &SamplingParams,
) -> Result<String> {
    let prompt_tokens = tokenizer.encode_ids(prompt)?;
    if prompt_tokens.is_empty() {
        anyhow::bail!("Empty prompt after tokenization");
    }

    let (temperature, top_p) = params.sampler_settings();
    let mut logits_processor = LogitsProcessor::new(params.seed, temperature, top_p);
    let mut cache = KvCache::new(model.num_layers());

    let mut all_tokens = prompt_tokens.clone();
    let mut offset = 0;
    for _ in 0..params.max_new_tokens {
        let input = Tensor::new(&all_tokens[offset..], model.device())?.unsqueeze(0)?;
        let logits = model
            .forward_step(&input, offset, &mut cache)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;

        let next_token = logits_processor.sample(&logits)?;
        offset = all_tokens.len();
        all_tokens.push(next_token);

        if eos_token_ids.contains(&next_token) {
            tracing::debug!("Generation stopped: EOS token");
            break;
        }
    }

    tokenizer.decode_ids(&all_tokens[prompt_tokens.len()..])
}
