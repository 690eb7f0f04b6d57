//! Decoder model implementations for training
//!
//! LoRA-enabled causal language models for fine-tuning.

mod qwen2_lora;

pub use qwen2_lora::{build_attention_mask, DecoderConfig, Qwen2LoraModel};
