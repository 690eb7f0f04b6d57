//! Causal language models, tokenizers and their shared traits

pub mod common;
pub mod decoders;
pub mod tokenizer;

pub use common::{detect_architecture, CausalLm, KvCache, LoraModel, ModelArchitecture};
pub use decoders::{DecoderConfig, Qwen2LoraModel};
pub use tokenizer::{EncodedInput, TextTokenizer, TokenizerWrapper};
