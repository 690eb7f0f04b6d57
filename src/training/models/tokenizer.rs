//! Tokenizer wrapper for HuggingFace tokenizers
//!
//! Provides fixed-length encoding for causal-LM training and plain
//! encode/decode for generation.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::training::hub::{ModelLoader, ModelPath};

/// Pad token used by Qwen2 tokenizers
const QWEN_PAD_TOKEN: &str = "<|endoftext|>";
/// Tokens that end a generation
const EOS_TOKENS: &[&str] = &["<|im_end|>", "<|endoftext|>", "</s>"];

/// Minimal tokenizer interface used by the dataset loader and evaluator
pub trait TextTokenizer {
    /// Encode text to token ids (special tokens added as the tokenizer defines them)
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text, skipping special tokens
    fn decode_ids(&self, ids: &[u32]) -> Result<String>;

    /// Token id used for right padding
    fn pad_token_id(&self) -> u32;

    /// Encode with truncation and right padding to exactly `max_length` tokens
    fn encode_fixed(&self, text: &str, max_length: usize) -> Result<EncodedInput> {
        let mut input_ids = self.encode_ids(text)?;
        input_ids.truncate(max_length);

        let real = input_ids.len();
        let mut attention_mask = vec![1u32; real];

        input_ids.resize(max_length, self.pad_token_id());
        attention_mask.resize(max_length, 0);

        Ok(EncodedInput {
            input_ids,
            attention_mask,
        })
    }
}

/// Wrapper around HuggingFace tokenizer
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl TokenizerWrapper {
    /// Load tokenizer from a file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        Ok(Self {
            tokenizer,
            max_length: 1024,
        })
    }

    /// Load tokenizer from a ModelPath
    pub fn from_model_path(model_path: &ModelPath) -> Result<Self> {
        let tokenizer_path = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Tokenizer file not found in model path"))?;

        Self::from_file(tokenizer_path)
    }

    /// Load tokenizer from HuggingFace Hub or local path
    pub fn from_pretrained(model_id_or_path: &str) -> Result<Self> {
        let loader = ModelLoader::new()?;
        let model_path = loader.load_model_path(model_id_or_path)?;
        Self::from_model_path(&model_path)
    }

    /// Set maximum sequence length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Get the maximum sequence length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Encode a single text without padding
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<EncodedInput> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        Ok(EncodedInput {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Look up a token id
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// All ids that terminate generation
    pub fn eos_token_ids(&self) -> Vec<u32> {
        EOS_TOKENS
            .iter()
            .filter_map(|t| self.tokenizer.token_to_id(t))
            .collect()
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Write `tokenizer.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join("tokenizer.json");
        self.tokenizer
            .save(&path, false)
            .map_err(|e| anyhow::anyhow!("Failed to save tokenizer: {}", e))
            .with_context(|| format!("Writing {:?}", path))
    }
}

impl TextTokenizer for TokenizerWrapper {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.encode(text, true)?.input_ids)
    }

    fn decode_ids(&self, ids: &[u32]) -> Result<String> {
        self.decode(ids, true)
    }

    fn pad_token_id(&self) -> u32 {
        if let Some(padding) = self.tokenizer.get_padding() {
            return padding.pad_id;
        }
        self.tokenizer
            .token_to_id(QWEN_PAD_TOKEN)
            .or_else(|| self.eos_token_ids().first().copied())
            .unwrap_or(0)
    }
}

/// Encoded input for a single text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInput {
    /// Token IDs
    pub input_ids: Vec<u32>,
    /// Attention mask (1 for real tokens, 0 for padding)
    pub attention_mask: Vec<u32>,
}

impl EncodedInput {
    /// Get sequence length
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Convert to a `[1, seq_len]` id tensor
    pub fn ids_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(&self.input_ids[..], device)?
            .to_dtype(DType::U32)?
            .unsqueeze(0)?)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ByteTokenizer;
    use super::*;

    #[test]
    fn test_encode_fixed_pads_right() {
        let encoded = ByteTokenizer.encode_fixed("abc", 6).unwrap();
        assert_eq!(encoded.input_ids, vec![98, 99, 100, 0, 0, 0]);
        assert_eq!(encoded.attention_mask, vec![1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_encode_fixed_truncates() {
        let encoded = ByteTokenizer.encode_fixed("abcdef", 4).unwrap();
        assert_eq!(encoded.len(), 4);
        assert_eq!(encoded.attention_mask, vec![1, 1, 1, 1]);
        assert_eq!(ByteTokenizer.decode_ids(&encoded.input_ids).unwrap(), "abcd");
    }

    #[test]
    #[ignore]
    fn test_tokenizer_load() {
        let tokenizer = TokenizerWrapper::from_pretrained("Qwen/Qwen2.5-Coder-1.5B-Instruct");
        assert!(
            tokenizer.is_ok(),
            "Failed to load tokenizer: {:?}",
            tokenizer.err()
        );
        let tokenizer = tokenizer.unwrap();
        assert!(!tokenizer.eos_token_ids().is_empty());
    }
}
