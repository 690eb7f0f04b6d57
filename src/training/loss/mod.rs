//! Loss functions for causal language modelling
//!
//! Next-token cross-entropy over every position of the sequence.

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Shifted causal-LM cross-entropy
///
/// # Arguments
/// * `logits` - Model output [batch_size, seq_len, vocab_size]
/// * `labels` - Target ids [batch_size, seq_len]
///
/// # Returns
/// * Mean loss over all `batch_size * (seq_len - 1)` predictions
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let (label_batch, label_len) = labels.dims2()?;

    if label_batch != batch_size || label_len != seq_len {
        anyhow::bail!(
            "Logits {:?} and labels {:?} do not line up",
            logits.dims(),
            labels.dims()
        );
    }
    if seq_len < 2 {
        anyhow::bail!("Causal LM loss needs sequences of at least 2 tokens, got {}", seq_len);
    }

    // Position t predicts token t + 1
    let shift_logits = logits
        .narrow(1, 0, seq_len - 1)?
        .contiguous()?
        .reshape((batch_size * (seq_len - 1), vocab_size))?
        .to_dtype(DType::F32)?;
    let shift_labels = labels
        .narrow(1, 1, seq_len - 1)?
        .contiguous()?
        .reshape(batch_size * (seq_len - 1))?
        .to_dtype(DType::U32)?;

    Ok(candle_nn::loss::cross_entropy(&shift_logits, &shift_labels)?)
}

/// Perplexity from a mean cross-entropy
pub fn perplexity(loss: f64) -> f64 {
    loss.exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let loss = causal_lm_loss(&logits, &labels).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - (8f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_labels_are_shifted() {
        // Position t puts all its mass on token t + 1
        let vocab = 4;
        let mut data = vec![-20f32; 3 * vocab];
        for t in 0..3 {
            data[t * vocab + (t + 1)] = 20.0;
        }
        let logits = Tensor::from_vec(data, (1, 3, vocab), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();

        let loss = causal_lm_loss(&logits, &labels).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss < 1e-4, "loss {}", loss);
    }

    #[test]
    fn test_rejects_short_or_mismatched() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((1, 1), DType::U32, &Device::Cpu).unwrap();
        assert!(causal_lm_loss(&logits, &labels).is_err());

        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        assert!(causal_lm_loss(&logits, &labels).is_err());
    }

    #[test]
    fn test_perplexity() {
        assert!((perplexity(0.0) - 1.0).abs() < 1e-12);
    }
}
