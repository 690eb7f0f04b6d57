//! Batch assembly for fixed-length tokenized examples

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};

use super::dataset::TokenizedExample;

/// Names of the three batch fields
pub const BATCH_FIELDS: [&str; 3] = ["input_ids", "labels", "attention_mask"];

/// A rectangular `(N, L)` batch of `u32` tensors
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub labels: Tensor,
    pub attention_mask: Tensor,
}

impl Batch {
    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        match name {
            "input_ids" => Some(&self.input_ids),
            "labels" => Some(&self.labels),
            "attention_mask" => Some(&self.attention_mask),
            _ => None,
        }
    }

    /// All fields as (name, tensor) pairs
    pub fn fields(&self) -> [(&'static str, &Tensor); 3] {
        [
            (BATCH_FIELDS[0], &self.input_ids),
            (BATCH_FIELDS[1], &self.labels),
            (BATCH_FIELDS[2], &self.attention_mask),
        ]
    }

    /// Number of rows
    pub fn size(&self) -> Result<usize> {
        Ok(self.input_ids.dim(0)?)
    }
}

/// Stack equal-length examples into one batch on `device`
pub fn collate(examples: &[TokenizedExample], device: &Device) -> Result<Batch> {
    let first = examples
        .first()
        .ok_or_else(|| anyhow!("Cannot collate an empty list of examples"))?;
    let seq_len = first.len();

    for (i, ex) in examples.iter().enumerate() {
        if ex.input_ids.len() != seq_len
            || ex.labels.len() != seq_len
            || ex.attention_mask.len() != seq_len
        {
            anyhow::bail!(
                "Example {} has inconsistent lengths (input_ids={}, labels={}, attention_mask={}); expected {}",
                i,
                ex.input_ids.len(),
                ex.labels.len(),
                ex.attention_mask.len(),
                seq_len
            );
        }
    }

    let n = examples.len();
    let stack = |field: fn(&TokenizedExample) -> &[u32]| -> Result<Tensor> {
        let flat: Vec<u32> = examples.iter().flat_map(|ex| field(ex).iter().copied()).collect();
        Ok(Tensor::from_vec(flat, (n, seq_len), device)?)
    };

    Ok(Batch {
        input_ids: stack(|ex| ex.input_ids.as_slice())?,
        labels: stack(|ex| ex.labels.as_slice())?,
        attention_mask: stack(|ex| ex.attention_mask.as_slice())?,
    })
}
