//! # codetune
//!
//! LoRA fine-tuning and evaluation of a code-generation model on
//! competitive-programming problems.
//!
//! ## Architecture
//!
//! - `training` - Dataset loading, LoRA-wrapped Qwen2 decoder and the training loop
//! - `evaluation` - Exact-match evaluation and best-checkpoint selection
//! - `generator` - Sampling front-end over base model plus adapter
//! - `cli` - Command-line interface

pub mod cli;
pub mod evaluation;
pub mod generator;
pub mod training;

// Re-export commonly used types
pub use anyhow::{Error, Result};
