//! LoRA fine-tuning of causal code models
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device selection and the CPU confirmation gate
//! - `hub` - HuggingFace Hub integration
//! - `dataset` - Dataset loading, prompt templating and tokenization
//! - `collator` - Batching of tokenized examples
//! - `models` - Qwen2 decoder with LoRA adapters, tokenizer wrapper
//! - `lora` - LoRA adapter implementation
//! - `loss` - Causal-LM loss
//! - `optimizer` - AdamW, gradient accumulation, LR schedules
//! - `callbacks` - Structured logging and early stopping
//! - `checkpoint` - Checkpoint writing, rotation and reloading
//! - `trainer` - Training loop
//! - `pipeline` - End-to-end run for one dataset variant

pub mod callbacks;
pub mod checkpoint;
pub mod collator;
pub mod dataset;
pub mod device;
pub mod hub;
pub mod lora;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod pipeline;
pub mod trainer;

// Re-exports
pub use callbacks::{
    CallbackAction, EarlyStoppingCallback, EventDispatcher, EventKind, LoggingCallback,
    TrainingListener,
};
pub use checkpoint::{CheckpointManager, TrainerState};
pub use collator::{collate, Batch};
pub use dataset::{DatasetLoader, DatasetVariant, Example, PromptConfig, TargetField, TokenizedExample};
pub use device::{select_device, DevicePreference};
pub use hub::{HubApi, ModelLoader};
pub use lora::{AdapterConfig, LoraConfig};
pub use models::{CausalLm, Qwen2LoraModel, TextTokenizer, TokenizerWrapper};
pub use pipeline::{FineTuneConfig, ModelConfig};
pub use trainer::{Trainer, TrainingConfig, TrainingResult};
