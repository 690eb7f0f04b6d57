//! Evaluation of fine-tuned checkpoints
//!
//! Generates solutions for held-out problems, scores them by exact match and
//! ranks the checkpoints of a run. Also summarises training logs.

pub mod checkpoints;
pub mod evaluator;
pub mod metrics;
pub mod stats;

// Re-exports
pub use checkpoints::{
    find_checkpoints, scan_checkpoints, select_best, CheckpointEvaluator, CheckpointScore,
    DEFAULT_SCAN_SAMPLES,
};
pub use evaluator::{EvaluationOutput, EvaluationResult, Evaluator};
pub use metrics::{exact_match, pass_at_k, EvaluationMetrics};
pub use stats::{training_stats, TrainingStats};
