//! Generation metrics for code evaluation
//!
//! - Exact Match (EM): trimmed prediction equals trimmed reference
//! - pass@k over boolean test outcomes

use serde::{Deserialize, Serialize};

/// Aggregate metrics over one evaluation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Fraction of exact matches (0.0 for an empty collection)
    pub exact_match: f64,
    pub total_samples: usize,
}

impl EvaluationMetrics {
    /// Compute metrics over aligned predictions and references
    pub fn compute(predictions: &[String], references: &[String]) -> Self {
        let matches: Vec<bool> = predictions
            .iter()
            .zip(references)
            .map(|(p, r)| exact_match(p, r))
            .collect();

        Self {
            exact_match: mean(&matches),
            total_samples: predictions.len(),
        }
    }
}

impl std::fmt::Display for EvaluationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Test Samples: {}", self.total_samples)?;
        writeln!(f, "Metrics:")?;
        writeln!(f, "  exact_match: {:.4}", self.exact_match)?;
        Ok(())
    }
}

/// Trimmed string equality
pub fn exact_match(prediction: &str, reference: &str) -> bool {
    prediction.trim() == reference.trim()
}

/// Fraction of passing results.
///
/// With one sample per problem this is the plain pass rate for every `k`.
pub fn pass_at_k(results: &[bool], _k: usize) -> f64 {
    mean(results)
}

fn mean(flags: &[bool]) -> f64 {
    if flags.is_empty() {
        return 0.0;
    }
    flags.iter().filter(|&&b| b).count() as f64 / flags.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match_trims() {
        assert!(exact_match("  x = 1\n", "x = 1"));
        assert!(!exact_match("x = 1", "x = 2"));
    }

    #[test]
    fn test_compute_metrics() {
        let metrics = EvaluationMetrics::compute(
            &strings(&["a", " b ", "c", ""]),
            &strings(&["a", "b", "d", "e"]),
        );
        assert_eq!(metrics.total_samples, 4);
        assert!((metrics.exact_match - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_collection() {
        let metrics = EvaluationMetrics::compute(&[], &[]);
        assert_eq!(metrics.exact_match, 0.0);
        assert_eq!(metrics.total_samples, 0);
        assert_eq!(pass_at_k(&[], 1), 0.0);
    }

    #[test]
    fn test_pass_at_k() {
        assert!((pass_at_k(&[true, false, true, true], 1) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_result_json_shape() {
        let value = serde_json::to_value(EvaluationMetrics {
            exact_match: 0.25,
            total_samples: 4,
        })
        .unwrap();
        assert!(value["total_samples"].is_u64());
        assert!(value["exact_match"].is_f64());
    }
}
