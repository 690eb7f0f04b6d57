//! Generation-based evaluation on held-out problems

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::metrics::EvaluationMetrics;
use crate::generator::{extract_solution, Generator, SamplingParams};
use crate::training::dataset::{generation_prompt, DatasetVariant, Example, PromptConfig};

/// Directory under a checkpoint that holds evaluation results
pub const RESULTS_DIR: &str = "evaluation_results";

/// Predictions next to their references, plus the aggregate metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationOutput {
    pub metrics: EvaluationMetrics,
    pub predictions: Vec<String>,
    pub references: Vec<String>,
}

/// Contents of `evaluation_results/eval_<dataset>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub checkpoint: String,
    pub dataset: String,
    pub metrics: EvaluationMetrics,
}

impl EvaluationResult {
    pub fn new(checkpoint: &Path, dataset: DatasetVariant, metrics: EvaluationMetrics) -> Self {
        Self {
            checkpoint: checkpoint.to_string_lossy().to_string(),
            dataset: dataset.to_string(),
            metrics,
        }
    }

    /// Result file for a checkpoint and dataset
    pub fn path(checkpoint: &Path, dataset: DatasetVariant) -> PathBuf {
        checkpoint
            .join(RESULTS_DIR)
            .join(format!("eval_{}.json", dataset))
    }

    /// Write under the checkpoint directory and return the file path
    pub fn save(&self, checkpoint: &Path, dataset: DatasetVariant) -> Result<PathBuf> {
        let path = Self::path(checkpoint, dataset);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Generates a solution per problem and scores it against the reference
pub struct Evaluator<'g> {
    generator: &'g dyn Generator,
    params: SamplingParams,
    system_prompt: String,
}

impl<'g> Evaluator<'g> {
    pub fn new(generator: &'g dyn Generator) -> Self {
        Self {
            generator,
            params: SamplingParams::default(),
            system_prompt: PromptConfig::default().system_prompt_solution,
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// Generate and extract the solution for one problem
    pub fn generate_solution(&self, problem: &str) -> Result<String> {
        let prompt = generation_prompt(&self.system_prompt, problem);
        let completion = self.generator.generate(&prompt, &self.params)?;
        Ok(extract_solution(&format!("{}{}", prompt, completion)))
    }

    /// Evaluate the first `num_samples` examples (all when `None`).
    ///
    /// A failed generation is logged and scored as an empty prediction.
    pub fn evaluate_dataset(&self, examples: &[Example], num_samples: Option<usize>) -> EvaluationOutput {
        let count = num_samples
            .map(|n| n.min(examples.len()))
            .unwrap_or(examples.len());
        let examples = &examples[..count];

        tracing::info!(
            "Evaluating {} samples with {}",
            examples.len(),
            self.generator.model_name()
        );

        let mut predictions = Vec::with_capacity(examples.len());
        let mut references = Vec::with_capacity(examples.len());

        for (i, example) in examples.iter().enumerate() {
            let prediction = match self.generate_solution(&example.input) {
                Ok(solution) => solution,
                Err(e) => {
                    tracing::warn!("Error generating solution for sample {}: {:#}", i, e);
                    String::new()
                }
            };
            predictions.push(prediction);
            references.push(example.solution.clone());

            if (i + 1) % 10 == 0 {
                tracing::debug!("Evaluated {}/{}", i + 1, examples.len());
            }
        }

        let metrics = EvaluationMetrics::compute(&predictions, &references);
        EvaluationOutput {
            metrics,
            predictions,
            references,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    /// Answers with the problem text and fails on call number `fail_on`
    struct Scripted {
        calls: Cell<usize>,
        fail_on: Option<usize>,
    }

    impl Generator for Scripted {
        fn generate(&self, prompt: &str, _params: &SamplingParams) -> Result<String> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if Some(call) == self.fail_on {
                anyhow::bail!("out of memory");
            }
            // Echo the problem line back as the solution
            let problem = prompt
                .split("Problem:\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\n").next())
                .unwrap_or("");
            Ok(format!("{}\n", problem))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn example(input: &str, solution: &str) -> Example {
        Example {
            input: input.to_string(),
            solution: solution.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_failed_sample_becomes_empty_prediction() {
        let generator = Scripted {
            calls: Cell::new(0),
            fail_on: Some(1),
        };
        let examples = vec![example("a", "a"), example("b", "b"), example("c", "x")];

        let output = Evaluator::new(&generator).evaluate_dataset(&examples, None);

        assert_eq!(output.predictions, vec!["a", "", "c"]);
        assert_eq!(output.references, vec!["a", "b", "x"]);
        assert_eq!(output.metrics.total_samples, 3);
        assert!((output.metrics.exact_match - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_num_samples_caps_evaluation() {
        let generator = Scripted {
            calls: Cell::new(0),
            fail_on: None,
        };
        let examples = vec![example("a", "a"), example("b", "b"), example("c", "c")];

        let output = Evaluator::new(&generator).evaluate_dataset(&examples, Some(2));
        assert_eq!(output.metrics.total_samples, 2);
        assert_eq!(generator.calls.get(), 2);

        let output = Evaluator::new(&generator).evaluate_dataset(&examples, Some(10));
        assert_eq!(output.metrics.total_samples, 3);
    }

    #[test]
    fn test_result_file_round_trip() {
        let dir = tempdir().unwrap();
        let checkpoint = dir.path().join("checkpoint-100");
        let result = EvaluationResult::new(
            &checkpoint,
            DatasetVariant::Deep,
            EvaluationMetrics {
                exact_match: 0.5,
                total_samples: 2,
            },
        );

        let path = result.save(&checkpoint, DatasetVariant::Deep).unwrap();
        assert!(path.ends_with("evaluation_results/eval_deep.json"));
        assert_eq!(EvaluationResult::load(&path).unwrap(), result);
    }
}
