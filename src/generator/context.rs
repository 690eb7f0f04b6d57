//! Loaded generators for the fine-tuned variants
//!
//! Built once at start-up and passed to whatever serves requests.

use anyhow::Result;
use std::path::PathBuf;

use super::{extract_solution, CandleGenerator, Generator, GeneratorConfig, SamplingParams};
use crate::training::dataset::{generation_prompt, DatasetVariant, PromptConfig};

/// Generators keyed by dataset variant, in insertion order
pub struct GenerationContext {
    generators: Vec<(DatasetVariant, Box<dyn Generator>)>,
    system_prompt: String,
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationContext {
    pub fn new() -> Self {
        Self {
            generators: Vec::new(),
            system_prompt: PromptConfig::default().system_prompt_solution,
        }
    }

    /// Load one adapter per variant on top of the same base model
    pub fn load(base: &GeneratorConfig, adapters: &[(DatasetVariant, PathBuf)]) -> Result<Self> {
        let mut context = Self::new();
        for (variant, path) in adapters {
            tracing::info!("Loading {} model from {:?}", variant, path);
            let generator = CandleGenerator::new(base.clone().with_adapter(path.clone()))?;
            context.insert(*variant, Box::new(generator));
        }
        Ok(context)
    }

    /// Add or replace the generator for a variant
    pub fn insert(&mut self, variant: DatasetVariant, generator: Box<dyn Generator>) {
        match self.generators.iter_mut().find(|(v, _)| *v == variant) {
            Some(slot) => slot.1 = generator,
            None => self.generators.push((variant, generator)),
        }
    }

    pub fn variants(&self) -> Vec<DatasetVariant> {
        self.generators.iter().map(|(v, _)| *v).collect()
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Generate a solution for `problem` with one variant's model
    pub fn generate(
        &self,
        variant: DatasetVariant,
        problem: &str,
        params: &SamplingParams,
    ) -> Result<String> {
        let generator = self
            .generators
            .iter()
            .find(|(v, _)| *v == variant)
            .map(|(_, g)| g)
            .ok_or_else(|| anyhow::anyhow!("No {} model loaded", variant))?;

        let prompt = generation_prompt(&self.system_prompt, problem);
        let completion = generator.generate(&prompt, params)?;
        Ok(extract_solution(&format!("{}{}", prompt, completion)))
    }

    /// Solutions from every loaded model, side by side
    pub fn compare(
        &self,
        problem: &str,
        params: &SamplingParams,
    ) -> Result<Vec<(DatasetVariant, String)>> {
        self.variants()
            .into_iter()
            .map(|variant| Ok((variant, self.generate(variant, problem, params)?)))
            .collect()
    }
}
