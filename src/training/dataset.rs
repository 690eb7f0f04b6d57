//! Dataset loading and preprocessing for causal-LM fine-tuning
//!
//! Loads the CodeGen problem/solution datasets from the Hub (or a local
//! directory), renders every example through the prompt template and
//! tokenizes it to a fixed length.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::hub::{is_dataset_file, HubApi};
use super::models::TextTokenizer;

/// Hub id of the DEEP dataset
pub const DEEP_DATASET: &str = "Naholav/CodeGen-Deep-5K";
/// Hub id of the DIVERSE dataset
pub const DIVERSE_DATASET: &str = "Naholav/CodeGen-Diverse-5K";

/// Fraction of examples held out when the source has no test split
pub const TEST_FRACTION: f64 = 0.1;
/// Seed for the held-out split and epoch shuffling
pub const DEFAULT_SEED: u64 = 42;

/// The two dataset variants the pipeline knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetVariant {
    Deep,
    Diverse,
}

impl DatasetVariant {
    /// Hub dataset identifier
    pub fn hub_id(&self) -> &'static str {
        match self {
            Self::Deep => DEEP_DATASET,
            Self::Diverse => DIVERSE_DATASET,
        }
    }

    /// Default checkpoint directory for training runs
    pub fn default_output_dir(&self) -> PathBuf {
        PathBuf::from("./checkpoints").join(self.to_string())
    }

    /// Run name used in log lines
    pub fn run_name(&self) -> String {
        format!("{}_training", self)
    }
}

impl std::str::FromStr for DatasetVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "deep" => Ok(Self::Deep),
            "diverse" => Ok(Self::Diverse),
            _ => Err(anyhow::anyhow!(
                "Invalid dataset: {}. Valid options: deep, diverse",
                s
            )),
        }
    }
}

impl std::fmt::Display for DatasetVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deep => write!(f, "deep"),
            Self::Diverse => write!(f, "diverse"),
        }
    }
}

/// Which field of an example is used as the training target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetField {
    /// `output`: reasoning trace plus code
    Reasoning,
    /// `solution`: clean code only
    #[default]
    Solution,
}

/// One (problem, reference solution) pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Problem statement
    #[serde(default)]
    pub input: String,
    /// Reasoning trace and code
    #[serde(default)]
    pub output: String,
    /// Clean code solution
    #[serde(default)]
    pub solution: String,
    /// Difficulty label (stored as text whatever the source type)
    #[serde(default, deserialize_with = "string_or_number")]
    pub difficulty: Option<String>,
}

impl Example {
    /// The text used as the training target
    pub fn target(&self, field: TargetField) -> &str {
        match field {
            TargetField::Reasoning => &self.output,
            TargetField::Solution => &self.solution,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// System prompts and sequence lengths for the two target modes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub system_prompt_solution: String,
    pub system_prompt_reasoning: String,
    pub max_length_solution: usize,
    pub max_length_reasoning: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt_solution: "You are an expert Python programmer. Please read the problem carefully before writing any Python code.".to_string(),
            system_prompt_reasoning: "You are an expert programmer. Use <think> tags for reasoning before writing code.".to_string(),
            max_length_solution: 1024,
            max_length_reasoning: 8192,
        }
    }
}

impl PromptConfig {
    pub fn system_prompt(&self, field: TargetField) -> &str {
        match field {
            TargetField::Reasoning => &self.system_prompt_reasoning,
            TargetField::Solution => &self.system_prompt_solution,
        }
    }

    pub fn max_length(&self, field: TargetField) -> usize {
        match field {
            TargetField::Reasoning => self.max_length_reasoning,
            TargetField::Solution => self.max_length_solution,
        }
    }
}

/// Marker that separates the problem from the solution in every prompt
pub const SOLUTION_MARKER: &str = "Solution:\n";

/// Render a full training prompt
pub fn build_prompt(system_prompt: &str, problem: &str, code: &str) -> String {
    format!(
        "{}{}",
        generation_prompt(system_prompt, problem),
        code
    )
}

/// Render a prompt that ends right before the solution
pub fn generation_prompt(system_prompt: &str, problem: &str) -> String {
    format!("{}\n\nProblem:\n{}\n\n{}", system_prompt, problem, SOLUTION_MARKER)
}

/// A prompt tokenized to a fixed length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    /// Copy of `input_ids`; the loss covers the whole sequence
    pub labels: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Where raw examples come from
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// Hub dataset repository id
    Hub(String),
    /// Local data file or directory of data files
    Local(PathBuf),
}

/// Raw train/test examples
#[derive(Debug, Clone, Default)]
pub struct RawSplits {
    pub train: Vec<Example>,
    pub test: Vec<Example>,
}

/// Tokenized splits plus the raw held-out examples
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub train: Vec<TokenizedExample>,
    pub test: Vec<TokenizedExample>,
    pub raw_test: Vec<Example>,
}

/// Dataset loader for one variant and target mode
pub struct DatasetLoader<'t, T: TextTokenizer> {
    tokenizer: &'t T,
    variant: DatasetVariant,
    target: TargetField,
    prompts: PromptConfig,
    source: DatasetSource,
    seed: u64,
}

impl<'t, T: TextTokenizer> DatasetLoader<'t, T> {
    /// Create a loader reading the variant's Hub dataset
    pub fn new(variant: DatasetVariant, tokenizer: &'t T, target: TargetField) -> Self {
        Self {
            tokenizer,
            variant,
            target,
            prompts: PromptConfig::default(),
            source: DatasetSource::Hub(variant.hub_id().to_string()),
            seed: DEFAULT_SEED,
        }
    }

    /// Read from a different source
    pub fn with_source(mut self, source: DatasetSource) -> Self {
        self.source = source;
        self
    }

    /// Override prompts and lengths
    pub fn with_prompts(mut self, prompts: PromptConfig) -> Self {
        self.prompts = prompts;
        self
    }

    /// Override the split seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn variant(&self) -> DatasetVariant {
        self.variant
    }

    pub fn system_prompt(&self) -> &str {
        self.prompts.system_prompt(self.target)
    }

    pub fn max_length(&self) -> usize {
        self.prompts.max_length(self.target)
    }

    /// Fetch raw examples and split them
    pub fn load_raw(&self) -> Result<RawSplits> {
        let files = match &self.source {
            DatasetSource::Hub(id) => HubApi::new()?.download_dataset_files(id)?,
            DatasetSource::Local(path) => local_data_files(path)?,
        };
        splits_from_files(&files, self.seed)
    }

    /// Tokenize already loaded splits
    pub fn prepare(&self, raw: RawSplits) -> Result<PreparedDataset> {
        let train = raw
            .train
            .iter()
            .map(|ex| self.preprocess(ex))
            .collect::<Result<Vec<_>>>()
            .context("Preprocessing train data")?;
        let test = raw
            .test
            .iter()
            .map(|ex| self.preprocess(ex))
            .collect::<Result<Vec<_>>>()
            .context("Preprocessing test data")?;

        tracing::info!(
            "Prepared {} dataset: {} train / {} test examples (max_length={})",
            self.variant,
            train.len(),
            test.len(),
            self.max_length()
        );

        Ok(PreparedDataset {
            train,
            test,
            raw_test: raw.test,
        })
    }

    /// Load, split and tokenize
    pub fn load_and_prepare(&self) -> Result<PreparedDataset> {
        let raw = self.load_raw()?;
        self.prepare(raw)
    }

    /// Template and tokenize one example
    pub fn preprocess(&self, example: &Example) -> Result<TokenizedExample> {
        let prompt = build_prompt(
            self.system_prompt(),
            &example.input,
            example.target(self.target),
        );
        let encoded = self.tokenizer.encode_fixed(&prompt, self.max_length())?;

        Ok(TokenizedExample {
            labels: encoded.input_ids.clone(),
            input_ids: encoded.input_ids,
            attention_mask: encoded.attention_mask,
        })
    }
}

/// Collect data files from a local file or directory
pub fn local_data_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        anyhow::bail!("Dataset path does not exist: {:?}", path);
    }

    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("Reading {:?}", dir))? {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                pending.push(entry_path);
            } else if is_dataset_file(&entry_path) {
                files.push(entry_path);
            }
        }
    }
    files.sort();

    if files.is_empty() {
        anyhow::bail!("No jsonl/json/parquet files found under {:?}", path);
    }
    Ok(files)
}

/// Group files into splits by name and read them.
///
/// Files with a `test` token in their name form the test split. Without any, the
/// train records are split 90/10 with `seed`.
pub fn splits_from_files(files: &[PathBuf], seed: u64) -> Result<RawSplits> {
    let (test_files, train_files): (Vec<&PathBuf>, Vec<&PathBuf>) =
        files.iter().partition(|p| is_test_file(p));

    let mut train = Vec::new();
    for file in &train_files {
        train.extend(read_examples(file)?);
    }

    if test_files.is_empty() {
        let (train, test) = train_test_split(train, TEST_FRACTION, seed);
        tracing::info!(
            "No test split found, held out {} of {} examples (seed={})",
            test.len(),
            test.len() + train.len(),
            seed
        );
        return Ok(RawSplits { train, test });
    }

    let mut test = Vec::new();
    for file in &test_files {
        test.extend(read_examples(file)?);
    }
    Ok(RawSplits { train, test })
}

/// `test` as a whole token of the file stem (`test.jsonl`, `test-00000-of-00001.parquet`)
fn is_test_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|n| n.to_str())
        .map(|stem| {
            stem.to_lowercase()
                .split(['-', '_', '.', ' '])
                .any(|token| token == "test")
        })
        .unwrap_or(false)
}

/// Deterministic shuffled split; the test side gets `ceil(n * test_fraction)` examples
pub fn train_test_split(
    examples: Vec<Example>,
    test_fraction: f64,
    seed: u64,
) -> (Vec<Example>, Vec<Example>) {
    let n = examples.len();
    let n_test = ((n as f64) * test_fraction).ceil() as usize;

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut slots: Vec<Option<Example>> = examples.into_iter().map(Some).collect();
    let mut take = |i: usize| slots[i].take();

    let test: Vec<Example> = indices[..n_test].iter().filter_map(|&i| take(i)).collect();
    let train: Vec<Example> = indices[n_test..].iter().filter_map(|&i| take(i)).collect();
    (train, test)
}

/// Read examples from a jsonl, json or parquet file
pub fn read_examples(path: &Path) -> Result<Vec<Example>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let examples = match extension.as_str() {
        "jsonl" => read_jsonl(path)?,
        "json" => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read file: {:?}", path))?;
            if content.trim_start().starts_with('[') {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse JSON array in {:?}", path))?
            } else {
                read_jsonl(path)?
            }
        }
        "parquet" => read_parquet(path)?,
        other => anyhow::bail!("Unsupported dataset file format '{}': {:?}", other, path),
    };

    tracing::info!("Loaded {} examples from {:?}", examples.len(), path);
    Ok(examples)
}

fn read_jsonl(path: &Path) -> Result<Vec<Example>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open dataset file: {:?}", path))?;
    let reader = BufReader::new(file);

    let mut examples = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let example: Example = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse JSON at line {}", line_num + 1))?;
        examples.push(example);
    }
    Ok(examples)
}

#[cfg(feature = "parquet")]
fn read_parquet(path: &Path) -> Result<Vec<Example>> {
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use parquet::record::Field;

    let file =
        File::open(path).with_context(|| format!("Failed to open parquet file: {:?}", path))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("Failed to read parquet metadata: {:?}", path))?;

    let mut examples = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        let mut example = Example::default();
        for (name, field) in row.get_column_iter() {
            let text = match field {
                Field::Null => continue,
                Field::Str(s) => s.clone(),
                other => other.to_string(),
            };
            match name.as_str() {
                "input" => example.input = text,
                "output" => example.output = text,
                "solution" => example.solution = text,
                "difficulty" => example.difficulty = Some(text),
                _ => {}
            }
        }
        examples.push(example);
    }
    Ok(examples)
}

#[cfg(not(feature = "parquet"))]
fn read_parquet(path: &Path) -> Result<Vec<Example>> {
    anyhow::bail!(
        "Parquet support requires the 'parquet' feature: {:?}",
        path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::models::tokenizer::testing::ByteTokenizer;
    use std::io::Write;
    use tempfile::tempdir;

    fn example(i: usize) -> Example {
        Example {
            input: format!("problem {}", i),
            output: format!("<think>reason {}</think>\nprint({})", i, i),
            solution: format!("print({})", i),
            difficulty: Some("easy".to_string()),
        }
    }

    fn write_jsonl(path: &Path, examples: &[Example]) {
        let mut file = File::create(path).unwrap();
        for ex in examples {
            writeln!(file, "{}", serde_json::to_string(ex).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_variant_parsing() {
        assert_eq!("deep".parse::<DatasetVariant>().unwrap(), DatasetVariant::Deep);
        assert_eq!("DIVERSE".parse::<DatasetVariant>().unwrap(), DatasetVariant::Diverse);
        let err = "shallow".parse::<DatasetVariant>().unwrap_err();
        assert!(err.to_string().contains("shallow"));
        assert_eq!(DatasetVariant::Deep.hub_id(), DEEP_DATASET);
    }

    #[test]
    fn test_prompt_template() {
        let prompt = build_prompt("SYS", "add two numbers", "print(1+1)");
        assert_eq!(prompt, "SYS\n\nProblem:\nadd two numbers\n\nSolution:\nprint(1+1)");
        assert!(generation_prompt("SYS", "p").ends_with(SOLUTION_MARKER));
    }

    #[test]
    fn test_reasoning_mode_uses_output_and_longer_length() {
        let loader = DatasetLoader::new(DatasetVariant::Deep, &ByteTokenizer, TargetField::Reasoning);
        assert_eq!(loader.max_length(), 8192);
        assert!(loader.system_prompt().contains("<think>"));

        let solution_loader =
            DatasetLoader::new(DatasetVariant::Deep, &ByteTokenizer, TargetField::Solution);
        assert_eq!(solution_loader.max_length(), 1024);

        let ex = example(3);
        assert_eq!(ex.target(TargetField::Reasoning), ex.output);
        assert_eq!(ex.target(TargetField::Solution), ex.solution);
    }

    #[test]
    fn test_tokenized_lengths_and_labels() {
        let prompts = PromptConfig {
            max_length_solution: 64,
            ..Default::default()
        };
        let loader = DatasetLoader::new(DatasetVariant::Diverse, &ByteTokenizer, TargetField::Solution)
            .with_prompts(prompts);

        let long = Example {
            input: "x".repeat(500),
            ..example(1)
        };
        for ex in [example(0), long] {
            let tokenized = loader.preprocess(&ex).unwrap();
            assert_eq!(tokenized.input_ids.len(), 64);
            assert_eq!(tokenized.labels.len(), 64);
            assert_eq!(tokenized.attention_mask.len(), 64);
            assert_eq!(tokenized.labels, tokenized.input_ids);
        }
    }

    #[test]
    fn test_prompt_roundtrip_through_tokenizer() {
        let prompts = PromptConfig {
            max_length_solution: 4096,
            ..Default::default()
        };
        let loader = DatasetLoader::new(DatasetVariant::Deep, &ByteTokenizer, TargetField::Solution)
            .with_prompts(prompts.clone());
        let ex = example(7);
        let tokenized = loader.preprocess(&ex).unwrap();

        let real: Vec<u32> = tokenized
            .input_ids
            .iter()
            .zip(&tokenized.attention_mask)
            .filter(|(_, &m)| m == 1)
            .map(|(&id, _)| id)
            .collect();
        let decoded = ByteTokenizer.decode_ids(&real).unwrap();
        let expected = build_prompt(&prompts.system_prompt_solution, &ex.input, &ex.solution);
        assert_eq!(decoded, expected);

        // Truncated round trip yields a prefix
        let short = DatasetLoader::new(DatasetVariant::Deep, &ByteTokenizer, TargetField::Solution)
            .with_prompts(PromptConfig {
                max_length_solution: 20,
                ..Default::default()
            });
        let tokenized = short.preprocess(&ex).unwrap();
        let decoded = ByteTokenizer.decode_ids(&tokenized.input_ids).unwrap();
        assert_eq!(decoded, expected[..20]);
    }

    #[test]
    fn test_split_is_deterministic() {
        let examples: Vec<Example> = (0..25).map(example).collect();
        let (train_a, test_a) = train_test_split(examples.clone(), TEST_FRACTION, 42);
        let (train_b, test_b) = train_test_split(examples, TEST_FRACTION, 42);

        assert_eq!(test_a.len(), 3);
        assert_eq!(train_a.len(), 22);
        assert_eq!(train_a, train_b);
        assert_eq!(test_a, test_b);
    }

    #[test]
    fn test_local_source_without_test_split() {
        let dir = tempdir().unwrap();
        let examples: Vec<Example> = (0..10).map(example).collect();
        write_jsonl(&dir.path().join("train.jsonl"), &examples);

        let loader = DatasetLoader::new(DatasetVariant::Deep, &ByteTokenizer, TargetField::Solution)
            .with_source(DatasetSource::Local(dir.path().to_path_buf()));
        let prepared = loader.load_and_prepare().unwrap();

        assert_eq!(prepared.train.len(), 9);
        assert_eq!(prepared.test.len(), 1);
        assert_eq!(prepared.raw_test.len(), 1);
    }

    #[test]
    fn test_local_source_with_test_split() {
        let dir = tempdir().unwrap();
        write_jsonl(&dir.path().join("train.jsonl"), &(0..6).map(example).collect::<Vec<_>>());
        write_jsonl(&dir.path().join("test.jsonl"), &(6..8).map(example).collect::<Vec<_>>());

        let files = local_data_files(dir.path()).unwrap();
        let splits = splits_from_files(&files, DEFAULT_SEED).unwrap();
        assert_eq!(splits.train.len(), 6);
        assert_eq!(splits.test.len(), 2);
        assert_eq!(splits.test[0].input, "problem 6");
    }

    #[test]
    fn test_test_token_must_be_whole_word() {
        let dir = tempdir().unwrap();
        write_jsonl(
            &dir.path().join("contest_problems.jsonl"),
            &(0..10).map(example).collect::<Vec<_>>(),
        );

        let files = local_data_files(dir.path()).unwrap();
        let splits = splits_from_files(&files, DEFAULT_SEED).unwrap();
        assert_eq!(splits.train.len(), 9);
        assert_eq!(splits.test.len(), 1);

        for name in ["latest.parquet", "attestation.json", "contest_problems.jsonl"] {
            assert!(!is_test_file(Path::new(name)), "{}", name);
        }
        for name in ["test.jsonl", "data/test-00000-of-00001.parquet", "codegen_TEST.json"] {
            assert!(is_test_file(Path::new(name)), "{}", name);
        }
    }

    #[test]
    fn test_numeric_difficulty_and_missing_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"[{"input": "a", "solution": "b", "difficulty": 3}, {"input": "c"}]"#,
        )
        .unwrap();

        let examples = read_examples(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].difficulty.as_deref(), Some("3"));
        assert_eq!(examples[1].solution, "");
        assert!(examples[1].difficulty.is_none());
    }
}
