use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root for the synthetic dataset and adapter artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}
fn default_overlap() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Dimensionality used by the `hash` provider when `dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 384;

impl EmbeddingConfig {
    pub fn effective_dims(&self) -> usize {
        self.dims.unwrap_or(DEFAULT_HASH_DIMS)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `arxiv` or `directory`.
    #[serde(default = "default_source_provider")]
    pub provider: String,
    #[serde(default = "default_arxiv_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause between consecutive page requests.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub fetch_full_text: bool,
    #[serde(default = "default_max_full_text_chars")]
    pub max_full_text_chars: usize,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            provider: default_source_provider(),
            base_url: default_arxiv_url(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            fetch_full_text: false,
            max_full_text_chars: default_max_full_text_chars(),
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_source_provider() -> String {
    "arxiv".to_string()
}
fn default_arxiv_url() -> String {
    "http://export.arxiv.org/api/query".to_string()
}
fn default_page_size() -> usize {
    50
}
fn default_request_delay_ms() -> u64 {
    3000
}
fn default_max_full_text_chars() -> usize {
    50_000
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    /// `openai` or `disabled`.
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,
    #[serde(default = "default_synthesis_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_synthesis_temperature")]
    pub temperature: f32,
    #[serde(default = "default_synthesis_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub include_edge_cases: bool,
    /// Relative to `storage.data_dir`.
    #[serde(default = "default_dataset_file")]
    pub dataset_file: PathBuf,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            model: default_synthesis_model(),
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_synthesis_temperature(),
            max_tokens: default_synthesis_max_tokens(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_retries(),
            include_edge_cases: false,
            dataset_file: default_dataset_file(),
        }
    }
}

fn default_synthesis_provider() -> String {
    "openai".to_string()
}
fn default_synthesis_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_synthesis_temperature() -> f32 {
    0.7
}
fn default_synthesis_max_tokens() -> u32 {
    2000
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_generation_retries() -> u32 {
    3
}
fn default_dataset_file() -> PathBuf {
    PathBuf::from("synthetic/synthetic_qa.jsonl")
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    /// `command` or `disabled`.
    #[serde(default = "default_training_provider")]
    pub provider: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_base_model")]
    pub base_model: String,
    #[serde(default = "default_training_timeout_secs")]
    pub timeout_secs: u64,
    /// Share of QA pairs held out from training for evaluation.
    #[serde(default = "default_validation_ratio")]
    pub validation_ratio: f64,
    #[serde(default)]
    pub lora: LoraConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            provider: default_training_provider(),
            command: None,
            args: Vec::new(),
            base_model: default_base_model(),
            timeout_secs: default_training_timeout_secs(),
            validation_ratio: default_validation_ratio(),
            lora: LoraConfig::default(),
        }
    }
}

fn default_training_provider() -> String {
    "disabled".to_string()
}
fn default_base_model() -> String {
    "meta-llama/Meta-Llama-3-8B-Instruct".to_string()
}
fn default_training_timeout_secs() -> u64 {
    6 * 60 * 60
}
fn default_validation_ratio() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoraConfig {
    #[serde(default = "default_lora_r")]
    pub r: u32,
    #[serde(default = "default_lora_alpha")]
    pub alpha: u32,
    #[serde(default = "default_lora_dropout")]
    pub dropout: f32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: default_lora_r(),
            alpha: default_lora_alpha(),
            dropout: default_lora_dropout(),
        }
    }
}

fn default_lora_r() -> u32 {
    16
}
fn default_lora_alpha() -> u32 {
    32
}
fn default_lora_dropout() -> f32 {
    0.05
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// `extractive` (offline, context-only answers) or `openai` (any
    /// OpenAI-compatible chat completions server).
    #[serde(default = "default_inference_provider")]
    pub provider: String,
    #[serde(default = "default_inference_url")]
    pub base_url: String,
    /// Optional; local servers usually need no key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_served_base_model")]
    pub base_model: String,
    /// Served name of the fine-tuned adapter. Falls back to the job id.
    #[serde(default)]
    pub finetuned_model: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: default_inference_provider(),
            base_url: default_inference_url(),
            api_key_env: None,
            base_model: default_served_base_model(),
            finetuned_model: None,
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_retries(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_inference_provider() -> String {
    "extractive".to_string()
}
fn default_inference_url() -> String {
    "http://127.0.0.1:8001".to_string()
}
fn default_served_base_model() -> String {
    "llama-3-8b-instruct".to_string()
}
fn default_system_prompt() -> String {
    "You are a helpful AI research assistant specializing in NLP and machine learning. \
     Answer questions accurately based on your knowledge of research papers."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    pub fn dataset_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.synthesis.dataset_file)
    }

    pub fn adapters_dir(&self) -> PathBuf {
        self.storage.data_dir.join("adapters")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.storage.data_dir.join("reports")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() {
                bail!("embedding.dims must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate source
    match config.source.provider.as_str() {
        "arxiv" => {}
        "directory" => {
            if config.source.root.is_none() {
                bail!("source.root must be set when provider is 'directory'");
            }
        }
        other => bail!(
            "Unknown source provider: '{}'. Must be arxiv or directory.",
            other
        ),
    }
    if config.source.page_size == 0 {
        bail!("source.page_size must be > 0");
    }

    match config.synthesis.provider.as_str() {
        "openai" | "disabled" => {}
        other => bail!(
            "Unknown synthesis provider: '{}'. Must be openai or disabled.",
            other
        ),
    }

    match config.training.provider.as_str() {
        "disabled" => {}
        "command" => {
            if config.training.command.as_deref().map_or(true, str::is_empty) {
                bail!("training.command must be set when provider is 'command'");
            }
        }
        other => bail!(
            "Unknown training provider: '{}'. Must be command or disabled.",
            other
        ),
    }
    if !(0.0..=0.5).contains(&config.training.validation_ratio) {
        bail!("training.validation_ratio must be between 0.0 and 0.5");
    }

    match config.inference.provider.as_str() {
        "extractive" | "openai" => {}
        other => bail!(
            "Unknown inference provider: '{}'. Must be extractive or openai.",
            other
        ),
    }

    if config.server.bind.trim().is_empty() {
        bail!("server.bind must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/ph.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 256);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.effective_dims(), DEFAULT_HASH_DIMS);
        assert_eq!(config.source.provider, "arxiv");
        assert_eq!(config.training.provider, "disabled");
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(
            config.dataset_path(),
            PathBuf::from("./data/synthetic/synthetic_qa.jsonl")
        );
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_directory_source_requires_root() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[source]\nprovider = \"directory\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("source.root"));
    }

    #[test]
    fn test_command_trainer_requires_command() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[training]\nprovider = \"command\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("training.command"));
    }

    #[test]
    fn test_unknown_inference_provider() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[inference]\nprovider = \"magic\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown inference provider"));
    }

    #[test]
    fn test_validation_ratio_bounds() {
        let ok = parse_config("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert!((ok.training.validation_ratio - 0.1).abs() < f64::EPSILON);
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[training]\nvalidation_ratio = 0.9\n")
            .unwrap_err();
        assert!(err.to_string().contains("validation_ratio"));
    }
}
