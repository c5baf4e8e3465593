use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_words")]
    pub window_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_words: default_window_words(),
            overlap_words: default_overlap_words(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_window_words() -> usize {
    800
}
fn default_overlap_words() -> usize {
    150
}
fn default_min_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrency: default_max_concurrency(),
            stage_timeout_secs: default_stage_timeout_secs(),
            fetch_attempts: default_fetch_attempts(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
            min_text_chars: default_min_text_chars(),
        }
    }
}

impl ProcessingConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    30 * 60
}
fn default_poll_interval_secs() -> u64 {
    300
}
fn default_max_concurrency() -> usize {
    4
}
fn default_stage_timeout_secs() -> u64 {
    300
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_fetch_backoff_ms() -> u64 {
    500
}
fn default_min_text_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_client_retries")]
    pub max_retries: u32,
    #[serde(default = "default_metadata_chars")]
    pub metadata_chars: usize,
    #[serde(default = "default_list_chars")]
    pub list_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_extraction_provider(),
            base_url: default_base_url(),
            model: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_client_retries(),
            metadata_chars: default_metadata_chars(),
            list_chars: default_list_chars(),
        }
    }
}

fn default_extraction_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "API_KEY".to_string()
}
fn default_metadata_chars() -> usize {
    8000
}
fn default_list_chars() -> usize {
    10000
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
    #[serde(default = "default_client_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: 32,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Vector width, falling back to the local hash embedder's default.
    pub fn effective_dims(&self) -> usize {
        self.dims.unwrap_or(256)
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_client_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.window_words == 0 {
        anyhow::bail!("chunking.window_words must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.window_words {
        anyhow::bail!("chunking.overlap_words must be < chunking.window_words");
    }

    // Validate processing
    if config.processing.max_retries == 0 {
        anyhow::bail!("processing.max_retries must be >= 1");
    }
    if config.processing.max_concurrency == 0 {
        anyhow::bail!("processing.max_concurrency must be >= 1");
    }
    if config.processing.fetch_attempts == 0 {
        anyhow::bail!("processing.fetch_attempts must be >= 1");
    }
    if config.processing.stage_timeout_secs == 0 {
        anyhow::bail!("processing.stage_timeout_secs must be > 0");
    }

    // Validate extraction
    match config.extraction.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.extraction.model.is_none() {
                anyhow::bail!("extraction.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" => {
            if config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0");
            }
        }
        "openai" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai.",
            other
        ),
    }

    Ok(())
}
