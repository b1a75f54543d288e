use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rag::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "DRUG_RAG";
pub const CONFIG_PATH_ENV: &str = "DRUG_RAG_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/drug-rag.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings for the whole service. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub openfda: OpenFdaConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Empty list allows any origin.
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            allowed_origins: Vec::new(),
            request_timeout_secs: 300,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFdaConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_results: u32,
    /// Per-section character cap, 0 keeps full sections.
    pub max_section_chars: usize,
    /// 0 disables the response cache.
    pub cache_ttl_secs: u64,
}

impl Default for OpenFdaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.fda.gov/drug/label.json".to_string(),
            api_key: None,
            timeout_secs: 10,
            max_results: 3,
            max_section_chars: 1000,
            cache_ttl_secs: 0,
        }
    }
}

impl OpenFdaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local ONNX model through fastembed.
    Fastembed,
    /// OpenAI-compatible `/embeddings` endpoint.
    Http,
    /// Deterministic feature hashing, no model needed.
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub dimension: usize,
    pub model_dir: PathBuf,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Fastembed,
            dimension: 384,
            model_dir: PathBuf::from("/app/models/bge-small-en-v1.5"),
            base_url: "https://api.jina.ai/v1".to_string(),
            api_key: None,
            model: "jina-embeddings-v2-base-en".to_string(),
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            model: "llama-3.3-70b-versatile".to_string(),
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Vector database backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StorageConfig {
    /// JSON-lines file on local disk
    Local { path: PathBuf },
    /// Remote Qdrant collection
    Qdrant { url: String, collection: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("data/drug-rag.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReingestPolicy {
    /// Re-ingesting a drug appends new records next to the old ones.
    #[default]
    Additive,
    /// Re-ingesting a drug removes its previous records first.
    Replace,
}

/// Knobs handed to the orchestrators at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub upsert_batch_size: usize,
    pub embed_concurrency: usize,
    pub reingest: ReingestPolicy,
    pub retry: RetryPolicy,
    #[serde(skip)]
    pub timeouts: Timeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 4,
            max_context_chars: 6000,
            upsert_batch_size: 32,
            embed_concurrency: 4,
            reingest: ReingestPolicy::Additive,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Per-call bounds for outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub source: Duration,
    pub embedding: Duration,
    pub generation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            source: Duration::from_secs(10),
            embedding: Duration::from_secs(30),
            generation: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Loads defaults, then the config file (if present), then `DRUG_RAG__*` env vars.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.allowed_origins")
                    .try_parsing(true),
            )
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.chunk_size == 0 {
            return Err(ConfigError::Invalid("pipeline.chunk_size must be > 0".into()));
        }
        if pipeline.chunk_overlap >= pipeline.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "pipeline.chunk_overlap ({}) must be smaller than pipeline.chunk_size ({})",
                pipeline.chunk_overlap, pipeline.chunk_size
            )));
        }
        if pipeline.max_context_chars == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_context_chars must be > 0".into(),
            ));
        }
        if pipeline.top_k == 0 {
            return Err(ConfigError::Invalid("pipeline.top_k must be > 0".into()));
        }
        if pipeline.upsert_batch_size == 0 || pipeline.embed_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.upsert_batch_size and pipeline.embed_concurrency must be > 0".into(),
            ));
        }
        if pipeline.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("pipeline.retry.max_attempts must be > 0".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be > 0".into()));
        }
        Ok(())
    }

    /// Pipeline settings with timeouts taken from the provider sections.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            timeouts: Timeouts {
                source: self.openfda.timeout(),
                embedding: self.embedding.timeout(),
                generation: self.llm.timeout(),
            },
            ..self.pipeline.clone()
        }
    }
}
