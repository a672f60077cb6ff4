use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the knowledge store.
///
/// Covers the embedding provider, search defaults and persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Which backend turns text into vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Ollama HTTP API (`/api/embed`)
    Ollama { base_url: String },
    /// Deterministic offline feature hashing, no model required (default)
    Hashing,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Hashing
    }
}

/// Configuration for the embedding gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Model name, also the version component of cache keys
    #[serde(default = "default_model")]
    pub model: String,
    /// Length of every vector the provider must return
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    /// Upper bound on a single provider call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum cached embeddings; 0 disables the cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_model() -> String {
    "all-minilm".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            model: default_model(),
            dimensions: default_dimensions(),
            timeout_ms: default_timeout_ms(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Search defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of results when the caller doesn't ask for a specific count
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Number of documents pulled into a chat prompt
    #[serde(default = "default_context_top_k")]
    pub context_top_k: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_context_top_k() -> usize {
    3
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            context_top_k: default_context_top_k(),
        }
    }
}

/// Storage configuration.
///
/// Without a snapshot path the knowledge base lives in memory only. With
/// one, mutations are appended to `<snapshot_path>.log` and folded into the
/// snapshot every `compact_after` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// Log records between automatic compactions; 0 disables them
    #[serde(default = "default_compact_after")]
    pub compact_after: usize,
}

fn default_compact_after() -> usize {
    1000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            compact_after: default_compact_after(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from `lore.yaml` if it exists, otherwise use defaults.
    pub fn load_or_default() -> Self {
        Self::load("lore.yaml").unwrap_or_default()
    }

    /// Checks the limits the knowledge service relies on.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid("embedding.dimensions must be positive".into()));
        }
        if self.search.default_top_k == 0 || self.search.context_top_k == 0 {
            return Err(ConfigError::Invalid("search top_k values must be positive".into()));
        }
        Ok(())
    }

    pub fn with_snapshot_path(mut self, path: impl Into<String>) -> Self {
        self.storage.snapshot_path = Some(path.into());
        self
    }
}
