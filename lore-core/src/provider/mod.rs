//! Embedding provider abstraction layer.
//!
//! This module defines a common interface for the backends that turn text
//! into vectors (Ollama, offline feature hashing).

mod types;
pub mod hashing;
pub mod ollama;

use crate::config::EmbeddingConfig;
use crate::config::ProviderConfig;
use std::sync::Arc;

// Re-export common types
pub use types::{EmbedRequest, EmbedResponse, EmbeddingProvider, ProviderError, Result};

// Re-export provider implementations
pub use hashing::HashingProvider;
pub use ollama::OllamaProvider;

/// Builds the provider named by the embedding configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match &config.provider {
        ProviderConfig::Ollama { base_url } => Arc::new(OllamaProvider::new(base_url)),
        ProviderConfig::Hashing => Arc::new(HashingProvider::new(config.dimensions)),
    }
}
