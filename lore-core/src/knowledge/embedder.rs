//! Embedding gateway.
//!
//! Wraps an [`EmbeddingProvider`] with a bounded timeout, output validation
//! and a content-addressed cache keyed by SHA-256 of `(model, text)`.

use super::vector::{Vector, VectorError};
use crate::config::EmbeddingConfig;
use crate::provider::{EmbeddingProvider, ProviderError};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during embedding generation.
#[derive(Debug, Error)]
pub enum EmbedderError {
    /// The provider API returned an error or was unreachable.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Embedding request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider answered with a vector we refuse to index.
    #[error("Malformed embedding: {0}")]
    Malformed(#[from] VectorError),

    #[error("Cannot embed empty text")]
    EmptyInput,
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedderError>;

type CacheKey = [u8; 32];

/// Insertion-ordered cache; the oldest entry is evicted first.
struct EmbeddingCache {
    capacity: usize,
    entries: HashMap<CacheKey, Vector>,
    order: VecDeque<CacheKey>,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Vector> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, vector: Vector) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key);
        self.entries.insert(key, vector);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn cache_key(model: &str, text: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

/// Generates validated vector embeddings for text.
///
/// Cloning is cheap; clones share the provider and the cache.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    model: String,
    dimensions: usize,
    timeout: Duration,
    cache: Arc<Mutex<EmbeddingCache>>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            dimensions: config.dimensions,
            timeout: Duration::from_millis(config.timeout_ms),
            cache: Arc::new(Mutex::new(EmbeddingCache::new(config.cache_capacity))),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of embeddings currently cached.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Generates a vector embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `text` is empty or whitespace
    /// - The provider fails or doesn't answer within the timeout
    /// - The provider returns the wrong dimension or non-finite values
    ///
    /// A failure never yields a substitute vector.
    pub async fn embed(&self, text: &str) -> Result<Vector> {
        if text.trim().is_empty() {
            return Err(EmbedderError::EmptyInput);
        }

        let key = cache_key(&self.model, text);
        let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&key);
        if let Some(hit) = cached {
            debug!(target: "lore_core::knowledge", model = %self.model, "Embedding cache hit");
            return Ok(hit);
        }

        let values = tokio::time::timeout(self.timeout, self.provider.embed(text, &self.model))
            .await
            .map_err(|_| {
                warn!(
                    target: "lore_core::knowledge",
                    provider = self.provider.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Embedding request timed out"
                );
                EmbedderError::Timeout(self.timeout)
            })??;

        let vector = Vector::with_dimensions(values, self.dimensions).map_err(|e| {
            warn!(
                target: "lore_core::knowledge",
                provider = self.provider.name(),
                error = %e,
                "Provider returned a malformed embedding"
            );
            EmbedderError::Malformed(e)
        })?;

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, vector.clone());

        Ok(vector)
    }
}
