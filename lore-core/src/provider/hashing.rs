//! Offline embedding provider based on feature hashing.
//!
//! Every lowercase word token is hashed with SHA-256 into one of
//! `dimensions` buckets with a +1/-1 sign, and the resulting bag-of-words
//! vector is L2-normalized. Texts sharing words get a positive cosine
//! similarity; texts with no words in common score close to zero. Output
//! depends only on the text, so it is stable across processes and builds.

use super::types::*;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Deterministic bag-of-words embedder that needs no model or network.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimensions: usize,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Computes the embedding synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }

        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, text: &str, _model: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}
