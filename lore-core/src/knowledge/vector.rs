//! Fixed-dimension vectors and similarity scoring.
//!
//! Similarity is cosine similarity rescaled for display:
//!
//! ```text
//! score = clamp((cosine + 1) / 2, 0, 1)
//! ```
//!
//! so identical directions score `1.0`, orthogonal vectors `0.5` and
//! opposite vectors `0.0`. Clients show `score * 100` as a percentage, so
//! this mapping is part of the public contract. A zero-magnitude vector on
//! either side scores `0.0`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when validating or comparing vectors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Non-finite value at index {index}")]
    NonFinite { index: usize },

    #[error("Vector is empty")]
    Empty,
}

pub type Result<T> = std::result::Result<T, VectorError>;

/// A validated embedding: non-empty, every component finite.
///
/// Deserialization goes through the same validation, so a corrupted
/// snapshot cannot smuggle a NaN into the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Vector(Vec<f32>);

impl Vector {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(VectorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::NonFinite { index });
        }
        Ok(Self(values))
    }

    /// Validates `values` and checks they have exactly `dimensions` components.
    pub fn with_dimensions(values: Vec<f32>, dimensions: usize) -> Result<Self> {
        if values.len() != dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: dimensions,
                actual: values.len(),
            });
        }
        Self::new(values)
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn magnitude(&self) -> f32 {
        magnitude(&self.0)
    }

    /// Raw cosine similarity in [-1, 1]; `0.0` when either side is zero.
    pub fn cosine(&self, other: &Vector) -> Result<f32> {
        cosine_similarity(&self.0, &other.0)
    }

    /// Display score in [0, 1].
    pub fn similarity(&self, other: &Vector) -> Result<f32> {
        check_dimensions(&self.0, &other.0)?;
        Ok(score_with_norms(&self.0, &other.0, self.magnitude(), other.magnitude()))
    }
}

impl TryFrom<Vec<f32>> for Vector {
    type Error = VectorError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Vector> for Vec<f32> {
    fn from(vector: Vector) -> Self {
        vector.0
    }
}

fn check_dimensions(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

pub(crate) fn magnitude(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Computes cosine similarity between two vectors.
///
/// Returns values from -1.0 (opposite) to 1.0 (identical), with 0.0 for
/// orthogonal vectors or when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dimensions(a, b)?;

    let magnitude_a = magnitude(a);
    let magnitude_b = magnitude(b);
    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot(a, b) / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0))
}

/// Maps a cosine similarity onto the [0, 1] display range.
pub fn normalize_score(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Display score for equal-length slices with precomputed magnitudes.
///
/// Callers must have checked dimensions already.
pub(crate) fn score_with_norms(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = (dot(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0);
    normalize_score(cosine)
}
