//! Similarity index.
//!
//! The [`SimilarityIndex`] trait is the interface the knowledge service ranks
//! through; [`FlatIndex`] is the shipped implementation.
//!
//! # Ranking
//!
//! Results are ordered by descending score; equal scores are ordered by
//! insertion (earlier first). That is a total order over the indexed ids, so
//! repeated queries return identical results and asking for a larger `top_k`
//! only appends to the previous answer.

use super::vector::{magnitude, score_with_norms, Vector, VectorError};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

/// Errors that can occur in a similarity index.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("top_k must be at least 1, got {0}")]
    InvalidTopK(usize),

    #[error("Index error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// A scored index hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    /// Display score in [0, 1].
    pub score: f32,
}

/// Ranked retrieval over stored vectors.
///
/// Implementations hold no locks of their own; the knowledge service guards
/// the index together with the document store.
pub trait SimilarityIndex: Send + Sync {
    /// Adds the vector for `id`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the vector dimension doesn't match the index.
    fn insert(&mut self, id: &str, vector: &Vector) -> Result<()>;

    /// Removes the vector for `id`; returns `false` if there was none.
    fn remove(&mut self, id: &str) -> bool;

    /// Returns the `top_k` best matches for `query`, best first.
    ///
    /// Returns every entry when the index holds fewer than `top_k`.
    fn query(&self, query: &Vector, top_k: usize) -> Result<Vec<IndexMatch>>;

    fn contains(&self, id: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ids(&self) -> Vec<String>;

    fn dimensions(&self) -> usize;
}

struct Entry {
    vector: Vector,
    norm: f32,
    seq: u64,
}

/// Candidate during selection. Greater means better: higher score, then
/// earlier insertion.
struct Ranked<'a> {
    score: f32,
    seq: u64,
    id: &'a str,
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Exact linear-scan index.
///
/// Every query scores every stored vector and keeps the best `top_k` in a
/// bounded min-heap.
///
/// # Performance
///
/// - Insert: O(d)
/// - Remove: O(1)
/// - Query: O(n * d + n * log k) where n = vectors, d = dimensions
pub struct FlatIndex {
    dimensions: usize,
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    fn check_dimensions(&self, vector: &Vector) -> Result<()> {
        if vector.dimensions() != self.dimensions {
            return Err(IndexError::Vector(VectorError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.dimensions(),
            }));
        }
        Ok(())
    }
}

impl SimilarityIndex for FlatIndex {
    /// Replacing keeps the entry's original position in the tie-break order.
    fn insert(&mut self, id: &str, vector: &Vector) -> Result<()> {
        self.check_dimensions(vector)?;

        let norm = vector.magnitude();
        if let Some(entry) = self.entries.get_mut(id) {
            entry.vector = vector.clone();
            entry.norm = norm;
            return Ok(());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id.to_string(),
            Entry {
                vector: vector.clone(),
                norm,
                seq,
            },
        );
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    fn query(&self, query: &Vector, top_k: usize) -> Result<Vec<IndexMatch>> {
        if top_k == 0 {
            return Err(IndexError::InvalidTopK(top_k));
        }
        self.check_dimensions(query)?;

        let query_norm = magnitude(query.as_slice());
        let capacity = top_k.min(self.entries.len());
        let mut heap: BinaryHeap<Reverse<Ranked<'_>>> = BinaryHeap::with_capacity(capacity + 1);

        for (id, entry) in &self.entries {
            let candidate = Ranked {
                score: score_with_norms(
                    query.as_slice(),
                    entry.vector.as_slice(),
                    query_norm,
                    entry.norm,
                ),
                seq: entry.seq,
                id: id.as_str(),
            };

            if heap.len() < top_k {
                heap.push(Reverse(candidate));
            } else if let Some(Reverse(worst)) = heap.peek() {
                if candidate > *worst {
                    heap.pop();
                    heap.push(Reverse(candidate));
                }
            }
        }

        // Ascending order of Reverse<Ranked> is best-first.
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(ranked)| IndexMatch {
                id: ranked.id.to_string(),
                score: ranked.score,
            })
            .collect())
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
