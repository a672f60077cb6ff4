//! Document storage.
//!
//! Keyed storage for [`Document`]s with unique ids and an exact live count.
//! The store knows nothing about the similarity index; keeping the two in
//! lockstep is the knowledge service's job.

use super::types::{Document, Metadata};
use super::vector::{Vector, VectorError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

/// Errors that can occur in the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Document id already exists: {0}")]
    DuplicateId(String),

    #[error("Snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A document that hasn't been stored yet.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub metadata: Metadata,
    pub vector: Vector,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(default)]
    generation: u64,
    documents: Vec<Document>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    generation: u64,
    documents: Vec<&'a Document>,
}

/// In-memory document store.
///
/// Every document carries an insertion sequence number so snapshots (and
/// therefore reloaded indexes) keep insertion order.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: HashMap<String, (u64, Document)>,
    next_seq: u64,
    total_content_bytes: usize,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new document and returns its id.
    ///
    /// A random UUID is assigned when `document.id` is `None`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidDocument`] when content or a supplied id is blank
    /// - [`StoreError::DuplicateId`] when the id is already taken
    pub fn put(&mut self, document: NewDocument) -> Result<String> {
        let document = self.prepare(document)?;
        let id = document.id.clone();
        self.restore(document)?;
        Ok(id)
    }

    /// Builds the document `put` would store, without storing it.
    pub fn prepare(&self, document: NewDocument) -> Result<Document> {
        if document.content.trim().is_empty() {
            return Err(StoreError::InvalidDocument("content must not be empty".to_string()));
        }

        let id = match document.id {
            Some(id) if id.trim().is_empty() => {
                return Err(StoreError::InvalidDocument("id must not be blank".to_string()));
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        if self.documents.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        Ok(Document {
            id,
            title: document.title,
            content: document.content,
            metadata: document.metadata,
            vector: document.vector,
            created_at: Utc::now(),
        })
    }

    /// Inserts an already-built document, keeping its id and timestamp.
    ///
    /// Used by `put` and when loading a snapshot or replaying the journal.
    pub fn restore(&mut self, document: Document) -> Result<()> {
        if self.documents.contains_key(&document.id) {
            return Err(StoreError::DuplicateId(document.id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.total_content_bytes += document.content.len();
        self.documents.insert(document.id.clone(), (seq, document));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id).map(|(_, document)| document)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    /// Removes and returns the document, if present.
    pub fn remove(&mut self, id: &str) -> Option<Document> {
        let (_, document) = self.documents.remove(id)?;
        self.total_content_bytes -= document.content.len();
        Some(document)
    }

    /// Removes the document; `false` when there was nothing to remove.
    pub fn delete(&mut self, id: &str) -> bool {
        self.remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn total_content_bytes(&self) -> usize {
        self.total_content_bytes
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Documents in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        let mut entries: Vec<&(u64, Document)> = self.documents.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, document)| document)
    }

    /// Writes all documents to `path` as a snapshot of `generation`.
    pub fn save_snapshot(&self, path: &Path, generation: u64) -> Result<()> {
        write_snapshot(path, generation, self.iter())
    }

    /// Loads a snapshot, checking every vector has `dimensions` components.
    ///
    /// Returns the store and the snapshot's generation.
    pub fn load_snapshot(path: &Path, dimensions: usize) -> Result<(Self, u64)> {
        let bytes = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut store = Self::new();
        for document in snapshot.documents {
            check_document(&document, dimensions)?;
            store.restore(document)?;
        }
        Ok((store, snapshot.generation))
    }
}

/// Rejects persisted documents the service could never have stored.
pub fn check_document(document: &Document, dimensions: usize) -> Result<()> {
    if document.vector.dimensions() != dimensions {
        let err = VectorError::DimensionMismatch {
            expected: dimensions,
            actual: document.vector.dimensions(),
        };
        return Err(StoreError::Corrupt(format!("document {}: {}", document.id, err)));
    }
    if document.content.trim().is_empty() {
        return Err(StoreError::Corrupt(format!("document {} has empty content", document.id)));
    }
    Ok(())
}

/// Writes `documents` to `path` as JSON.
///
/// The file is written next to `path` and renamed over it, so readers
/// see either the old snapshot or the new one.
pub fn write_snapshot<'a>(
    path: &Path,
    generation: u64,
    documents: impl IntoIterator<Item = &'a Document>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        generation,
        documents: documents.into_iter().collect(),
    };
    let bytes = serde_json::to_vec(&snapshot)?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    fs::write(tmp_path, bytes)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}
