use super::vector::Vector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar metadata value.
///
/// Nested objects and arrays are rejected on deserialization. Whole numbers
/// that fit an `i64` stay integers, so ids and counts survive exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Boolean(b) => write!(f, "{}", b),
            MetadataValue::Integer(n) => write!(f, "{}", n),
            MetadataValue::Number(n) => write!(f, "{}", n),
            MetadataValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Boolean(value)
    }
}

/// Document metadata, ordered by key.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Metadata keys the knowledge service always fills in on search results.
pub const TITLE_KEY: &str = "title";
pub const DOCUMENT_ID_KEY: &str = "document_id";

/// A document stored in the knowledge base.
///
/// Documents are created by `add_document` and destroyed by
/// `delete_document`; nothing mutates them in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub vector: Vector,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// The title, or `Document <first 8 chars of id>` when none was given.
    pub fn display_title(&self) -> String {
        match &self.title {
            Some(title) => title.clone(),
            None => format!("Document {}", self.id.chars().take(8).collect::<String>()),
        }
    }

    /// Metadata echoed on search results.
    ///
    /// Caller metadata plus `title` and `document_id`; the latter two always
    /// reflect the stored document, whatever the caller put under those keys.
    pub fn result_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.insert(TITLE_KEY.to_string(), self.display_title().into());
        metadata.insert(DOCUMENT_ID_KEY.to_string(), self.id.clone().into());
        metadata
    }
}

/// Input of `add_document`.
///
/// # Example
///
/// ```
/// use lore_core::AddDocument;
///
/// let request = AddDocument::new("Rust ownership rules")
///     .with_title("Ownership")
///     .with_metadata("source", "book")
///     .with_metadata("chapter", 4i64);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddDocument {
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Caller-chosen id; a random UUID is assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl AddDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddDocumentResponse {
    pub success: bool,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDocumentResponse {
    /// Whether a document with the given id existed and was removed.
    pub success: bool,
}

/// A ranked search hit.
///
/// `score` is in [0, 1]; see [`vector`](super::vector) for the mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub metadata: Metadata,
    pub score: f32,
}

impl SearchResult {
    pub fn document_id(&self) -> Option<&str> {
        self.metadata.get(DOCUMENT_ID_KEY).and_then(MetadataValue::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get(TITLE_KEY).and_then(MetadataValue::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// Corpus statistics, derived from the live document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Live documents, each owning exactly one vector.
    pub total_vectors: usize,
    pub total_documents: usize,
    /// Entries in the similarity index; differs from `total_vectors` only
    /// when health is degraded.
    pub indexed_vectors: usize,
    pub total_content_bytes: usize,
    pub dimensions: usize,
    pub embedding_model: String,
    pub consistency_violations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Diagnostic view of the store/index invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub documents: usize,
    pub vectors: usize,
    /// Index hits seen during search whose document was missing.
    pub consistency_violations: u64,
    pub consistency: ConsistencyReport,
}

/// Differences between the document store and the similarity index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Documents without an index entry.
    pub missing_vectors: Vec<String>,
    /// Index entries without a document.
    pub orphaned_vectors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_vectors.is_empty() && self.orphaned_vectors.is_empty()
    }
}

/// Knowledge-base context for a chat prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Numbered context block, empty when nothing matched.
    pub context: String,
    /// Titles of the documents used, in rank order.
    pub sources: Vec<String>,
}
