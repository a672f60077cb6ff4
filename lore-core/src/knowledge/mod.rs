//! Semantic knowledge store.
//!
//! This module implements the knowledge base a chat assistant retrieves
//! context from: documents go in as text, come back out ranked by semantic
//! similarity to a query.
//!
//! # Architecture
//!
//! - [`KnowledgeService`]: Orchestrates the pipeline and owns the invariants
//! - [`embedder`]: Turns text into validated vectors, with caching
//! - [`store`]: Documents keyed by id
//! - [`journal`]: Append-only persistence with background compaction
//! - [`index`]: Exact top-k similarity search over the stored vectors
//! - [`vector`]: Cosine similarity and the [0, 1] score mapping
//!
//! # Consistency
//!
//! The document store and the similarity index live behind one
//! `tokio::sync::RwLock`. Every add or delete mutates both under the write
//! guard, and every search resolves index hits through the store under the
//! read guard, so no caller ever sees a document without its vector or a
//! vector without its document.
//!
//! Embedding happens before the lock is taken. The write section itself
//! runs as a spawned task: dropping the caller's future after that point
//! doesn't interrupt it, so a cancelled call either changed nothing or ran
//! to completion.
//!
//! # Persistence
//!
//! With `storage.snapshot_path` set, every mutation appends one record to
//! the [`journal`] while the write guard is held. A delete is logged before
//! anything in memory changes; an add is undone if its record can't be
//! written. Rewriting the snapshot happens in the background and never
//! holds the guard.

pub mod embedder;
pub mod index;
pub mod journal;
pub mod store;
mod types;
pub mod vector;

pub use types::{
    AddDocument, AddDocumentResponse, ConsistencyReport, DeleteDocumentResponse, Document,
    HealthReport, HealthStatus, Metadata, MetadataValue, RetrievedContext, SearchResponse,
    SearchResult, Stats, DOCUMENT_ID_KEY, TITLE_KEY,
};

use crate::config::{Config, ConfigError, SearchConfig};
use crate::provider::{self, EmbeddingProvider};
use embedder::{Embedder, EmbedderError};
use index::{FlatIndex, IndexError, SimilarityIndex};
use journal::{Journal, JournalRecord};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use store::{DocumentStore, NewDocument, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Which operation failed, and on which document.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    pub operation: &'static str,
    pub document_id: Option<String>,
}

impl OperationContext {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            document_id: None,
        }
    }

    fn document(operation: &'static str, document_id: impl Into<String>) -> Self {
        Self {
            operation,
            document_id: Some(document_id.into()),
        }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.document_id {
            Some(id) => write!(f, "{} (document {})", self.operation, id),
            None => write!(f, "{}", self.operation),
        }
    }
}

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbedderError),

    #[error("{context} failed: {source}")]
    Index {
        context: OperationContext,
        #[source]
        source: IndexError,
    },

    #[error("{context} failed: {source}")]
    Storage {
        context: OperationContext,
        #[source]
        source: StoreError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KnowledgeError {
    /// The caller sent something we will never accept; maps to a 4xx.
    pub fn is_client_error(&self) -> bool {
        matches!(self, KnowledgeError::InvalidInput(_))
    }

    /// Trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KnowledgeError::EmbeddingUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;

/// The two structures that must stay in lockstep, and their journal.
struct Corpus {
    store: DocumentStore,
    index: Box<dyn SimilarityIndex>,
    journal: Option<Journal>,
}

impl Corpus {
    fn consistency(&self) -> ConsistencyReport {
        let index_ids: HashSet<String> = self.index.ids().into_iter().collect();

        let mut missing_vectors: Vec<String> = self
            .store
            .ids()
            .filter(|id| !index_ids.contains(*id))
            .map(str::to_string)
            .collect();
        let mut orphaned_vectors: Vec<String> = index_ids
            .iter()
            .filter(|id| !self.store.contains(id))
            .cloned()
            .collect();

        missing_vectors.sort();
        orphaned_vectors.sort();
        ConsistencyReport {
            missing_vectors,
            orphaned_vectors,
        }
    }
}

/// The knowledge service orchestrating embedding, storage and search.
///
/// # Thread Safety
///
/// The service is `Clone` and can be shared across tasks; clones share the
/// same corpus, cache and counters.
///
/// # Example
///
/// ```no_run
/// # use lore_core::{AddDocument, Config, KnowledgeService};
/// # async fn example() -> Result<(), lore_core::KnowledgeError> {
/// let service = KnowledgeService::new(&Config::default())?;
///
/// let added = service.add_document(AddDocument::new("The quick brown fox")).await?;
/// let found = service.search_documents("fox", Some(1)).await?;
/// assert_eq!(found.results[0].document_id(), Some(added.document_id.as_str()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KnowledgeService {
    embedder: Embedder,
    corpus: Arc<RwLock<Corpus>>,
    search: SearchConfig,
    /// Held for the whole of a compaction, from rotation to snapshot write.
    compaction: Arc<Mutex<()>>,
    consistency_violations: Arc<AtomicU64>,
}

impl KnowledgeService {
    /// Creates a service using the provider named in the configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let provider = provider::create_provider(&config.embedding);
        Self::with_provider(config, provider)
    }

    /// Creates a service with an explicit embedding provider.
    pub fn with_provider(config: &Config, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let index = Box::new(FlatIndex::new(config.embedding.dimensions));
        Self::with_index(config, provider, index)
    }

    /// Creates a service with an explicit provider and similarity index.
    ///
    /// When `storage.snapshot_path` is set, the snapshot and its log are
    /// replayed and indexed before the service is returned.
    pub fn with_index(
        config: &Config,
        provider: Arc<dyn EmbeddingProvider>,
        mut index: Box<dyn SimilarityIndex>,
    ) -> Result<Self> {
        config.validate()?;

        let dimensions = config.embedding.dimensions;
        if index.dimensions() != dimensions {
            return Err(KnowledgeError::Config(ConfigError::Invalid(format!(
                "index has {} dimensions, embedding.dimensions is {}",
                index.dimensions(),
                dimensions
            ))));
        }

        let (store, journal) = match &config.storage.snapshot_path {
            Some(path) => {
                let (journal, store) =
                    open_journal(path, dimensions, config.storage.compact_after, index.as_mut())?;
                (store, Some(journal))
            }
            None => (DocumentStore::new(), None),
        };

        info!(
            target: "lore_core::knowledge",
            provider = provider.name(),
            model = %config.embedding.model,
            dimensions,
            documents = store.count(),
            "Knowledge service ready"
        );

        Ok(Self {
            embedder: Embedder::new(provider, &config.embedding),
            corpus: Arc::new(RwLock::new(Corpus { store, index, journal })),
            search: config.search.clone(),
            compaction: Arc::new(Mutex::new(())),
            consistency_violations: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Adds a document to the knowledge base.
    ///
    /// The content is trimmed, embedded, stored, indexed, then logged. If
    /// indexing or logging fails the document is removed again, so a failed
    /// add leaves no trace.
    ///
    /// # Errors
    ///
    /// - [`KnowledgeError::InvalidInput`] for empty content; nothing is embedded
    /// - [`KnowledgeError::EmbeddingUnavailable`] if the provider fails; nothing is stored
    /// - [`KnowledgeError::Storage`] / [`KnowledgeError::Index`] with the operation context
    pub async fn add_document(&self, request: AddDocument) -> Result<AddDocumentResponse> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(KnowledgeError::InvalidInput("content must not be empty".to_string()));
        }
        if let Some(id) = &request.id {
            if id.trim().is_empty() {
                return Err(KnowledgeError::InvalidInput("document_id must not be blank".to_string()));
            }
        }

        let vector = self.embedder.embed(content).await?;
        let document = NewDocument {
            id: request.id,
            title: request.title,
            content: content.to_string(),
            metadata: request.metadata,
            vector,
        };

        let service = self.clone();
        let document_id = detached("add_document", service.commit_add(document)).await?;
        Ok(AddDocumentResponse {
            success: true,
            document_id,
        })
    }

    /// Removes a document and its vector.
    ///
    /// Unknown ids are not an error: the response reports `success: false`
    /// and nothing changes. Deletion is unconditional once called.
    pub async fn delete_document(&self, document_id: &str) -> Result<DeleteDocumentResponse> {
        let service = self.clone();
        let success = detached("delete_document", service.commit_delete(document_id.to_string())).await?;
        Ok(DeleteDocumentResponse { success })
    }

    /// Folds the journal into a fresh snapshot.
    ///
    /// Waits for any compaction already running. Searches and mutations
    /// proceed while the snapshot is written. A no-op for in-memory services.
    pub async fn compact(&self) -> Result<()> {
        let service = self.clone();
        detached("compact", service.run_compaction()).await
    }

    /// Searches the knowledge base.
    ///
    /// `top_k` defaults to `search.default_top_k`. Asking for more results
    /// than there are documents returns them all. Results are ordered by
    /// descending score with ties in insertion order.
    ///
    /// # Errors
    ///
    /// - [`KnowledgeError::InvalidInput`] for an empty query or `top_k == 0`
    /// - [`KnowledgeError::EmbeddingUnavailable`] if the query can't be embedded
    pub async fn search_documents(&self, query: &str, top_k: Option<usize>) -> Result<SearchResponse> {
        let query_text = query.trim();
        if query_text.is_empty() {
            return Err(KnowledgeError::InvalidInput("query must not be empty".to_string()));
        }
        let top_k = self.validate_top_k(top_k.unwrap_or(self.search.default_top_k))?;

        let query_vector = self.embedder.embed(query_text).await?;

        let corpus = self.corpus.read().await;
        let matches = corpus
            .index
            .query(&query_vector, top_k)
            .map_err(|source| KnowledgeError::Index {
                context: OperationContext::new("search_documents"),
                source,
            })?;

        let mut results = Vec::with_capacity(matches.len());
        for hit in matches {
            match corpus.store.get(&hit.id) {
                Some(document) => results.push(SearchResult {
                    content: document.content.clone(),
                    metadata: document.result_metadata(),
                    score: hit.score,
                }),
                None => {
                    self.consistency_violations.fetch_add(1, Ordering::Relaxed);
                    error!(
                        target: "lore_core::knowledge",
                        document_id = %hit.id,
                        "Consistency violation: indexed vector has no document, skipping"
                    );
                }
            }
        }
        drop(corpus);

        debug!(
            target: "lore_core::knowledge",
            top_k,
            results = results.len(),
            "Search complete"
        );
        Ok(SearchResponse {
            query: query.to_string(),
            results,
        })
    }

    /// Returns corpus statistics.
    pub async fn get_stats(&self) -> Stats {
        let corpus = self.corpus.read().await;
        Stats {
            total_vectors: corpus.store.count(),
            total_documents: corpus.store.count(),
            indexed_vectors: corpus.index.len(),
            total_content_bytes: corpus.store.total_content_bytes(),
            dimensions: self.embedder.dimensions(),
            embedding_model: self.embedder.model().to_string(),
            consistency_violations: self.consistency_violations.load(Ordering::Relaxed),
        }
    }

    /// Looks up a single document.
    pub async fn get_document(&self, document_id: &str) -> Option<Document> {
        self.corpus.read().await.store.get(document_id).cloned()
    }

    /// Number of live documents.
    pub async fn count(&self) -> usize {
        self.corpus.read().await.store.count()
    }

    /// Compares the id sets of the document store and the similarity index.
    pub async fn verify_consistency(&self) -> ConsistencyReport {
        self.corpus.read().await.consistency()
    }

    /// Health signal for diagnostics endpoints.
    ///
    /// Degraded whenever the id sets differ or a search has ever hit an
    /// indexed vector without a document.
    pub async fn health(&self) -> HealthReport {
        let corpus = self.corpus.read().await;
        let consistency = corpus.consistency();
        let violations = self.consistency_violations.load(Ordering::Relaxed);

        let status = if consistency.is_consistent() && violations == 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            documents: corpus.store.count(),
            vectors: corpus.index.len(),
            consistency_violations: violations,
            consistency,
        }
    }

    /// Retrieves relevant context from the knowledge base for a chat prompt.
    ///
    /// Searches for `top_k` documents (default `search.context_top_k`) and
    /// formats them as:
    ///
    /// ```text
    ///
    /// Relevant context from your knowledge base:
    ///
    /// [1] <first most relevant document>
    /// [2] <second most relevant document>
    /// ```
    ///
    /// An empty knowledge base returns empty context without embedding the
    /// query.
    pub async fn retrieve_context(&self, query: &str, top_k: Option<usize>) -> Result<RetrievedContext> {
        if self.count().await == 0 {
            debug!(target: "lore_core::knowledge", "Knowledge base is empty, returning empty context");
            return Ok(RetrievedContext::default());
        }

        let top_k = top_k.unwrap_or(self.search.context_top_k);
        let response = self.search_documents(query, Some(top_k)).await?;
        if response.results.is_empty() {
            return Ok(RetrievedContext::default());
        }

        let mut context = String::from("\n\nRelevant context from your knowledge base:\n");
        let mut sources = Vec::with_capacity(response.results.len());
        for (i, result) in response.results.iter().enumerate() {
            context.push_str(&format!("\n[{}] {}\n", i + 1, result.content));
            sources.push(result.title().unwrap_or("Unknown").to_string());
        }

        info!(target: "lore_core::knowledge", results = sources.len(), "Generated context");
        Ok(RetrievedContext { context, sources })
    }

    fn validate_top_k(&self, top_k: usize) -> Result<usize> {
        if top_k == 0 {
            return Err(KnowledgeError::InvalidInput("top_k must be at least 1".to_string()));
        }
        Ok(top_k)
    }

    /// Write section of `add_document`.
    async fn commit_add(self, document: NewDocument) -> Result<String> {
        let requested_id = document.id.clone();

        let mut corpus = self.corpus.write().await;
        let corpus = &mut *corpus;

        let document = corpus.store.prepare(document).map_err(|source| KnowledgeError::Storage {
            context: match requested_id {
                Some(id) => OperationContext::document("add_document", id),
                None => OperationContext::new("add_document"),
            },
            source,
        })?;
        let document_id = document.id.clone();
        let bytes = document.content.len();
        let vector = document.vector.clone();
        let record = corpus
            .journal
            .is_some()
            .then(|| JournalRecord::Add { document: document.clone() });

        corpus.store.restore(document).map_err(|source| KnowledgeError::Storage {
            context: OperationContext::document("add_document", document_id.clone()),
            source,
        })?;

        if let Err(source) = corpus.index.insert(&document_id, &vector) {
            corpus.store.remove(&document_id);
            warn!(
                target: "lore_core::knowledge",
                document_id = %document_id,
                error = %source,
                "Indexing failed, document write rolled back"
            );
            return Err(KnowledgeError::Index {
                context: OperationContext::document("add_document", document_id),
                source,
            });
        }

        if let (Some(journal), Some(record)) = (corpus.journal.as_mut(), record) {
            if let Err(source) = journal.append(&record).await {
                corpus.index.remove(&document_id);
                corpus.store.remove(&document_id);
                error!(
                    target: "lore_core::knowledge",
                    document_id = %document_id,
                    error = %source,
                    "Journal write failed, document rolled back"
                );
                return Err(KnowledgeError::Storage {
                    context: OperationContext::document("add_document", document_id),
                    source,
                });
            }
        }

        self.compact_if_due(corpus).await;

        info!(
            target: "lore_core::knowledge",
            document_id = %document_id,
            bytes,
            "Document added"
        );
        Ok(document_id)
    }

    /// Write section of `delete_document`.
    ///
    /// The delete is logged before anything in memory changes, so a failed
    /// write leaves the corpus exactly as it was.
    async fn commit_delete(self, document_id: String) -> Result<bool> {
        let mut corpus = self.corpus.write().await;
        let corpus = &mut *corpus;

        if !corpus.store.contains(&document_id) {
            debug!(target: "lore_core::knowledge", document_id = %document_id, "Delete of unknown document");
            return Ok(false);
        }

        if let Some(journal) = corpus.journal.as_mut() {
            let record = JournalRecord::Delete { id: document_id.clone() };
            if let Err(source) = journal.append(&record).await {
                error!(
                    target: "lore_core::knowledge",
                    document_id = %document_id,
                    error = %source,
                    "Journal write failed, document kept"
                );
                return Err(KnowledgeError::Storage {
                    context: OperationContext::document("delete_document", document_id),
                    source,
                });
            }
        }

        corpus.store.remove(&document_id);
        if !corpus.index.remove(&document_id) {
            warn!(
                target: "lore_core::knowledge",
                document_id = %document_id,
                "Deleted document had no index entry"
            );
        }

        self.compact_if_due(corpus).await;

        info!(target: "lore_core::knowledge", document_id = %document_id, "Document deleted");
        Ok(true)
    }

    /// Starts a background compaction once the journal has grown enough.
    ///
    /// Skipped while another compaction is running; the next mutation
    /// tries again.
    async fn compact_if_due(&self, corpus: &mut Corpus) {
        let Some(journal) = corpus.journal.as_mut() else {
            return;
        };
        if !journal.compaction_due() {
            return;
        }
        let Ok(permit) = self.compaction.clone().try_lock_owned() else {
            debug!(target: "lore_core::knowledge", "Compaction already running");
            return;
        };

        match journal.rotate(&corpus.store).await {
            Ok(Some(compaction)) => {
                tokio::spawn(async move {
                    let generation = compaction.generation();
                    match compaction.finish().await {
                        Ok(()) => info!(target: "lore_core::knowledge", generation, "Journal compacted"),
                        Err(e) => warn!(
                            target: "lore_core::knowledge",
                            generation,
                            error = %e,
                            "Compaction failed, the log stays authoritative"
                        ),
                    }
                    drop(permit);
                });
            }
            Ok(None) => {}
            Err(e) => warn!(target: "lore_core::knowledge", error = %e, "Could not rotate journal"),
        }
    }

    async fn run_compaction(self) -> Result<()> {
        let _permit = self.compaction.clone().lock_owned().await;

        let compaction = {
            let mut corpus = self.corpus.write().await;
            let corpus = &mut *corpus;
            let Some(journal) = corpus.journal.as_mut() else {
                return Ok(());
            };
            journal.rotate(&corpus.store).await
        };

        let compaction = compaction.map_err(|source| KnowledgeError::Storage {
            context: OperationContext::new("compact"),
            source,
        })?;
        let Some(compaction) = compaction else {
            return Ok(());
        };

        let generation = compaction.generation();
        compaction.finish().await.map_err(|source| KnowledgeError::Storage {
            context: OperationContext::new("compact"),
            source,
        })?;

        info!(target: "lore_core::knowledge", generation, "Journal compacted");
        Ok(())
    }
}

/// Runs `task` to completion even if the caller stops waiting for it.
async fn detached<T, F>(operation: &'static str, task: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(result) => result,
        Err(e) => Err(KnowledgeError::Storage {
            context: OperationContext::new(operation),
            source: StoreError::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, e)),
        }),
    }
}

fn open_journal(
    path: &str,
    dimensions: usize,
    compact_after: usize,
    index: &mut dyn SimilarityIndex,
) -> Result<(Journal, DocumentStore)> {
    let (journal, store) = Journal::open(path, dimensions, compact_after).map_err(|source| {
        KnowledgeError::Storage {
            context: OperationContext::new("open_journal"),
            source,
        }
    })?;

    for document in store.iter() {
        index
            .insert(&document.id, &document.vector)
            .map_err(|source| KnowledgeError::Index {
                context: OperationContext::document("open_journal", document.id.clone()),
                source,
            })?;
    }
    Ok((journal, store))
}
