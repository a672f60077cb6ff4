//! lore-core - Semantic knowledge store
//!
//! Provides the components behind a knowledge base that a chat assistant
//! retrieves context from:
//! - Embedding provider abstraction (Ollama, offline hashing)
//! - Knowledge service (documents, similarity index, ranked search)
//! - Configuration management
//!
//! ## Primary API
//!
//! Users should interact with lore via [`KnowledgeService`].

// Public modules
pub mod config;
pub mod knowledge;
pub mod provider;

// Public exports
pub use config::{Config, EmbeddingConfig, ProviderConfig, SearchConfig, StorageConfig};
pub use knowledge::{
    AddDocument, AddDocumentResponse, ConsistencyReport, DeleteDocumentResponse, Document,
    HealthReport, HealthStatus, KnowledgeError, KnowledgeService, Metadata, MetadataValue,
    RetrievedContext, SearchResponse, SearchResult, Stats,
};

// Provider exports
pub use provider::{EmbeddingProvider, HashingProvider, OllamaProvider, ProviderError};
