//! lore - Semantic knowledge store
//!
//! This is the convenience wrapper crate that re-exports the lore
//! components.
//!
//! # Quick Start
//!
//! ```toml
//! [dependencies]
//! lore = "0.1"
//! ```
//!
//! ```no_run
//! use lore::prelude::*;
//!
//! # async fn example() -> Result<(), KnowledgeError> {
//! let service = KnowledgeService::new(&Config::load_or_default())?;
//! service.add_document(AddDocument::new("Rust has no garbage collector")).await?;
//!
//! let context = service.retrieve_context("memory management in rust", None).await?;
//! println!("{}", context.context);
//! # Ok(())
//! # }
//! ```

// Re-export core
pub use lore_core::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use lore_core::{
        AddDocument, Config, KnowledgeError, KnowledgeService, RetrievedContext, SearchResponse,
        SearchResult,
    };
    pub use lore_core::provider::{EmbeddingProvider, HashingProvider, OllamaProvider};
}
