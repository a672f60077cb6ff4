use async_trait::async_trait;
use lore_core::knowledge::embedder::EmbedderError;
use lore_core::knowledge::index::{FlatIndex, IndexError, IndexMatch, SimilarityIndex};
use lore_core::knowledge::vector::Vector;
use lore_core::provider::{EmbeddingProvider, HashingProvider, ProviderError};
use lore_core::{AddDocument, Config, HealthStatus, KnowledgeError, KnowledgeService, MetadataValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    Config::default()
}

fn persistent_config(path: &Path) -> Config {
    config().with_snapshot_path(path.to_string_lossy())
}

fn log_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".log");
    name.into()
}

async fn ranked_ids(service: &KnowledgeService, query: &str) -> Vec<String> {
    service
        .search_documents(query, Some(usize::MAX))
        .await
        .unwrap()
        .results
        .iter()
        .filter_map(|r| r.document_id().map(str::to_string))
        .collect()
}

fn service() -> KnowledgeService {
    let config = config();
    let provider = Arc::new(HashingProvider::new(config.embedding.dimensions));
    KnowledgeService::with_provider(&config, provider).unwrap()
}

/// Provider that can be switched off mid-test.
struct FlakyProvider {
    inner: HashingProvider,
    down: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn embed(&self, text: &str, model: &str) -> lore_core::provider::Result<Vec<f32>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ProviderError::Api("503 Service Unavailable".to_string()));
        }
        self.inner.embed(text, model).await
    }
}

struct FixedProvider(Vec<f32>);

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn embed(&self, _text: &str, _model: &str) -> lore_core::provider::Result<Vec<f32>> {
        Ok(self.0.clone())
    }
}

struct HangingProvider;

#[async_trait]
impl EmbeddingProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn embed(&self, _text: &str, _model: &str) -> lore_core::provider::Result<Vec<f32>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

/// Index whose inserts always fail.
struct RejectingIndex(FlatIndex);

impl SimilarityIndex for RejectingIndex {
    fn insert(&mut self, _id: &str, _vector: &Vector) -> Result<(), IndexError> {
        Err(IndexError::Other("index is read-only".to_string()))
    }

    fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    fn query(&self, query: &Vector, top_k: usize) -> Result<Vec<IndexMatch>, IndexError> {
        self.0.query(query, top_k)
    }

    fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn ids(&self) -> Vec<String> {
        self.0.ids()
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }
}

/// Index that also reports an id no document was ever stored under.
struct PhantomIndex(FlatIndex);

impl SimilarityIndex for PhantomIndex {
    fn insert(&mut self, id: &str, vector: &Vector) -> Result<(), IndexError> {
        self.0.insert(id, vector)
    }

    fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    fn query(&self, query: &Vector, top_k: usize) -> Result<Vec<IndexMatch>, IndexError> {
        let mut matches = vec![IndexMatch {
            id: "phantom".to_string(),
            score: 1.0,
        }];
        matches.extend(self.0.query(query, top_k)?);
        matches.truncate(top_k);
        Ok(matches)
    }

    fn contains(&self, id: &str) -> bool {
        id == "phantom" || self.0.contains(id)
    }

    fn len(&self) -> usize {
        self.0.len() + 1
    }

    fn ids(&self) -> Vec<String> {
        let mut ids = self.0.ids();
        ids.push("phantom".to_string());
        ids
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }
}

#[tokio::test]
async fn test_fox_ranks_above_physics() {
    let service = service();
    let fox = service
        .add_document(AddDocument::new("The quick brown fox"))
        .await
        .unwrap();
    let physics = service
        .add_document(AddDocument::new("Quantum mechanics and relativity"))
        .await
        .unwrap();
    assert!(fox.success);
    assert_ne!(fox.document_id, physics.document_id);

    let response = service.search_documents("fox jumps", Some(2)).await.unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].document_id(), Some(fox.document_id.as_str()));
    assert_eq!(response.results[0].content, "The quick brown fox");
    assert!(response.results[0].score > response.results[1].score);
    for result in &response.results {
        assert!((0.0..=1.0).contains(&result.score));
    }

    let top = service.search_documents("fox jumps", Some(1)).await.unwrap();
    assert_eq!(top.results.len(), 1);
    assert_eq!(top.results[0].document_id(), Some(fox.document_id.as_str()));
}

#[tokio::test]
async fn test_search_returns_min_of_k_and_count() {
    let service = service();
    for content in ["alpha", "beta", "gamma"] {
        service.add_document(AddDocument::new(content)).await.unwrap();
    }

    let response = service.search_documents("alpha", Some(1000)).await.unwrap();
    assert_eq!(response.results.len(), 3);
    assert!(response.results.windows(2).all(|w| w[0].score >= w[1].score));

    let everything = service.search_documents("alpha", Some(usize::MAX)).await.unwrap();
    assert_eq!(everything.results.len(), 3);
    assert_eq!(everything.results, response.results);
}

#[tokio::test]
async fn test_search_on_empty_store() {
    let service = service();
    let response = service.search_documents("anything", Some(10)).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_identical_content_scores_one() {
    let service = service();
    service
        .add_document(AddDocument::new("Ownership and borrowing"))
        .await
        .unwrap();

    let response = service
        .search_documents("Ownership and borrowing", Some(1))
        .await
        .unwrap();
    assert!((response.results[0].score - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn test_result_metadata() {
    let service = service();
    let titled = service
        .add_document(
            AddDocument::new("Borrow checker rules")
                .with_title("Borrowing")
                .with_metadata("source", "book")
                .with_metadata("document_id", "spoofed"),
        )
        .await
        .unwrap();
    let untitled = service
        .add_document(AddDocument::new("Lifetimes annotate references"))
        .await
        .unwrap();

    let response = service.search_documents("borrow checker", Some(2)).await.unwrap();
    let first = &response.results[0];
    assert_eq!(first.document_id(), Some(titled.document_id.as_str()));
    assert_eq!(first.title(), Some("Borrowing"));
    assert_eq!(first.metadata["source"], MetadataValue::from("book"));

    let second = &response.results[1];
    let expected_title = format!("Document {}", &untitled.document_id[..8]);
    assert_eq!(second.title(), Some(expected_title.as_str()));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let service = service();
    let added = service
        .add_document(AddDocument::new("short lived"))
        .await
        .unwrap();
    assert_eq!(service.get_stats().await.total_vectors, 1);

    assert!(service.delete_document(&added.document_id).await.unwrap().success);
    assert!(!service.delete_document(&added.document_id).await.unwrap().success);
    assert!(!service.delete_document("never-existed").await.unwrap().success);
    assert!(!service.delete_document("").await.unwrap().success);

    assert_eq!(service.get_stats().await.total_vectors, 0);
    assert!(service.get_document(&added.document_id).await.is_none());
    let response = service.search_documents("short lived", Some(5)).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_stats_track_adds_and_deletes() {
    let service = service();
    let mut ids = Vec::new();
    for i in 0..4 {
        let added = service
            .add_document(AddDocument::new(format!("document {}", i)))
            .await
            .unwrap();
        ids.push(added.document_id);
    }
    service.delete_document(&ids[0]).await.unwrap();
    service.delete_document(&ids[0]).await.unwrap();

    let stats = service.get_stats().await;
    assert_eq!(stats.total_vectors, 3);
    assert_eq!(stats.total_documents, 3);
    assert_eq!(stats.indexed_vectors, 3);
    assert_eq!(stats.dimensions, 384);
    assert_eq!(stats.embedding_model, "all-minilm");
    assert_eq!(stats.consistency_violations, 0);
}

#[tokio::test]
async fn test_invalid_input() {
    let service = service();

    for content in ["", "   \n\t"] {
        let err = service.add_document(AddDocument::new(content)).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidInput(_)));
        assert!(err.is_client_error());
    }
    assert!(matches!(
        service.search_documents("  ", None).await,
        Err(KnowledgeError::InvalidInput(_))
    ));
    assert_eq!(service.count().await, 0);
}

#[tokio::test]
async fn test_provider_failure_leaves_store_untouched() {
    let config = config();
    let provider = Arc::new(FlakyProvider {
        inner: HashingProvider::new(config.embedding.dimensions),
        down: AtomicBool::new(false),
    });
    let service = KnowledgeService::with_provider(&config, provider.clone()).unwrap();
    service.add_document(AddDocument::new("survives")).await.unwrap();

    provider.down.store(true, Ordering::SeqCst);
    let err = service
        .add_document(AddDocument::new("never stored"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KnowledgeError::EmbeddingUnavailable(EmbedderError::Provider(_))
    ));
    assert!(err.is_retryable());
    assert_eq!(service.count().await, 1);

    // Cached query embeddings still work while the provider is down.
    assert!(service.search_documents("survives", None).await.is_ok());
    assert!(matches!(
        service.search_documents("uncached query", None).await,
        Err(KnowledgeError::EmbeddingUnavailable(_))
    ));
}

#[tokio::test]
async fn test_malformed_embedding_is_rejected() {
    let config = config();
    let service =
        KnowledgeService::with_provider(&config, Arc::new(FixedProvider(vec![0.5; 3]))).unwrap();

    let err = service.add_document(AddDocument::new("text")).await.unwrap_err();
    assert!(matches!(
        err,
        KnowledgeError::EmbeddingUnavailable(EmbedderError::Malformed(_))
    ));
    assert_eq!(service.count().await, 0);
}

#[tokio::test]
async fn test_embedding_timeout() {
    let mut config = config();
    config.embedding.timeout_ms = 20;
    let service = KnowledgeService::with_provider(&config, Arc::new(HangingProvider)).unwrap();

    let err = service.add_document(AddDocument::new("text")).await.unwrap_err();
    assert!(matches!(
        err,
        KnowledgeError::EmbeddingUnavailable(EmbedderError::Timeout(_))
    ));
    assert_eq!(service.count().await, 0);
}

#[tokio::test]
async fn test_index_failure_rolls_back_add() {
    let config = config();
    let provider = Arc::new(HashingProvider::new(config.embedding.dimensions));
    let index = Box::new(RejectingIndex(FlatIndex::new(config.embedding.dimensions)));
    let service = KnowledgeService::with_index(&config, provider, index).unwrap();

    let err = service.add_document(AddDocument::new("doomed")).await.unwrap_err();
    match err {
        KnowledgeError::Index { context, source } => {
            assert_eq!(context.operation, "add_document");
            assert!(context.document_id.is_some());
            assert_eq!(source, IndexError::Other("index is read-only".to_string()));
        }
        other => panic!("expected index error, got {other:?}"),
    }

    assert_eq!(service.get_stats().await.total_vectors, 0);
    assert_eq!(service.get_stats().await.total_content_bytes, 0);
    assert!(service.verify_consistency().await.is_consistent());
}

#[tokio::test]
async fn test_orphaned_vector_is_skipped_and_reported() {
    let config = config();
    let provider = Arc::new(HashingProvider::new(config.embedding.dimensions));
    let index = Box::new(PhantomIndex(FlatIndex::new(config.embedding.dimensions)));
    let service = KnowledgeService::with_index(&config, provider, index).unwrap();

    let added = service.add_document(AddDocument::new("real")).await.unwrap();
    let response = service.search_documents("real", Some(2)).await.unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].document_id(), Some(added.document_id.as_str()));
    let stats = service.get_stats().await;
    assert_eq!(stats.consistency_violations, 1);
    assert_eq!(stats.total_vectors, 1);
    assert_eq!(stats.total_documents, 1);
    assert_eq!(stats.indexed_vectors, 2);

    let health = service.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.consistency.orphaned_vectors, vec!["phantom".to_string()]);
    assert!(health.consistency.missing_vectors.is_empty());
}

#[tokio::test]
async fn test_health_of_consistent_store() {
    let service = service();
    service.add_document(AddDocument::new("one")).await.unwrap();
    service.add_document(AddDocument::new("two")).await.unwrap();

    let health = service.health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.documents, 2);
    assert_eq!(health.vectors, 2);
    assert!(health.consistency.is_consistent());
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("lore.json");
    let config = persistent_config(&path);

    let (kept, gone) = {
        let service = KnowledgeService::new(&config).unwrap();
        let kept = service
            .add_document(AddDocument::new("The quick brown fox").with_title("Fox"))
            .await
            .unwrap();
        let gone = service
            .add_document(AddDocument::new("Quantum mechanics and relativity"))
            .await
            .unwrap();
        service.delete_document(&gone.document_id).await.unwrap();
        (kept.document_id, gone.document_id)
    };
    assert!(log_path(&path).exists());

    let reopened = KnowledgeService::new(&config).unwrap();
    assert_eq!(reopened.count().await, 1);
    assert!(reopened.get_document(&gone).await.is_none());

    let document = reopened.get_document(&kept).await.unwrap();
    assert_eq!(document.title.as_deref(), Some("Fox"));

    let response = reopened.search_documents("fox", Some(5)).await.unwrap();
    assert_eq!(response.results[0].document_id(), Some(kept.as_str()));
    assert!(reopened.verify_consistency().await.is_consistent());
}

#[tokio::test]
async fn test_snapshot_with_wrong_dimensions_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lore.json");
    let config = persistent_config(&path);

    let service = KnowledgeService::new(&config).unwrap();
    service.add_document(AddDocument::new("stored")).await.unwrap();

    let mut smaller = config.clone();
    smaller.embedding.dimensions = 64;
    let result = KnowledgeService::new(&smaller);
    assert!(matches!(result, Err(KnowledgeError::Storage { .. })));
}

#[tokio::test]
async fn test_failed_journal_write_rolls_back_add() {
    let dir = tempfile::tempdir().unwrap();
    // The journal's parent directory is a regular file, so every write fails.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let config = config().with_snapshot_path(blocker.join("lore.json").to_string_lossy());

    let service = KnowledgeService::new(&config).unwrap();
    let err = service.add_document(AddDocument::new("unsaved")).await.unwrap_err();
    match err {
        KnowledgeError::Storage { context, .. } => assert_eq!(context.operation, "add_document"),
        other => panic!("expected storage error, got {other:?}"),
    }
    assert_eq!(service.count().await, 0);
    assert!(service.verify_consistency().await.is_consistent());
}

#[tokio::test]
async fn test_failed_delete_keeps_document_and_rank() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lore.json");
    let service = KnowledgeService::new(&persistent_config(&path)).unwrap();

    let a = service.add_document(AddDocument::new("twin")).await.unwrap().document_id;
    let b = service.add_document(AddDocument::new("twin")).await.unwrap().document_id;
    assert_eq!(ranked_ids(&service, "twin").await, vec![a.clone(), b.clone()]);

    // A directory where the log should be makes every append fail
    let log = log_path(&path);
    std::fs::remove_file(&log).unwrap();
    std::fs::create_dir(&log).unwrap();

    match service.delete_document(&a).await.unwrap_err() {
        KnowledgeError::Storage { context, .. } => {
            assert_eq!(context.operation, "delete_document");
            assert_eq!(context.document_id.as_deref(), Some(a.as_str()));
        }
        other => panic!("expected storage error, got {other:?}"),
    }

    assert_eq!(ranked_ids(&service, "twin").await, vec![a.clone(), b.clone()]);
    assert!(service.get_document(&a).await.is_some());
    assert_eq!(service.health().await.status, HealthStatus::Healthy);

    assert!(service.add_document(AddDocument::new("twin")).await.is_err());
    assert_eq!(ranked_ids(&service, "twin").await, vec![a, b]);
}

#[tokio::test]
async fn test_mutations_append_to_log_without_rewriting_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lore.json");
    let service = KnowledgeService::new(&persistent_config(&path)).unwrap();

    let first = service.add_document(AddDocument::new("first")).await.unwrap();
    service.add_document(AddDocument::new("second")).await.unwrap();
    service.delete_document(&first.document_id).await.unwrap();

    assert!(!path.exists());
    let log = std::fs::read_to_string(log_path(&path)).unwrap();
    // Header plus one line per mutation
    assert_eq!(log.lines().count(), 4);

    service.compact().await.unwrap();
    assert!(path.exists());
    assert!(!log_path(&path).exists());

    let snapshot_len = std::fs::metadata(&path).unwrap().len();
    service.add_document(AddDocument::new("third")).await.unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), snapshot_len);
    assert_eq!(std::fs::read_to_string(log_path(&path)).unwrap().lines().count(), 2);

    let reopened = KnowledgeService::new(&persistent_config(&path)).unwrap();
    assert_eq!(reopened.count().await, 2);
    assert!(reopened.get_document(&first.document_id).await.is_none());
}

#[tokio::test]
async fn test_automatic_compaction_keeps_rank_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lore.json");
    let mut config = persistent_config(&path);
    config.storage.compact_after = 4;

    let before = {
        let service = KnowledgeService::new(&config).unwrap();
        for _ in 0..10 {
            service.add_document(AddDocument::new("twin")).await.unwrap();
        }
        let removed = ranked_ids(&service, "twin").await[3].clone();
        service.delete_document(&removed).await.unwrap();

        // Waits for any background compaction, then folds the rest
        service.compact().await.unwrap();
        ranked_ids(&service, "twin").await
    };
    assert_eq!(before.len(), 9);
    assert!(path.exists());

    let reopened = KnowledgeService::new(&config).unwrap();
    assert_eq!(ranked_ids(&reopened, "twin").await, before);
    assert!(reopened.verify_consistency().await.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_searches_proceed_during_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lore.json");
    let mut config = persistent_config(&path);
    config.storage.compact_after = 0;

    let service = KnowledgeService::new(&config).unwrap();
    for i in 0..300 {
        service
            .add_document(AddDocument::new(format!("entry {} of the archive", i)))
            .await
            .unwrap();
    }

    let compacting = {
        let service = service.clone();
        tokio::spawn(async move { service.compact().await })
    };

    let mut searches = 0;
    loop {
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            service.search_documents("archive entry", Some(3)),
        )
        .await
        .expect("search stalled during compaction")
        .unwrap();
        assert_eq!(response.results.len(), 3);
        searches += 1;
        if compacting.is_finished() {
            break;
        }
    }
    compacting.await.unwrap().unwrap();
    assert!(searches > 0);

    let added = service.add_document(AddDocument::new("after compaction")).await.unwrap();
    let reopened = KnowledgeService::new(&config).unwrap();
    assert_eq!(reopened.count().await, 301);
    assert!(reopened.get_document(&added.document_id).await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutations_stay_consistent() {
    let service = service();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let mut kept = 0;
            for i in 0..20 {
                let added = service
                    .add_document(AddDocument::new(format!("worker {} item {}", worker, i)))
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    assert!(service.delete_document(&added.document_id).await.unwrap().success);
                } else {
                    kept += 1;
                }
                service.search_documents("item", Some(5)).await.unwrap();
            }
            kept
        }));
    }

    let mut expected = 0;
    for handle in handles {
        expected += handle.await.unwrap();
    }

    assert_eq!(service.count().await, expected);
    let health = service.health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.documents, health.vectors);
    assert_eq!(health.consistency_violations, 0);
}

#[tokio::test]
async fn test_dropped_add_still_commits_whole() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lore.json");
    let service = KnowledgeService::new(&persistent_config(&path)).unwrap();

    // Gives up after the first poll, once the write section has been handed off
    let _ = tokio::time::timeout(
        Duration::ZERO,
        service.add_document(AddDocument::new("abandoned by its caller")),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.count().await, 1);
    assert!(service.verify_consistency().await.is_consistent());
    let reopened = KnowledgeService::new(&persistent_config(&path)).unwrap();
    assert_eq!(reopened.count().await, 1);
}

#[tokio::test]
async fn test_retrieve_context_uses_context_top_k() {
    let service = service();
    for i in 0..5 {
        service
            .add_document(AddDocument::new(format!("fact {} about rust", i)).with_title(format!("Fact {}", i)))
            .await
            .unwrap();
    }

    let retrieved = service.retrieve_context("rust", None).await.unwrap();
    assert_eq!(retrieved.sources.len(), 3);
    assert!(retrieved.context.contains("[3] "));
    assert!(!retrieved.context.contains("[4] "));
}
