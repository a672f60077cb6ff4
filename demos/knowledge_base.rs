use lore::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lore_core=debug".parse()?),
        )
        .init();

    let config = Config::load_or_default();
    let service = KnowledgeService::new(&config)?;

    println!("Lore - Knowledge Base Example\n");

    let fox = service
        .add_document(AddDocument::new("The quick brown fox").with_title("Fox"))
        .await?;
    service
        .add_document(
            AddDocument::new("Quantum mechanics and relativity")
                .with_title("Physics")
                .with_metadata("field", "science"),
        )
        .await?;
    println!("Added {} documents\n", service.get_stats().await.total_vectors);

    let response = service.search_documents("fox jumps", Some(2)).await?;
    for result in &response.results {
        println!(
            "{:>5.1}%  {}  {}",
            result.score * 100.0,
            result.title().unwrap_or("Untitled"),
            result.content
        );
    }

    service.delete_document(&fox.document_id).await?;
    println!("\nAfter delete:");
    println!("{}", serde_json::to_string_pretty(&service.get_stats().await)?);
    println!("{}", serde_json::to_string_pretty(&service.health().await)?);

    Ok(())
}
