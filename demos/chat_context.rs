use lore::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lore_core=info".parse()?),
        )
        .init();

    let service = KnowledgeService::new(&Config::load_or_default())?;

    let notes = [
        ("Ownership", "Every value in Rust has a single owner; the value is dropped when the owner goes out of scope."),
        ("Borrowing", "References borrow a value without taking ownership; many shared or one mutable at a time."),
        ("Lifetimes", "Lifetimes describe how long references stay valid so the borrow checker can verify them."),
        ("Cargo", "Cargo builds Rust projects, resolves dependencies and runs tests."),
    ];
    for (title, content) in notes {
        service
            .add_document(AddDocument::new(content).with_title(title))
            .await?;
    }

    let question = "Who owns a value and when is it dropped?";
    let retrieved = service.retrieve_context(question, None).await?;

    let prompt = format!("{}{}\n\nQuestion: {}", "You are a helpful Rust tutor.", retrieved.context, question);
    println!("{}", prompt);
    println!("\nSources: {}", retrieved.sources.join(", "));

    Ok(())
}
