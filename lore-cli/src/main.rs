use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use lore_core::{AddDocument, Config, HealthStatus, KnowledgeService, MetadataValue, ProviderConfig};
use std::path::{Path, PathBuf};

const DEFAULT_SNAPSHOT_PATH: &str = "./data/lore.json";

#[derive(Parser)]
#[command(name = "lore")]
#[command(about = "CLI for the lore semantic knowledge store", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(short, long, global = true, default_value = "lore.yaml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Add a document to the knowledge base")]
    Add {
        #[arg(help = "Document text")]
        content: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long = "meta", value_name = "KEY=VALUE", help = "Metadata entry, repeatable")]
        metadata: Vec<String>,
    },

    #[command(about = "Delete a document by id")]
    Delete {
        document_id: String,
    },

    #[command(about = "Search the knowledge base")]
    Search {
        query: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    #[command(about = "Show knowledge base statistics")]
    Stats,

    #[command(about = "Check that documents and vectors agree")]
    Health,

    #[command(about = "Configuration commands")]
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    #[command(about = "Show current configuration")]
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lore_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Add { content, title, metadata } => {
            add(&open(&config)?, content, title, &metadata, cli.json).await
        }
        Commands::Delete { document_id } => delete(&open(&config)?, &document_id, cli.json).await,
        Commands::Search { query, top_k } => search(&open(&config)?, &query, top_k, cli.json).await,
        Commands::Stats => stats(&open(&config)?, cli.json).await,
        Commands::Health => health(&open(&config)?, cli.json).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_config(&config),
        },
    }
}

fn open(config: &Config) -> Result<KnowledgeService> {
    KnowledgeService::new(config).context("Failed to open knowledge base")
}

/// Loads the config file if present and fills in the default snapshot path.
fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        Config::default()
    };

    if config.storage.snapshot_path.is_none() {
        config.storage.snapshot_path = Some(DEFAULT_SNAPSHOT_PATH.to_string());
    }
    Ok(config)
}

/// Parses `key=value`, reading booleans, integers and numbers as such.
fn parse_metadata(entry: &str) -> Result<(String, MetadataValue)> {
    let (key, value) = entry
        .split_once('=')
        .with_context(|| format!("Metadata must be KEY=VALUE, got '{}'", entry))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Metadata key must not be empty in '{}'", entry);
    }

    let value = if let Ok(b) = value.parse::<bool>() {
        MetadataValue::Boolean(b)
    } else if let Ok(n) = value.parse::<i64>() {
        MetadataValue::Integer(n)
    } else {
        match value.parse::<f64>() {
            Ok(n) if n.is_finite() => MetadataValue::Number(n),
            _ => MetadataValue::String(value.to_string()),
        }
    };
    Ok((key.to_string(), value))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

async fn add(
    service: &KnowledgeService,
    content: String,
    title: Option<String>,
    metadata: &[String],
    json: bool,
) -> Result<()> {
    let mut request = AddDocument::new(content);
    request.title = title;
    for entry in metadata {
        let (key, value) = parse_metadata(entry)?;
        request.metadata.insert(key, value);
    }

    let response = service.add_document(request).await.context("Failed to add document")?;
    if json {
        return print_json(&response);
    }

    println!("{} Added document {}", "✓".green().bold(), response.document_id.cyan());
    Ok(())
}

async fn delete(service: &KnowledgeService, document_id: &str, json: bool) -> Result<()> {
    let response = service
        .delete_document(document_id)
        .await
        .context("Failed to delete document")?;
    if json {
        return print_json(&response);
    }

    if response.success {
        println!("{} Deleted document {}", "✓".green().bold(), document_id.cyan());
    } else {
        println!("{} No document with id {}", "!".yellow().bold(), document_id.cyan());
    }
    Ok(())
}

async fn search(service: &KnowledgeService, query: &str, top_k: Option<usize>, json: bool) -> Result<()> {
    let response = service
        .search_documents(query, top_k)
        .await
        .context("Search failed")?;
    if json {
        return print_json(&response);
    }

    if response.results.is_empty() {
        println!("{}", "No documents found. Add one with 'lore add <text>'".yellow());
        return Ok(());
    }

    println!("{} {}", "Results for".bold().green(), query.cyan());
    println!();
    for (i, result) in response.results.iter().enumerate() {
        println!(
            "  {} {} {}",
            format!("{}.", i + 1).bold(),
            result.title().unwrap_or("Untitled").bold(),
            format!("({:.1}%)", result.score * 100.0).dimmed()
        );
        if let Some(id) = result.document_id() {
            println!("     id: {}", id);
        }
        println!("     {}", preview(&result.content, 120));
    }
    Ok(())
}

async fn stats(service: &KnowledgeService, json: bool) -> Result<()> {
    let stats = service.get_stats().await;
    if json {
        return print_json(&stats);
    }

    println!("{}", "Knowledge Base:".bold().green());
    println!();
    println!("  Documents:       {}", stats.total_documents.to_string().cyan());
    println!("  Vectors:         {}", stats.total_vectors);
    if stats.indexed_vectors != stats.total_vectors {
        println!("  Indexed:         {}", stats.indexed_vectors.to_string().red());
    }
    println!("  Content Bytes:   {}", stats.total_content_bytes);
    println!("  Embedding Model: {}", stats.embedding_model.cyan());
    println!("  Dimensions:      {}", stats.dimensions);
    Ok(())
}

async fn health(service: &KnowledgeService, json: bool) -> Result<()> {
    let report = service.health().await;
    if json {
        return print_json(&report);
    }

    let status = match report.status {
        HealthStatus::Healthy => "healthy".green().bold(),
        HealthStatus::Degraded => "degraded".red().bold(),
    };
    println!("{}: {}", "Status".bold(), status);
    println!("  Documents: {}", report.documents);
    println!("  Vectors:   {}", report.vectors);

    for id in &report.consistency.missing_vectors {
        println!("  {} document {} has no vector", "•".red(), id);
    }
    for id in &report.consistency.orphaned_vectors {
        println!("  {} vector {} has no document", "•".red(), id);
    }
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!("{}", "Current Configuration:".bold().green());
    println!();
    println!("{}", "Embedding:".bold());
    match &config.embedding.provider {
        ProviderConfig::Ollama { base_url } => {
            println!("  Provider:       {}", "ollama".cyan());
            println!("  Base URL:       {}", base_url);
        }
        ProviderConfig::Hashing => println!("  Provider:       {}", "hashing".cyan()),
    }
    println!("  Model:          {}", config.embedding.model.cyan());
    println!("  Dimensions:     {}", config.embedding.dimensions);
    println!("  Timeout:        {} ms", config.embedding.timeout_ms);
    println!("  Cache Capacity: {}", config.embedding.cache_capacity);
    println!();
    println!("{}", "Search:".bold());
    println!("  Default Top K:  {}", config.search.default_top_k);
    println!("  Context Top K:  {}", config.search.context_top_k);
    println!();
    println!("{}", "Storage:".bold());
    println!(
        "  Snapshot:       {}",
        config.storage.snapshot_path.as_deref().unwrap_or("(in memory)")
    );
    println!();
    println!("{}", "As YAML:".dimmed());
    print!("{}", serde_yaml::to_string(config).context("Failed to serialize config")?);

    Ok(())
}

fn preview(content: &str, max_chars: usize) -> String {
    let single_line = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let truncated: String = single_line.chars().take(max_chars).collect();
    format!("{}…", truncated)
}
