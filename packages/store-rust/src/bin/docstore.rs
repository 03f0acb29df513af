//! Command-line access to a docstore directory.
//!
//! Logs go to stderr; documents and stats are printed to stdout as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use docstore::{Document, DocumentStore, EntityRef, StoreConfig};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Inspect and edit per-entity JSON documents.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Options file; created with defaults if missing
    #[arg(long, env = "DOCSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Document directory (overrides the options file)
    #[arg(long, env = "DOCSTORE_ROOT")]
    root: Option<PathBuf>,

    /// Cache capacity (overrides the options file)
    #[arg(long)]
    cache_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an entity's document
    Get {
        id: String,
        /// Display name stamped into the document
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Merge `field=value` pairs into an entity's document
    Put {
        id: String,
        #[arg(long, default_value = "")]
        name: String,
        /// Values are parsed as JSON, falling back to a plain string
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Remove fields from an entity's document
    Delete {
        id: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// List every stored key
    Keys,
    /// Print store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let store = DocumentStore::open(config)
        .await
        .context("failed to open document store")?;

    let result = run(&store, args.command).await;
    store.close().await.context("failed to close document store")?;
    result
}

fn load_config(args: &Args) -> anyhow::Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load_or_create(path)
            .with_context(|| format!("failed to load options from {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(root) = &args.root {
        config.root_dir.clone_from(root);
    }
    if let Some(cache_size) = args.cache_size {
        config.cache_size = cache_size;
    }
    debug!(?config, "resolved configuration");
    Ok(config)
}

async fn run(store: &DocumentStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { id, name } => {
            let document = store.get(&EntityRef::new(id, name)).await?;
            print_json(&Value::Object(document))?;
        }
        Command::Put { id, name, fields } => {
            let partial = parse_assignments(&fields)?;
            let document = store.put(&EntityRef::new(id, name), partial).await?;
            print_json(&Value::Object(document))?;
        }
        Command::Delete { id, name, fields } => {
            let removed = store.delete(&EntityRef::new(id, name), &fields).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::Keys => {
            print_json(&serde_json::to_value(store.keys()?)?)?;
        }
        Command::Stats => {
            print_json(&serde_json::to_value(store.stats())?)?;
        }
    }
    Ok(())
}

/// Parses `field=value` arguments into a partial document.
fn parse_assignments(assignments: &[String]) -> anyhow::Result<Document> {
    let mut partial = Document::new();
    for assignment in assignments {
        let Some((field, raw)) = assignment.split_once('=') else {
            bail!("expected field=value, got `{assignment}`");
        };
        if field.is_empty() {
            bail!("empty field name in `{assignment}`");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        partial.insert(field.to_string(), value);
    }
    Ok(partial)
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
