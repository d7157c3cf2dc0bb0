#![allow(missing_docs)]

//! Straylight — autonomous snippet-processing agent.
//!
//! Single Rust binary: captures entries (tasks and notes), extracts
//! structured facts via a text-generation capability, and executes the
//! warranted side effects against permission-gated capability adapters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use straylight::adapters::AdapterRegistry;
use straylight::config::StraylightConfig;
use straylight::coordinator::ProcessingCoordinator;
use straylight::executor::ActionExecutor;
use straylight::extractor::TextExtractor;
use straylight::permission::PermissionGate;
use straylight::providers::http::HttpTextGenerator;
use straylight::store::journal::Journal;
use straylight::store::StateStore;
use straylight::types::{Entry, EntryKind};
use straylight::{logging, types::EntryStatus};

/// Queue depth between the capture feed and the coordinator.
const INBOUND_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "straylight", about = "Turns captured notes into reminders, events, and contacts")]
struct Cli {
    /// Explicit config file (default: ./straylight.toml, then defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the processing daemon over a line-based capture feed on
    /// stdin. Lines prefixed `note:` become notes; everything else is a
    /// task.
    Start,
    /// Process one entry end-to-end and print its resulting metadata.
    Process {
        /// The entry text.
        text: Vec<String>,
        /// Capture as a note instead of a task.
        #[arg(long)]
        note: bool,
    },
    /// List persisted entries and their statuses.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => StraylightConfig::load_from(path)?,
        None => StraylightConfig::load()?,
    };

    match cli.command {
        Command::Start => start(config).await,
        Command::Process { text, note } => process_one(config, text.join(" "), note).await,
        Command::Status => status(config).await,
    }
}

/// Wire the pipeline: every component constructed once and passed down,
/// no process-wide singletons.
async fn build_pipeline(
    config: &StraylightConfig,
) -> Result<(Arc<ProcessingCoordinator>, StateStore)> {
    if let Some(parent) = config.paths.journal_db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let journal = Journal::open(&config.paths.journal_db)
        .await
        .context("failed to open journal")?;
    let store = StateStore::spawn(Some(journal))
        .await
        .context("failed to start state store")?;

    let generator = Arc::new(HttpTextGenerator::new(
        config.provider.endpoint.clone(),
        config.provider.model.clone(),
        config.provider.api_key.clone(),
    ));
    let extractor = TextExtractor::new(
        generator,
        Duration::from_secs(config.pipeline.extractor_timeout_secs),
    );

    let adapters = AdapterRegistry::in_memory();
    let gate = Arc::new(PermissionGate::new(adapters.clone()));
    let executor = Arc::new(ActionExecutor::new(adapters, gate, store.clone()));

    let coordinator = Arc::new(ProcessingCoordinator::new(extractor, executor, store.clone()));
    Ok((coordinator, store))
}

async fn start(config: StraylightConfig) -> Result<()> {
    let _guard = logging::init_production(&config.paths.logs_dir)?;
    info!(model = %config.provider.model, "straylight starting");

    let (coordinator, _store) = build_pipeline(&config).await?;

    // Entries captured before the last shutdown go first.
    if let Err(e) = Arc::clone(&coordinator).recover().await {
        warn!(error = %e, "startup recovery failed");
    }

    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    let runner = tokio::spawn(Arc::clone(&coordinator).run(rx));

    // Capture feed: one entry per stdin line until EOF.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry = match trimmed.strip_prefix("note:") {
            Some(rest) => Entry::new(EntryKind::Note, rest.trim()),
            None => Entry::new(EntryKind::Task, trimmed),
        };
        if tx.send(entry).await.is_err() {
            break;
        }
    }

    drop(tx);
    runner.await.context("coordinator task panicked")?;
    info!("straylight stopped");
    Ok(())
}

async fn process_one(config: StraylightConfig, text: String, note: bool) -> Result<()> {
    logging::init_cli();
    if text.trim().is_empty() {
        anyhow::bail!("no entry text given");
    }

    let (coordinator, store) = build_pipeline(&config).await?;

    let kind = if note { EntryKind::Note } else { EntryKind::Task };
    let entry = Entry::new(kind, text.trim());
    let entry_id = entry.id;
    store.insert_entry(entry).await?;
    coordinator.process_entry(entry_id).await?;

    let (entry, metadata) = store.snapshot(entry_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "id": entry.id,
            "status": entry.status,
            "metadata": metadata,
        }))?
    );
    Ok(())
}

async fn status(config: StraylightConfig) -> Result<()> {
    logging::init_cli();
    let journal = Journal::open(&config.paths.journal_db)
        .await
        .context("failed to open journal")?;

    let entries = journal.load_entries().await?;
    if entries.is_empty() {
        println!("no entries");
        return Ok(());
    }
    for (entry, metadata) in entries {
        let status = match entry.status {
            EntryStatus::Unprocessed => "unprocessed",
            EntryStatus::Processing => "processing",
            EntryStatus::Processed => "processed",
            EntryStatus::Failed => "failed",
        };
        let preview: String = entry.content.chars().take(48).collect();
        println!(
            "{}  {:<11}  {:>2} actions  {}",
            entry.id,
            status,
            metadata.actions.len(),
            preview
        );
    }
    Ok(())
}
