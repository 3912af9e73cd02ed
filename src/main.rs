use anyhow::{bail, Context, Result};
use clap::Parser;
use normo_index::ui::cli::{Cli, Commands};
use normo_index::{
    Config, FileWatcher, IndexStatus, Indexer, SearchFilters, SearchRequest, SyncReport, SyncRequest,
    SyncScope,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("normo_index=info")),
        )
        .with_writer(io::stderr)
        .init();

    let base_dir = cli.base_dir.map(PathBuf::from);
    match cli.command {
        Commands::Init { source } => handle_init(base_dir, source),
        Commands::Status => handle_status(base_dir),
        Commands::List => handle_list(base_dir),
        Commands::Sync { force, documents } => handle_sync(base_dir, force, documents),
        Commands::Reset { yes } => handle_reset(base_dir, yes),
        Commands::Search {
            query,
            limit,
            document_type,
            jurisdiction,
            documents,
            min_score,
        } => {
            let filters = SearchFilters {
                document_ids: documents.into_iter().collect(),
                document_type,
                jurisdiction,
                min_score,
            };
            handle_search(base_dir, query, limit, filters)
        }
        Commands::Watch { debounce_ms } => handle_watch(base_dir, Duration::from_millis(debounce_ms)),
    }
}

fn open_indexer(base_dir: Option<PathBuf>) -> Result<Indexer> {
    let config = Config::load(base_dir)?;
    if !config.is_initialized() {
        bail!("normo-index is not initialized. Run 'normo-index init' first.");
    }
    let indexer = Indexer::open(&config)
        .with_context(|| format!("Failed to open index at {}", config.base_dir.display()))?;
    Ok(indexer)
}

fn handle_init(base_dir: Option<PathBuf>, source: Option<String>) -> Result<ExitCode> {
    let mut config = Config::load(base_dir)?;
    if let Some(source) = source {
        config.set_source_dir(Path::new(&source))?;
    }

    if config.is_initialized() {
        config.save_settings()?;
        println!("normo-index is already initialized at: {}", config.base_dir.display());
        println!("Settings written to {}", config.settings_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    config.init()?;
    println!("✓ Created data directory: {}", config.base_dir.display());
    println!("✓ Source documents: {}", config.source_dir().display());
    println!("✓ Settings: {}", config.settings_path.display());
    println!("\nNext steps:");
    println!("  1. Build the index: normo-index sync");
    println!("  2. Or keep it updated: normo-index watch");
    Ok(ExitCode::SUCCESS)
}

fn handle_status(base_dir: Option<PathBuf>) -> Result<ExitCode> {
    let indexer = open_indexer(base_dir)?;
    let status = indexer.status()?;
    print_status(&indexer, &status);
    Ok(ExitCode::SUCCESS)
}

fn print_status(indexer: &Indexer, status: &IndexStatus) {
    println!("Source:     {}", indexer.source_dir().display());
    println!("Model:      {}", status.embedding_model);
    println!("Indexed:    {} documents ({} chunks)", status.documents_indexed, status.chunks_indexed);
    println!("Failed:     {} documents", status.documents_failed);
    if status.unreadable > 0 {
        println!("Unreadable: {} documents", status.unreadable);
    }
    println!(
        "Pending:    {} new, {} changed, {} removed",
        status.pending.added, status.pending.modified, status.pending.removed
    );
}

fn handle_list(base_dir: Option<PathBuf>) -> Result<ExitCode> {
    let indexer = open_indexer(base_dir)?;
    let rows = indexer.list()?;
    if rows.is_empty() {
        println!("No documents found in {}", indexer.source_dir().display());
        return Ok(ExitCode::SUCCESS);
    }

    for row in rows {
        print!("{:<18} {:>5}  {}", row.status.to_string(), row.chunks, row.document_id);
        if let Some(error) = row.error {
            print!("  ({})", error);
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_sync(base_dir: Option<PathBuf>, force: bool, documents: Vec<String>) -> Result<ExitCode> {
    let indexer = open_indexer(base_dir)?;
    let scope = if documents.is_empty() {
        SyncScope::All
    } else {
        SyncScope::documents(documents)
    };

    let report = indexer.sync(&SyncRequest { scope, force })?;
    print_report(&report);
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn print_report(report: &SyncReport) {
    for id in &report.added {
        println!("  + {}", id);
    }
    for id in &report.modified {
        println!("  ~ {}", id);
    }
    for id in &report.removed {
        println!("  - {}", id);
    }
    for failure in &report.failed {
        let outcome = if failure.permanent { "failed" } else { "will retry" };
        println!("  ✗ {} ({}): {}", failure.document_id, outcome, failure.message);
    }
    for id in &report.not_found {
        println!("  ? {} (not found)", id);
    }
    for id in &report.unreadable_indexed {
        println!("  ! {} (unreadable, previous version kept)", id);
    }

    println!(
        "\nSync complete in {} ms: {} added, {} modified, {} removed, {} unchanged",
        report.duration_ms,
        report.added.len(),
        report.modified.len(),
        report.removed.len(),
        report.unchanged + report.touched
    );
    println!(
        "  Chunks written: {}, deleted: {}",
        report.chunks_written, report.chunks_deleted
    );
    if !report.skipped_failed.is_empty() {
        println!(
            "  Skipped {} previously failed documents (use --force to retry)",
            report.skipped_failed.len()
        );
    }
}

fn handle_reset(base_dir: Option<PathBuf>, yes: bool) -> Result<ExitCode> {
    let indexer = open_indexer(base_dir)?;
    if !yes && !confirm("Delete every indexed chunk and manifest entry?")? {
        println!("Aborted.");
        return Ok(ExitCode::SUCCESS);
    }
    indexer.reset()?;
    println!("✓ Index cleared");
    Ok(ExitCode::SUCCESS)
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn handle_search(
    base_dir: Option<PathBuf>,
    query: String,
    limit: usize,
    filters: SearchFilters,
) -> Result<ExitCode> {
    let indexer = open_indexer(base_dir)?;
    let request = SearchRequest {
        filters,
        ..SearchRequest::text(query, limit)
    };
    let hits = indexer.search(&request)?;

    if hits.is_empty() {
        println!("No results found.");
        return Ok(ExitCode::SUCCESS);
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "\n{}. {} (page {}, score {:.3})",
            i + 1,
            hit.metadata.title,
            hit.location.page,
            hit.score
        );
        println!("   Source: {}", hit.document_id);
        let preview: String = hit.text.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_watch(base_dir: Option<PathBuf>, debounce: Duration) -> Result<ExitCode> {
    let indexer = open_indexer(base_dir)?;
    println!("Watching {} (Ctrl+C to stop)", indexer.source_dir().display());
    FileWatcher::new(&indexer)
        .with_debounce(debounce)
        .watch(print_report)?;
    Ok(ExitCode::SUCCESS)
}
