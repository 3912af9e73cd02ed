use clap::{Parser, Subcommand};

/// normo-index - Incremental vector index for a directory of legal documents
#[derive(Parser, Debug)]
#[command(name = "normo-index")]
#[command(about = "Keeps a local vector index in sync with a directory of PDF and text documents", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Custom base directory (default: ~/.normo-index)
    #[arg(long, global = true)]
    pub base_dir: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory and write default settings
    Init {
        /// Directory holding the source documents
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Show indexed, failed and pending document counts
    Status,
    /// List every known document with its state
    List,
    /// Bring the index in line with the source directory
    Sync {
        /// Re-process documents even if they are unchanged
        #[arg(short, long)]
        force: bool,
        /// Only sync these document ids (relative paths)
        #[arg(value_name = "DOC_ID")]
        documents: Vec<String>,
    },
    /// Delete every chunk and manifest entry
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Search the index
    Search {
        query: String,
        /// Maximum number of results to return
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
        /// Only documents of this type (e.g. law, regulation)
        #[arg(long = "type")]
        document_type: Option<String>,
        /// Only documents of this jurisdiction (e.g. federal, vienna)
        #[arg(long)]
        jurisdiction: Option<String>,
        /// Restrict to these document ids
        #[arg(long = "doc")]
        documents: Vec<String>,
        /// Drop results scoring below this
        #[arg(long)]
        min_score: Option<f32>,
    },
    /// Watch the source directory and sync on every change
    Watch {
        /// Quiet period before a burst of changes triggers a sync
        #[arg(long, value_name = "MS", default_value_t = 2000)]
        debounce_ms: u64,
    },
}
