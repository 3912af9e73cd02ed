// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
}

// Data storage
pub mod storage {
    pub mod database;
    pub mod lock;
    pub mod manifest;
    pub mod vectors;
}

// Document pipeline
pub mod indexing {
    pub mod discovery;
    pub mod extractor;
    pub mod fingerprint;
    pub mod metadata;
}

// Embeddings
pub mod search {
    pub mod embedder;
    pub mod model;
}

// Change detection and sync passes
pub mod sync {
    pub mod diff;
    pub mod orchestrator;
}

// User interfaces
pub mod ui {
    pub mod cli;
    pub mod watch;
}

// Re-export commonly used types
pub use core::config::{Config, EmbeddingProvider, IndexSettings, ManifestBackend};
pub use core::error::{Error, Result};
pub use indexing::discovery::{discover_documents, SourceFile};
pub use indexing::extractor::{Chunk, DocumentExtractor, Extractor, SourceLocation};
pub use indexing::fingerprint::{fingerprint_file, DocumentFingerprint};
pub use indexing::metadata::{parse_document_metadata, DocumentMetadata};
pub use search::embedder::{Embedder, HttpEmbedder};
pub use search::model::EmbeddingModel;
pub use storage::manifest::{EntryStatus, JsonManifest, ManifestEntry, ManifestStore, RedbManifest};
pub use storage::vectors::{IndexedChunk, RedbVectorStore, SearchFilters, SearchHit, VectorIndex};
pub use sync::diff::SyncScope;
pub use sync::orchestrator::{
    DocumentState, DocumentStatus, IndexStatus, Indexer, Query, SearchRequest, SyncReport, SyncRequest,
};
pub use ui::cli::Cli;
pub use ui::watch::FileWatcher;
