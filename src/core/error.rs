use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HuggingFace API error: {0}")]
    HuggingFace(#[from] hf_hub::api::sync::ApiError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Cannot read source document {document_id}: {reason}")]
    UnreadableSource { document_id: String, reason: String },

    #[error("Text extraction failed for {document_id}: {reason}")]
    ExtractionFailed { document_id: String, reason: String },

    #[error("Embedding service error: {0}")]
    EmbeddingService(String),

    #[error("Index store error: {0}")]
    IndexStore(String),

    #[error("Manifest is corrupt: {0}")]
    ManifestCorruption(String),

    #[error("{0} is held by another normo-index process")]
    Locked(PathBuf),
}

impl Error {
    /// Permanent per-document failures are recorded in the manifest as
    /// `failed`; everything else leaves the document pending for the next pass.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::UnreadableSource { .. } | Error::ExtractionFailed { .. }
        )
    }

    /// Errors that abort a whole sync pass instead of a single document.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ManifestCorruption(_) | Error::Locked(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
