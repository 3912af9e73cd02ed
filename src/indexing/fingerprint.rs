use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Identity snapshot of a source document used for change detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub byte_size: u64,
    /// Unix seconds
    pub modified_time: u64,
    /// Hex SHA-256 of the content
    pub content_hash: String,
}

/// How a current fingerprint relates to the one recorded at index time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintMatch {
    Same,
    /// Same bytes, different mtime
    Touched,
    Changed,
}

impl DocumentFingerprint {
    /// Compare against a previously recorded fingerprint.
    ///
    /// The hash decides: size is only a cheap pre-filter and mtime never
    /// causes re-processing on its own.
    pub fn compare(&self, recorded: &DocumentFingerprint) -> FingerprintMatch {
        if self.byte_size != recorded.byte_size || self.content_hash != recorded.content_hash {
            return FingerprintMatch::Changed;
        }
        if self.modified_time != recorded.modified_time {
            return FingerprintMatch::Touched;
        }
        FingerprintMatch::Same
    }

    /// Short hash prefix used to namespace chunk ids per content version
    pub fn short_hash(&self) -> &str {
        let end = self.content_hash.len().min(12);
        &self.content_hash[..end]
    }
}

/// Fingerprint a file on disk
pub fn fingerprint_file(document_id: &str, path: &Path) -> Result<DocumentFingerprint> {
    let unreadable = |e: std::io::Error| Error::UnreadableSource {
        document_id: document_id.to_string(),
        reason: e.to_string(),
    };

    let metadata = std::fs::metadata(path).map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(Error::UnreadableSource {
            document_id: document_id.to_string(),
            reason: "not a regular file".to_string(),
        });
    }
    let modified_time = modified_secs(&metadata);

    let file = std::fs::File::open(path).map_err(unreadable)?;
    let (content_hash, byte_size) = hash_reader(file).map_err(unreadable)?;

    Ok(DocumentFingerprint {
        document_id: document_id.to_string(),
        byte_size,
        modified_time,
        content_hash,
    })
}

/// Size and mtime of a file whose content cannot be hashed.
///
/// Lets a failure be recorded against the file as it currently is, so it is
/// retried only once the file changes. Missing metadata reads as zero.
pub fn stat_fingerprint(document_id: &str, path: &Path) -> DocumentFingerprint {
    let (byte_size, modified_time) = match std::fs::metadata(path) {
        Ok(metadata) => (metadata.len(), modified_secs(&metadata)),
        Err(_) => (0, 0),
    };
    DocumentFingerprint {
        document_id: document_id.to_string(),
        byte_size,
        modified_time,
        content_hash: String::new(),
    }
}

fn modified_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Calculate SHA256 of a byte stream, returning the hex digest and length
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        total += bytes_read as u64;
        hasher.update(&buffer[..bytes_read]);
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}
