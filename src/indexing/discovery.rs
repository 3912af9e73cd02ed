use crate::core::error::{Error, Result};
use crate::indexing::fingerprint::{fingerprint_file, stat_fingerprint, DocumentFingerprint};
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A discovered source document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Relative path with `/` separators, stable across platforms
    pub document_id: String,
}

/// One readable document in a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub file: SourceFile,
    pub fingerprint: DocumentFingerprint,
}

/// A document that exists but could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableFile {
    pub reason: String,
    /// Size and mtime only; the content hash is empty
    pub fingerprint: DocumentFingerprint,
}

/// Fingerprinted view of the source folder at one point in time
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub documents: BTreeMap<String, SnapshotEntry>,
    pub unreadable: BTreeMap<String, UnreadableFile>,
}

impl Snapshot {
    /// Whether a document exists on disk, readable or not
    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id) || self.unreadable.contains_key(document_id)
    }
}

/// Discover all supported documents below `root`, respecting .gitignore rules
pub fn discover_documents(root: &Path) -> Result<Vec<SourceFile>> {
    if !root.exists() {
        return Err(Error::Config(format!(
            "Directory does not exist: {}",
            root.display()
        )));
    }

    if !root.is_dir() {
        return Err(Error::Config(format!(
            "Path is not a directory: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .build();

    for result in walker {
        match result {
            Ok(entry) => {
                let path = entry.path();
                if path.is_dir() || !is_supported_document(path) {
                    continue;
                }

                let relative = path.strip_prefix(root).map_err(|e| {
                    Error::Config(format!("Failed to get relative path: {}", e))
                })?;

                files.push(SourceFile {
                    path: path.to_path_buf(),
                    document_id: document_id_for(relative),
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to access entry while walking sources");
            }
        }
    }

    files.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok(files)
}

/// Fingerprint every discovered file
pub fn take_snapshot(files: &[SourceFile]) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for file in files {
        match fingerprint_file(&file.document_id, &file.path) {
            Ok(fingerprint) => {
                snapshot.documents.insert(
                    file.document_id.clone(),
                    SnapshotEntry {
                        file: file.clone(),
                        fingerprint,
                    },
                );
            }
            Err(e) => {
                warn!(document = %file.document_id, error = %e, "source document unreadable");
                let reason = match e {
                    Error::UnreadableSource { reason, .. } => reason,
                    other => other.to_string(),
                };
                snapshot.unreadable.insert(
                    file.document_id.clone(),
                    UnreadableFile {
                        reason,
                        fingerprint: stat_fingerprint(&file.document_id, &file.path),
                    },
                );
            }
        }
    }
    snapshot
}

/// Check if a file is a supported source document based on extension
pub fn is_supported_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_lowercase().as_str(), "pdf" | "txt"))
        .unwrap_or(false)
}

fn document_id_for(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
