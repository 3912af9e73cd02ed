use crate::indexing::discovery::{Snapshot, SnapshotEntry, UnreadableFile};
use crate::indexing::fingerprint::FingerprintMatch;
use crate::storage::manifest::ManifestEntry;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Which documents a sync pass considers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncScope {
    #[default]
    All,
    Documents(BTreeSet<String>),
}

impl SyncScope {
    pub fn documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SyncScope::Documents(ids.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, document_id: &str) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Documents(ids) => ids.contains(document_id),
        }
    }
}

/// Difference between the filesystem snapshot and the manifest
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<SnapshotEntry>,
    pub modified: Vec<SnapshotEntry>,
    pub removed: Vec<String>,
    /// Same content, new mtime: only the recorded fingerprint is refreshed
    pub touched: Vec<SnapshotEntry>,
    pub unchanged: Vec<String>,
    /// Failed entries whose content has not changed since the failure
    pub failed_unchanged: Vec<String>,
    /// Present on disk but not readable, to be recorded as failed
    pub unreadable: Vec<(String, UnreadableFile)>,
    /// Not readable, but an earlier complete version stays indexed
    pub unreadable_indexed: Vec<String>,
    /// Requested ids that exist neither on disk nor in the manifest
    pub not_found: Vec<String>,
}

/// Pending work, as reported by `status`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

impl ChangeSet {
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            modified: self.modified.len(),
            removed: self.removed.len(),
        }
    }

    /// Whether the pass has anything to write to the index or the manifest
    pub fn has_work(&self) -> bool {
        !(self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.touched.is_empty()
            && self.unreadable.is_empty())
    }
}

/// Classify every in-scope document.
///
/// `force` re-processes in-scope documents whose content did not change.
/// Entries built with a different embedding model count as modified.
pub fn compute_changes(
    snapshot: &Snapshot,
    manifest: &BTreeMap<String, ManifestEntry>,
    scope: &SyncScope,
    force: bool,
    embedding_model: &str,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (document_id, current) in &snapshot.documents {
        if !scope.includes(document_id) {
            continue;
        }

        let Some(entry) = manifest.get(document_id) else {
            changes.added.push(current.clone());
            continue;
        };

        let comparison = current.fingerprint.compare(&entry.fingerprint);
        let stale_model = entry.is_complete() && entry.embedding_model != embedding_model;

        if force || stale_model || comparison == FingerprintMatch::Changed {
            changes.modified.push(current.clone());
        } else if !entry.is_complete() {
            changes.failed_unchanged.push(document_id.clone());
        } else if comparison == FingerprintMatch::Touched {
            changes.touched.push(current.clone());
        } else {
            changes.unchanged.push(document_id.clone());
        }
    }

    for (document_id, unreadable) in &snapshot.unreadable {
        if !scope.includes(document_id) {
            continue;
        }
        match manifest.get(document_id) {
            Some(entry) if entry.is_complete() => {
                changes.unreadable_indexed.push(document_id.clone());
            }
            Some(entry)
                if !force
                    && entry.fingerprint.byte_size == unreadable.fingerprint.byte_size
                    && entry.fingerprint.modified_time == unreadable.fingerprint.modified_time =>
            {
                changes.failed_unchanged.push(document_id.clone());
            }
            _ => changes.unreadable.push((document_id.clone(), unreadable.clone())),
        }
    }

    for document_id in manifest.keys() {
        if scope.includes(document_id) && !snapshot.contains(document_id) {
            changes.removed.push(document_id.clone());
        }
    }

    if let SyncScope::Documents(ids) = scope {
        for id in ids {
            if !snapshot.contains(id) && !manifest.contains_key(id) {
                changes.not_found.push(id.clone());
            }
        }
    }

    changes
}
