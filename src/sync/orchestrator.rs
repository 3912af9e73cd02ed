use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::{discover_documents, take_snapshot, Snapshot, SnapshotEntry};
use crate::indexing::extractor::{DocumentExtractor, Extractor};
use crate::indexing::fingerprint::FingerprintMatch;
use crate::indexing::metadata::parse_document_metadata;
use crate::search::embedder::{build_embedder, check_batch, Embedder};
use crate::storage::lock::SyncLock;
use crate::storage::manifest::{open_manifest, ManifestEntry, ManifestStore};
use crate::storage::vectors::{IndexedChunk, RedbVectorStore, SearchFilters, SearchHit, VectorIndex};
use crate::sync::diff::{compute_changes, ChangeCounts, SyncScope};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of a sync pass
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub scope: SyncScope,
    /// Re-process in-scope documents even when their content is unchanged
    pub force: bool,
}

/// Stage at which a document failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnreadableSource,
    ExtractionFailed,
    EmbeddingService,
    IndexStore,
    Other,
}

impl From<&Error> for FailureKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::UnreadableSource { .. } => FailureKind::UnreadableSource,
            Error::ExtractionFailed { .. } => FailureKind::ExtractionFailed,
            Error::EmbeddingService(_) => FailureKind::EmbeddingService,
            Error::IndexStore(_) => FailureKind::IndexStore,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentFailure {
    pub document_id: String,
    pub kind: FailureKind,
    pub message: String,
    /// Recorded as failed in the manifest; otherwise retried next pass
    pub permanent: bool,
}

impl DocumentFailure {
    fn new(document_id: &str, error: &Error) -> Self {
        Self {
            document_id: document_id.to_string(),
            kind: FailureKind::from(error),
            message: error.to_string(),
            permanent: error.is_permanent(),
        }
    }
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    /// Documents whose mtime moved without a content change
    pub touched: usize,
    pub unchanged: usize,
    pub failed: Vec<DocumentFailure>,
    /// Previously failed documents left alone because their content is unchanged
    pub skipped_failed: Vec<String>,
    pub not_found: Vec<String>,
    /// Unreadable documents whose last complete version stays indexed
    pub unreadable_indexed: Vec<String>,
    /// Chunks removed while reconciling the index with the manifest
    pub orphans_removed: usize,
    pub chunks_written: usize,
    pub chunks_deleted: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn processed(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.not_found.is_empty()
    }
}

/// Summary returned by `status`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStatus {
    pub documents_indexed: usize,
    pub documents_failed: usize,
    pub chunks_indexed: usize,
    pub pending: ChangeCounts,
    pub unreadable: usize,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Indexed,
    Failed,
    PendingAdd,
    PendingUpdate,
    PendingRemoval,
    Unreadable,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::PendingAdd => "pending (new)",
            DocumentStatus::PendingUpdate => "pending (changed)",
            DocumentStatus::PendingRemoval => "pending (removed)",
            DocumentStatus::Unreadable => "unreadable",
        };
        f.write_str(label)
    }
}

/// One row of `list`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentState {
    pub document_id: String,
    pub status: DocumentStatus,
    pub chunks: usize,
    pub indexed_at: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Text(String),
    Vector(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Query,
    pub top_k: usize,
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn text(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: Query::Text(query.into()),
            top_k,
            filters: SearchFilters::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Added,
    Modified,
}

/// Keeps a vector index in sync with a directory of documents.
///
/// Only documents whose fingerprint changed are extracted and embedded, in
/// parallel windows. Index writes and manifest commits happen one document
/// at a time on the calling thread. A `complete` manifest entry always names
/// chunks that exist in the index; chunks left behind by an interrupted pass
/// are removed when the next pass reconciles.
pub struct Indexer {
    source_dir: PathBuf,
    lock_path: PathBuf,
    concurrency: usize,
    manifest: Box<dyn ManifestStore>,
    index: Arc<dyn VectorIndex>,
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn Embedder>,
    writer: Mutex<()>,
}

impl Indexer {
    pub fn new(
        source_dir: &Path,
        lock_path: &Path,
        manifest: Box<dyn ManifestStore>,
        index: Arc<dyn VectorIndex>,
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
            concurrency: 1,
            manifest,
            index,
            extractor,
            embedder,
            writer: Mutex::new(()),
        }
    }

    /// Maximum number of documents extracted and embedded at once
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Open the stores configured for a data directory
    pub fn open(config: &Config) -> Result<Self> {
        let settings = &config.settings;
        let index = RedbVectorStore::open(&config.vectors_path())?;
        let manifest = open_manifest(config)?;
        let extractor = DocumentExtractor::new(settings.chunk_size, settings.chunk_overlap);

        Ok(Self::new(
            &config.source_dir(),
            &config.lock_path,
            manifest,
            Arc::new(index),
            Arc::new(extractor),
            build_embedder(config),
        )
        .with_concurrency(settings.concurrency))
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn manifest(&self) -> &dyn ManifestStore {
        self.manifest.as_ref()
    }

    /// Run one sync pass.
    ///
    /// Per-document failures are collected in the report. The pass itself
    /// only fails when another sync holds the lock, the source directory
    /// cannot be walked, or the manifest cannot be read or written.
    pub fn sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        let started = Instant::now();
        let _writer = self
            .writer
            .lock()
            .map_err(|e| Error::Database(format!("Failed to lock indexer: {}", e)))?;
        let _lock = SyncLock::acquire(&self.lock_path)?;

        let mut report = SyncReport::default();
        let snapshot = self.snapshot()?;
        let mut manifest = self.manifest.load()?;

        self.reconcile(&mut manifest, &mut report)?;

        let changes = compute_changes(
            &snapshot,
            &manifest,
            &request.scope,
            request.force,
            self.embedder.model_id(),
        );
        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            unchanged = changes.unchanged.len(),
            "Computed changes"
        );

        report.unchanged = changes.unchanged.len();
        report.skipped_failed = changes.failed_unchanged.clone();
        report.not_found = changes.not_found.clone();
        for document_id in &changes.unreadable_indexed {
            warn!(document = %document_id, "Document unreadable, keeping its indexed version");
        }
        report.unreadable_indexed = changes.unreadable_indexed.clone();

        if !changes.has_work() {
            report.duration_ms = started.elapsed().as_millis() as u64;
            info!(unchanged = report.unchanged, "Index is up to date");
            return Ok(report);
        }

        for (document_id, unreadable) in &changes.unreadable {
            let error = Error::UnreadableSource {
                document_id: document_id.clone(),
                reason: unreadable.reason.clone(),
            };
            warn!(document = %document_id, error = %error, "Document failed");
            self.manifest.commit(&ManifestEntry::failed(
                unreadable.fingerprint.clone(),
                error.to_string(),
                self.embedder.model_id(),
            ))?;
            report.failed.push(DocumentFailure::new(document_id, &error));
        }

        for document_id in &changes.removed {
            self.remove_document(document_id, &mut report)?;
        }

        for current in &changes.touched {
            if let Some(entry) = manifest.get(&current.file.document_id) {
                let refreshed = ManifestEntry {
                    fingerprint: current.fingerprint.clone(),
                    ..entry.clone()
                };
                self.manifest.commit(&refreshed)?;
                report.touched += 1;
            }
        }

        let work: Vec<(&SnapshotEntry, ChangeKind)> = changes
            .modified
            .iter()
            .map(|entry| (entry, ChangeKind::Modified))
            .chain(changes.added.iter().map(|entry| (entry, ChangeKind::Added)))
            .collect();

        if !work.is_empty() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.concurrency)
                .build()
                .map_err(|e| Error::Config(format!("Failed to build worker pool: {}", e)))?;

            for window in work.chunks(self.concurrency) {
                let prepared: Vec<Result<Vec<IndexedChunk>>> = pool.install(|| {
                    window
                        .par_iter()
                        .map(|(entry, _)| self.prepare(entry))
                        .collect()
                });

                for (&(entry, kind), chunks) in window.iter().zip(prepared) {
                    self.apply(entry, kind, chunks, &mut report)?;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            added = report.added.len(),
            modified = report.modified.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            duration_ms = report.duration_ms,
            "Sync finished"
        );
        Ok(report)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let files = discover_documents(&self.source_dir)?;
        Ok(take_snapshot(&files))
    }

    /// Drop index content the manifest does not vouch for, and manifest
    /// entries whose chunks are not all in the index.
    fn reconcile(
        &self,
        manifest: &mut BTreeMap<String, ManifestEntry>,
        report: &mut SyncReport,
    ) -> Result<()> {
        for document_id in self.index.document_ids()? {
            let vouched = manifest.get(&document_id).is_some_and(|e| e.is_complete());
            if !vouched {
                let removed = self.index.delete_document(&document_id)?;
                warn!(document = %document_id, chunks = removed, "Removed orphaned chunks");
                report.orphans_removed += removed;
            }
        }

        let mut stale = Vec::new();
        for (document_id, entry) in manifest.iter() {
            if !entry.is_complete() {
                continue;
            }
            let indexed: BTreeSet<String> =
                self.index.document_chunk_ids(document_id)?.into_iter().collect();
            let recorded: BTreeSet<String> = entry.chunk_ids.iter().cloned().collect();
            if indexed != recorded {
                stale.push(document_id.clone());
            }
        }

        for document_id in stale {
            warn!(document = %document_id, "Manifest entry does not match the index, re-indexing");
            self.manifest.remove(&document_id)?;
            report.orphans_removed += self.index.delete_document(&document_id)?;
            manifest.remove(&document_id);
        }
        Ok(())
    }

    fn remove_document(&self, document_id: &str, report: &mut SyncReport) -> Result<()> {
        self.manifest.remove(document_id)?;
        match self.index.delete_document(document_id) {
            Ok(deleted) => {
                info!(document = %document_id, chunks = deleted, "Removed document");
                report.chunks_deleted += deleted;
                report.removed.push(document_id.to_string());
            }
            Err(e) => {
                warn!(document = %document_id, error = %e, "Failed to delete chunks of removed document");
                report.failed.push(DocumentFailure::new(document_id, &e));
            }
        }
        Ok(())
    }

    /// Extract and embed one document. Runs on the worker pool.
    fn prepare(&self, entry: &SnapshotEntry) -> Result<Vec<IndexedChunk>> {
        let document_id = &entry.file.document_id;
        let chunks = self.extractor.extract(&entry.file, &entry.fingerprint)?;
        debug!(document = %document_id, chunks = chunks.len(), "Extracted");

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            check_batch(texts.len(), self.embedder.embed_documents(&texts)?)?
        };

        let metadata = parse_document_metadata(document_id);
        Ok(chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk {
                chunk_id: chunk.chunk_id,
                document_id: chunk.document_id,
                index: chunk.index,
                text: chunk.text,
                location: chunk.location,
                embedding,
                metadata: metadata.clone(),
            })
            .collect())
    }

    /// Write one prepared document. Only manifest failures are returned.
    fn apply(
        &self,
        entry: &SnapshotEntry,
        kind: ChangeKind,
        prepared: Result<Vec<IndexedChunk>>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let document_id = entry.file.document_id.as_str();
        let model = self.embedder.model_id();

        if kind == ChangeKind::Modified {
            self.manifest.remove(document_id)?;
        }
        match self.index.delete_document(document_id) {
            Ok(deleted) => report.chunks_deleted += deleted,
            Err(e) => {
                warn!(document = %document_id, error = %e, "Failed to clear previous chunks");
                report.failed.push(DocumentFailure::new(document_id, &e));
                return Ok(());
            }
        }

        let chunks = match prepared {
            Ok(chunks) => chunks,
            Err(e) if e.is_permanent() => {
                warn!(document = %document_id, error = %e, "Document failed");
                self.manifest
                    .commit(&ManifestEntry::failed(entry.fingerprint.clone(), e.to_string(), model))?;
                report.failed.push(DocumentFailure::new(document_id, &e));
                return Ok(());
            }
            Err(e) => {
                warn!(document = %document_id, error = %e, "Document left pending");
                report.failed.push(DocumentFailure::new(document_id, &e));
                return Ok(());
            }
        };

        if let Err(e) = self.index.upsert(&chunks) {
            warn!(document = %document_id, error = %e, "Upsert failed, cleaning up");
            self.discard(document_id);
            report.failed.push(DocumentFailure::new(document_id, &e));
            return Ok(());
        }

        let chunk_ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let committed = ManifestEntry::complete(entry.fingerprint.clone(), chunk_ids, model);
        if let Err(e) = self.manifest.commit(&committed) {
            self.discard(document_id);
            return Err(e);
        }

        info!(document = %document_id, chunks = chunks.len(), "Indexed");
        report.chunks_written += chunks.len();
        match kind {
            ChangeKind::Added => report.added.push(document_id.to_string()),
            ChangeKind::Modified => report.modified.push(document_id.to_string()),
        }
        Ok(())
    }

    /// Best-effort removal of chunks that will not be committed
    fn discard(&self, document_id: &str) {
        if let Err(e) = self.index.delete_document(document_id) {
            warn!(document = %document_id, error = %e, "Cleanup failed, next sync will remove the chunks");
        }
    }

    /// Counts of indexed, failed and pending documents
    pub fn status(&self) -> Result<IndexStatus> {
        let snapshot = self.snapshot()?;
        let manifest = self.manifest.load()?;
        let changes = compute_changes(
            &snapshot,
            &manifest,
            &SyncScope::All,
            false,
            self.embedder.model_id(),
        );

        Ok(IndexStatus {
            documents_indexed: manifest.values().filter(|e| e.is_complete()).count(),
            documents_failed: manifest.values().filter(|e| !e.is_complete()).count(),
            chunks_indexed: self.index.chunk_count()?,
            pending: changes.counts(),
            unreadable: snapshot.unreadable.len(),
            embedding_model: self.embedder.model_id().to_string(),
        })
    }

    /// Per-document state, sorted by document id
    pub fn list(&self) -> Result<Vec<DocumentState>> {
        let snapshot = self.snapshot()?;
        let manifest = self.manifest.load()?;
        let model = self.embedder.model_id();
        let mut rows = BTreeMap::new();

        for (document_id, current) in &snapshot.documents {
            let recorded = manifest.get(document_id);
            let status = match recorded {
                None => DocumentStatus::PendingAdd,
                Some(entry) => {
                    let changed =
                        current.fingerprint.compare(&entry.fingerprint) == FingerprintMatch::Changed;
                    if changed || (entry.is_complete() && entry.embedding_model != model) {
                        DocumentStatus::PendingUpdate
                    } else if entry.is_complete() {
                        DocumentStatus::Indexed
                    } else {
                        DocumentStatus::Failed
                    }
                }
            };
            rows.insert(document_id.clone(), row(document_id, status, recorded));
        }

        for (document_id, unreadable) in &snapshot.unreadable {
            let mut state = row(document_id, DocumentStatus::Unreadable, manifest.get(document_id));
            state.error = Some(unreadable.reason.clone());
            rows.insert(document_id.clone(), state);
        }

        for (document_id, entry) in &manifest {
            if !rows.contains_key(document_id) {
                rows.insert(
                    document_id.clone(),
                    row(document_id, DocumentStatus::PendingRemoval, Some(entry)),
                );
            }
        }

        Ok(rows.into_values().collect())
    }

    /// Empty the index and the manifest
    pub fn reset(&self) -> Result<()> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| Error::Database(format!("Failed to lock indexer: {}", e)))?;
        let _lock = SyncLock::acquire(&self.lock_path)?;

        self.manifest.clear()?;
        self.index.clear()?;
        info!("Index reset");
        Ok(())
    }

    /// Nearest chunks to a query. Reads the committed index without locking.
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let vector = match &request.query {
            Query::Text(text) => self.embedder.embed_query(text)?,
            Query::Vector(vector) => vector.clone(),
        };
        self.index.query(&vector, request.top_k, &request.filters)
    }
}

fn row(document_id: &str, status: DocumentStatus, entry: Option<&ManifestEntry>) -> DocumentState {
    DocumentState {
        document_id: document_id.to_string(),
        status,
        chunks: entry.map_or(0, |e| e.chunk_ids.len()),
        indexed_at: entry.map(|e| e.indexed_at),
        error: entry.and_then(|e| e.error.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::manifest::JsonManifest;
    use std::fs;
    use tempfile::TempDir;

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn model_id(&self) -> &str {
            "length"
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn indexer(temp_dir: &TempDir) -> Indexer {
        let source = temp_dir.path().join("docs");
        fs::create_dir_all(&source).unwrap();
        let data = temp_dir.path().join("data");
        Indexer::new(
            &source,
            &data.join("sync.lock"),
            Box::new(JsonManifest::open(&data.join("manifest.json")).unwrap()),
            Arc::new(RedbVectorStore::open(&data.join("vectors.redb")).unwrap()),
            Arc::new(DocumentExtractor::new(40, 10)),
            Arc::new(LengthEmbedder),
        )
        .with_concurrency(2)
    }

    #[test]
    fn test_failure_kind_from_error() {
        let error = Error::ExtractionFailed {
            document_id: "a.txt".to_string(),
            reason: "bad".to_string(),
        };
        let failure = DocumentFailure::new("a.txt", &error);
        assert_eq!(failure.kind, FailureKind::ExtractionFailed);
        assert!(failure.permanent);

        let failure = DocumentFailure::new("a.txt", &Error::EmbeddingService("down".to_string()));
        assert_eq!(failure.kind, FailureKind::EmbeddingService);
        assert!(!failure.permanent);
    }

    #[test]
    fn test_sync_then_list() {
        let temp_dir = TempDir::new().unwrap();
        let indexer = indexer(&temp_dir);
        fs::write(indexer.source_dir().join("a.txt"), "First document text.").unwrap();
        fs::write(indexer.source_dir().join("b.txt"), "Second document, somewhat longer text.").unwrap();

        let report = indexer.sync(&SyncRequest::default()).unwrap();
        assert_eq!(report.added, vec!["a.txt", "b.txt"]);
        assert!(report.is_clean());

        let rows = indexer.list().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == DocumentStatus::Indexed && r.chunks > 0));

        fs::remove_file(indexer.source_dir().join("b.txt")).unwrap();
        let rows = indexer.list().unwrap();
        assert_eq!(rows[1].status, DocumentStatus::PendingRemoval);
    }

    #[test]
    fn test_reconcile_removes_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let indexer = indexer(&temp_dir);
        fs::write(indexer.source_dir().join("a.txt"), "Some text.").unwrap();
        indexer.sync(&SyncRequest::default()).unwrap();

        // Manifest lost while the index kept its chunks
        indexer.manifest.clear().unwrap();

        let report = indexer.sync(&SyncRequest::default()).unwrap();
        assert!(report.orphans_removed > 0);
        assert_eq!(report.added, vec!["a.txt"]);
        assert_eq!(indexer.status().unwrap().chunks_indexed, 1);
    }

    #[test]
    fn test_status_counts_pending() {
        let temp_dir = TempDir::new().unwrap();
        let indexer = indexer(&temp_dir);
        fs::write(indexer.source_dir().join("a.txt"), "Some text.").unwrap();

        let status = indexer.status().unwrap();
        assert_eq!(status.pending.added, 1);
        assert_eq!(status.documents_indexed, 0);
        assert_eq!(status.embedding_model, "length");

        indexer.sync(&SyncRequest::default()).unwrap();
        let status = indexer.status().unwrap();
        assert_eq!(status.pending, ChangeCounts::default());
        assert_eq!(status.documents_indexed, 1);
    }

    #[test]
    fn test_search_by_vector() {
        let temp_dir = TempDir::new().unwrap();
        let indexer = indexer(&temp_dir);
        fs::write(indexer.source_dir().join("a.txt"), "Some text.").unwrap();
        indexer.sync(&SyncRequest::default()).unwrap();

        let request = SearchRequest {
            query: Query::Vector(vec![10.0, 1.0]),
            top_k: 3,
            filters: SearchFilters::default(),
        };
        let hits = indexer.search(&request).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "a.txt");
        assert_eq!(hits[0].location.page, 1);
    }
}
