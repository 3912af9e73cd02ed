#![allow(dead_code)]

use normo_index::indexing::discovery::SourceFile;
use normo_index::{
    Chunk, DocumentExtractor, DocumentFingerprint, Embedder, Error, Extractor, IndexedChunk, Indexer,
    JsonManifest, ManifestStore, RedbManifest, RedbVectorStore, Result, SearchFilters, SearchHit,
    VectorIndex,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const DIMENSIONS: usize = 256;

/// Bag-of-words embedder: same text, same vector, across runs
#[derive(Default)]
pub struct HashEmbedder {
    pub document_calls: AtomicUsize,
    /// Fail every call while set
    pub unavailable: AtomicBool,
}

impl HashEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMENSIONS];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            vector[(hasher.finish() % DIMENSIONS as u64) as usize] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    pub fn calls(&self) -> usize {
        self.document_calls.load(Ordering::SeqCst)
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        "test-hash"
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::EmbeddingService("service unavailable".to_string()));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::vector(text))
    }
}

/// Shares a `HashEmbedder` so tests can inspect it after handing it over
pub struct SharedEmbedder(pub Arc<HashEmbedder>);

impl Embedder for SharedEmbedder {
    fn model_id(&self) -> &str {
        self.0.model_id()
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.0.embed_documents(texts)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.0.embed_query(text)
    }
}

/// Counts extraction calls
pub struct CountingExtractor {
    inner: DocumentExtractor,
    pub calls: Arc<AtomicUsize>,
}

impl Extractor for CountingExtractor {
    fn extract(&self, file: &SourceFile, fingerprint: &DocumentFingerprint) -> Result<Vec<Chunk>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(file, fingerprint)
    }
}

/// Vector index whose writes can be made to fail for chosen documents.
///
/// A failing upsert stores half of the chunks before reporting the error,
/// like a backend that lost its connection mid-batch.
pub struct FlakyIndex {
    pub inner: Arc<RedbVectorStore>,
    pub fail_upsert: Mutex<HashSet<String>>,
    pub fail_delete: Mutex<HashSet<String>>,
}

impl FlakyIndex {
    pub fn new(inner: Arc<RedbVectorStore>) -> Self {
        Self {
            inner,
            fail_upsert: Mutex::new(HashSet::new()),
            fail_delete: Mutex::new(HashSet::new()),
        }
    }
}

impl VectorIndex for FlakyIndex {
    fn upsert(&self, chunks: &[IndexedChunk]) -> Result<()> {
        let failing = chunks
            .first()
            .is_some_and(|c| self.fail_upsert.lock().unwrap().contains(&c.document_id));
        if failing {
            self.inner.upsert(&chunks[..chunks.len().div_ceil(2)])?;
            return Err(Error::IndexStore("connection reset".to_string()));
        }
        self.inner.upsert(chunks)
    }

    fn delete_document(&self, document_id: &str) -> Result<usize> {
        if self.fail_delete.lock().unwrap().contains(document_id) {
            return Err(Error::IndexStore("connection reset".to_string()));
        }
        self.inner.delete_document(document_id)
    }

    fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        self.inner.document_chunk_ids(document_id)
    }

    fn document_ids(&self) -> Result<BTreeSet<String>> {
        self.inner.document_ids()
    }

    fn query(&self, vector: &[f32], top_k: usize, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        self.inner.query(vector, top_k, filters)
    }

    fn chunk_count(&self) -> Result<usize> {
        self.inner.chunk_count()
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }
}

/// A source folder plus data directory in a temp dir
pub struct Fixture {
    pub temp_dir: TempDir,
    pub source_dir: PathBuf,
    pub data_dir: PathBuf,
    pub embedder: Arc<HashEmbedder>,
    pub extractions: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source_dir = temp_dir.path().join("docs");
        let data_dir = temp_dir.path().join("data");
        fs::create_dir_all(&source_dir).unwrap();
        fs::create_dir_all(&data_dir).unwrap();
        Self {
            temp_dir,
            source_dir,
            data_dir,
            embedder: Arc::new(HashEmbedder::default()),
            extractions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn write(&self, document_id: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.source_dir.join(document_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    pub fn remove(&self, document_id: &str) {
        fs::remove_file(self.source_dir.join(document_id)).unwrap();
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("sync.lock")
    }

    pub fn open_store(&self) -> Arc<RedbVectorStore> {
        Arc::new(RedbVectorStore::open(&self.data_dir.join("vectors.redb")).unwrap())
    }

    pub fn open_manifest(&self) -> Box<dyn ManifestStore> {
        Box::new(RedbManifest::open(&self.data_dir.join("manifest.redb")).unwrap())
    }

    pub fn open_json_manifest(&self) -> Box<dyn ManifestStore> {
        Box::new(JsonManifest::open(&self.data_dir.join("manifest.json")).unwrap())
    }

    /// Indexer over the given stores, with small chunks
    pub fn indexer(&self, manifest: Box<dyn ManifestStore>, index: Arc<dyn VectorIndex>) -> Indexer {
        let extractor = CountingExtractor {
            inner: DocumentExtractor::new(120, 30),
            calls: Arc::clone(&self.extractions),
        };
        Indexer::new(
            &self.source_dir,
            &self.lock_path(),
            manifest,
            index,
            Arc::new(extractor),
            Arc::new(SharedEmbedder(Arc::clone(&self.embedder))),
        )
        .with_concurrency(2)
    }

    pub fn extraction_calls(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

/// Every indexed document has a complete manifest entry naming exactly its chunks
pub fn assert_no_orphans(manifest: &dyn ManifestStore, index: &dyn VectorIndex) {
    let entries = manifest.load().unwrap();
    for document_id in index.document_ids().unwrap() {
        let entry = entries
            .get(&document_id)
            .unwrap_or_else(|| panic!("index holds chunks of unknown document {}", document_id));
        assert!(entry.is_complete(), "{} has chunks but is not complete", document_id);
    }
    for entry in entries.values().filter(|e| e.is_complete()) {
        let mut indexed = index.document_chunk_ids(&entry.document_id).unwrap();
        let mut recorded = entry.chunk_ids.clone();
        indexed.sort();
        recorded.sort();
        assert_eq!(indexed, recorded, "chunk mismatch for {}", entry.document_id);
    }
}

/// Long enough to produce several chunks
pub fn long_text(topic: &str, paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| {
            format!(
                "Paragraph {} about {}. The building code requires escape routes, fire \
                 compartments and accessible entrances for {} structures.",
                i, topic, topic
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
