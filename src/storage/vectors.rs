use crate::core::error::{Error, Result};
use crate::storage::database::DatabaseFile;
use crate::indexing::extractor::SourceLocation;
use crate::indexing::metadata::DocumentMetadata;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::path::Path;

/// Key: chunk_id, value: JSON serialized IndexedChunk
const CHUNKS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("chunks");

/// Key: document_id, value: JSON array of the document's chunk ids
const DOCUMENTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("documents");

/// A chunk with its embedding, as stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub index: usize,
    pub text: String,
    pub location: SourceLocation,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
}

impl IndexedChunk {
    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::IndexStore(format!("Failed to serialize chunk: {}", e)))
    }

    fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::IndexStore(format!("Failed to deserialize chunk: {}", e)))
    }
}

/// Restrictions applied to a similarity query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    /// Only consider these documents (empty = all)
    pub document_ids: HashSet<String>,
    pub document_type: Option<String>,
    pub jurisdiction: Option<String>,
    /// Drop hits scoring below this
    pub min_score: Option<f32>,
}

impl SearchFilters {
    fn admits_document(&self, document_id: &str) -> bool {
        self.document_ids.is_empty() || self.document_ids.contains(document_id)
    }

    fn admits(&self, chunk: &IndexedChunk) -> bool {
        let matches = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            Some(w) => actual.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(w)),
            None => true,
        };
        matches(&self.document_type, &chunk.metadata.document_type)
            && matches(&self.jurisdiction, &chunk.metadata.jurisdiction)
    }
}

/// A ranked query result with its citation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub location: SourceLocation,
    pub metadata: DocumentMetadata,
    pub score: f32,
}

/// Persistent vector index
pub trait VectorIndex: Send + Sync {
    /// Insert or replace chunks
    fn upsert(&self, chunks: &[IndexedChunk]) -> Result<()>;

    /// Remove every chunk of a document, returning how many were removed
    fn delete_document(&self, document_id: &str) -> Result<usize>;

    fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>>;

    /// Documents that own at least one chunk
    fn document_ids(&self) -> Result<BTreeSet<String>>;

    fn query(&self, vector: &[f32], top_k: usize, filters: &SearchFilters) -> Result<Vec<SearchHit>>;

    fn chunk_count(&self) -> Result<usize>;

    fn clear(&self) -> Result<()>;
}

/// Vector index stored in redb with brute-force cosine search
pub struct RedbVectorStore {
    file: DatabaseFile,
}

impl RedbVectorStore {
    /// Open or create the vector store
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            file: DatabaseFile::new(db_path)?,
        };

        let db = store.db()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::IndexStore(format!("Failed to begin write transaction: {}", e)))?;
        {
            write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
            write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::IndexStore(format!("Failed to commit transaction: {}", e)))?;

        Ok(store)
    }

    fn db(&self) -> Result<Database> {
        self.file.open().map_err(|e| match e {
            Error::Database(msg) => Error::IndexStore(msg),
            other => other,
        })
    }

    /// Get a chunk by id
    pub fn get(&self, chunk_id: &str) -> Result<Option<IndexedChunk>> {
        let db = self.db()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::IndexStore(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(CHUNKS_TABLE)
            .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;

        let guard = table
            .get(chunk_id)
            .map_err(|e| Error::IndexStore(format!("Failed to get chunk: {}", e)))?;
        match guard {
            Some(guard) => {
                let json = guard.value().to_string();
                IndexedChunk::from_json(&json).map(Some)
            }
            None => Ok(None),
        }
    }
}

fn parse_ids(json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json)
        .map_err(|e| Error::IndexStore(format!("Failed to read document chunk list: {}", e)))
}

impl VectorIndex for RedbVectorStore {
    fn upsert(&self, chunks: &[IndexedChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let db = self.db()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::IndexStore(format!("Failed to begin write transaction: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
            let mut documents = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;

            let mut owned: std::collections::BTreeMap<&str, Vec<&str>> = Default::default();
            for chunk in chunks {
                let json = chunk.to_json()?;
                table
                    .insert(chunk.chunk_id.as_str(), json.as_str())
                    .map_err(|e| Error::IndexStore(format!("Failed to insert chunk: {}", e)))?;
                owned
                    .entry(chunk.document_id.as_str())
                    .or_default()
                    .push(chunk.chunk_id.as_str());
            }

            for (document_id, new_ids) in owned {
                let existing = documents
                    .get(document_id)
                    .map_err(|e| Error::IndexStore(format!("Failed to read document: {}", e)))?
                    .map(|guard| guard.value().to_string());
                let mut ids = match existing {
                    Some(json) => parse_ids(&json)?,
                    None => Vec::new(),
                };
                for id in new_ids {
                    if !ids.iter().any(|existing| existing == id) {
                        ids.push(id.to_string());
                    }
                }
                let json = serde_json::to_string(&ids)
                    .map_err(|e| Error::IndexStore(format!("Failed to serialize chunk list: {}", e)))?;
                documents
                    .insert(document_id, json.as_str())
                    .map_err(|e| Error::IndexStore(format!("Failed to insert document: {}", e)))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| Error::IndexStore(format!("Failed to commit transaction: {}", e)))?;

        Ok(())
    }

    fn delete_document(&self, document_id: &str) -> Result<usize> {
        let db = self.db()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::IndexStore(format!("Failed to begin write transaction: {}", e)))?;
        let removed;
        {
            let mut documents = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
            let ids = documents
                .remove(document_id)
                .map_err(|e| Error::IndexStore(format!("Failed to remove document: {}", e)))?
                .map(|guard| guard.value().to_string());
            let ids = match ids {
                Some(json) => parse_ids(&json)?,
                None => Vec::new(),
            };

            let mut table = write_txn
                .open_table(CHUNKS_TABLE)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
            for chunk_id in &ids {
                table
                    .remove(chunk_id.as_str())
                    .map_err(|e| Error::IndexStore(format!("Failed to remove chunk: {}", e)))?;
            }
            removed = ids.len();
        }
        write_txn
            .commit()
            .map_err(|e| Error::IndexStore(format!("Failed to commit transaction: {}", e)))?;

        Ok(removed)
    }

    fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        let db = self.db()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::IndexStore(format!("Failed to begin read transaction: {}", e)))?;
        let documents = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;

        let json = documents
            .get(document_id)
            .map_err(|e| Error::IndexStore(format!("Failed to read document: {}", e)))?
            .map(|guard| guard.value().to_string());
        match json {
            Some(json) => parse_ids(&json),
            None => Ok(Vec::new()),
        }
    }

    fn document_ids(&self) -> Result<BTreeSet<String>> {
        let db = self.db()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::IndexStore(format!("Failed to begin read transaction: {}", e)))?;
        let documents = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;

        let mut ids = BTreeSet::new();
        for item in documents
            .iter()
            .map_err(|e| Error::IndexStore(format!("Failed to iterate table: {}", e)))?
        {
            let (key, _value) =
                item.map_err(|e| Error::IndexStore(format!("Failed to read table item: {}", e)))?;
            ids.insert(key.value().to_string());
        }
        Ok(ids)
    }

    /// Cosine similarity over every admitted chunk, keeping the top K in a min-heap
    fn query(&self, vector: &[f32], top_k: usize, filters: &SearchFilters) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let db = self.db()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::IndexStore(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(CHUNKS_TABLE)
            .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;

        let mut heap: BinaryHeap<Scored> = BinaryHeap::with_capacity(top_k + 1);

        for item in table
            .iter()
            .map_err(|e| Error::IndexStore(format!("Failed to iterate table: {}", e)))?
        {
            let (_key, value) =
                item.map_err(|e| Error::IndexStore(format!("Failed to read table item: {}", e)))?;
            let chunk = IndexedChunk::from_json(value.value())?;
            if !filters.admits_document(&chunk.document_id) || !filters.admits(&chunk) {
                continue;
            }

            let score = cosine_similarity(vector, &chunk.embedding);
            if filters.min_score.is_some_and(|min| score < min) {
                continue;
            }

            heap.push(Scored(chunk, score));
            if heap.len() > top_k {
                heap.pop();
            }
        }

        let mut results: Vec<SearchHit> = heap
            .into_iter()
            .map(|Scored(chunk, score)| SearchHit {
                chunk_id: chunk.chunk_id,
                document_id: chunk.document_id,
                text: chunk.text,
                location: chunk.location,
                metadata: chunk.metadata,
                score,
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        Ok(results)
    }

    fn chunk_count(&self) -> Result<usize> {
        let db = self.db()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::IndexStore(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(CHUNKS_TABLE)
            .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
        let count = table
            .len()
            .map_err(|e| Error::IndexStore(format!("Failed to count chunks: {}", e)))?;
        Ok(count as usize)
    }

    fn clear(&self) -> Result<()> {
        let db = self.db()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::IndexStore(format!("Failed to begin write transaction: {}", e)))?;
        for definition in [CHUNKS_TABLE, DOCUMENTS_TABLE] {
            write_txn
                .delete_table(definition)
                .map_err(|e| Error::IndexStore(format!("Failed to delete table: {}", e)))?;
            write_txn
                .open_table(definition)
                .map_err(|e| Error::IndexStore(format!("Failed to open table: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::IndexStore(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }
}

/// Min-heap entry: BinaryHeap is a max-heap, so ordering is reversed
struct Scored(IndexedChunk, f32);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        other.1.partial_cmp(&self.1).unwrap_or(Ordering::Equal)
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::metadata::parse_document_metadata;
    use tempfile::TempDir;

    fn chunk(document_id: &str, index: usize, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            chunk_id: format!("{}@hash#{:05}", document_id, index),
            document_id: document_id.to_string(),
            index,
            text: format!("chunk {} of {}", index, document_id),
            location: SourceLocation { page: 1, offset: index * 10 },
            embedding,
            metadata: parse_document_metadata(document_id),
        }
    }

    fn open_store(temp_dir: &TempDir) -> RedbVectorStore {
        RedbVectorStore::open(&temp_dir.path().join("database").join("vectors.redb")).unwrap()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 1.0]), 0.0);
        assert!(cosine_similarity(&[1.0, -1.0], &[-1.0, 1.0]) < 0.0);
    }

    #[test]
    fn test_upsert_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let c = chunk("a.pdf", 0, vec![0.1, 0.2]);
        store.upsert(&[c.clone()]).unwrap();
        assert_eq!(store.get(&c.chunk_id).unwrap(), Some(c.clone()));
        assert_eq!(store.document_chunk_ids("a.pdf").unwrap(), vec![c.chunk_id.clone()]);

        // Upserting again does not duplicate ownership
        store.upsert(&[c.clone()]).unwrap();
        assert_eq!(store.document_chunk_ids("a.pdf").unwrap().len(), 1);
        assert_eq!(store.chunk_count().unwrap(), 1);
    }

    #[test]
    fn test_delete_document() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let chunks: Vec<IndexedChunk> = (0..5).map(|i| chunk("test.pdf", i, vec![0.1, 0.2])).collect();
        store.upsert(&chunks).unwrap();
        store.upsert(&[chunk("other.pdf", 0, vec![0.3, 0.1])]).unwrap();

        assert_eq!(store.delete_document("test.pdf").unwrap(), 5);
        assert!(store.get("test.pdf@hash#00000").unwrap().is_none());
        assert!(store.document_chunk_ids("test.pdf").unwrap().is_empty());
        assert!(store.get("other.pdf@hash#00000").unwrap().is_some());
        assert_eq!(store.delete_document("nonexistent.pdf").unwrap(), 0);

        let ids: Vec<String> = store.document_ids().unwrap().into_iter().collect();
        assert_eq!(ids, vec!["other.pdf".to_string()]);
    }

    #[test]
    fn test_query_ranks_by_similarity() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store.upsert(&[chunk("similar.pdf", 0, vec![1.0, 0.0, 0.0])]).unwrap();
        store.upsert(&[chunk("different.pdf", 0, vec![0.0, 1.0, 0.0])]).unwrap();

        let results = store.query(&[1.0, 0.0, 0.0], 5, &SearchFilters::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_id, "similar.pdf");
        assert!(results[0].score > 0.9);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn test_query_with_limit() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let chunks: Vec<IndexedChunk> = (0..20)
            .map(|i| chunk(&format!("file{}.pdf", i), 0, vec![0.1 * i as f32, 0.2, 0.3]))
            .collect();
        store.upsert(&chunks).unwrap();

        let results = store.query(&[1.0, 0.0, 0.0], 5, &SearchFilters::default()).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].document_id, "file19.pdf");
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(store.query(&[1.0, 0.0, 0.0], 0, &SearchFilters::default()).unwrap().is_empty());
    }

    #[test]
    fn test_query_filters() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store
            .upsert(&[
                chunk("1_AT_W_2_GE_Bauordnung_2023.pdf", 0, vec![1.0, 0.0]),
                chunk("3_AT_0_OIB_Richtlinie_2019.pdf", 0, vec![1.0, 0.1]),
                chunk("notes.txt", 0, vec![0.0, 1.0]),
            ])
            .unwrap();

        let vienna = SearchFilters {
            jurisdiction: Some("Vienna".to_string()),
            ..Default::default()
        };
        let hits = store.query(&[1.0, 0.0], 10, &vienna).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.jurisdiction.as_deref(), Some("vienna"));

        let scoped = SearchFilters {
            document_ids: ["notes.txt".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let hits = store.query(&[1.0, 0.0], 10, &scoped).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "notes.txt");

        let strict = SearchFilters {
            min_score: Some(0.5),
            ..Default::default()
        };
        assert_eq!(store.query(&[1.0, 0.0], 10, &strict).unwrap().len(), 2);
    }

    #[test]
    fn test_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        store.upsert(&[chunk("a.pdf", 0, vec![1.0]), chunk("b.pdf", 0, vec![1.0])]).unwrap();

        store.clear().unwrap();
        assert_eq!(store.chunk_count().unwrap(), 0);
        assert!(store.document_ids().unwrap().is_empty());

        store.upsert(&[chunk("a.pdf", 1, vec![1.0])]).unwrap();
        assert_eq!(store.chunk_count().unwrap(), 1);
    }
}
