use crate::core::config::{Config, ManifestBackend};
use crate::core::error::{Error, Result};
use crate::indexing::fingerprint::DocumentFingerprint;
use crate::storage::database::DatabaseFile;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// Key: document id, value: JSON serialized ManifestEntry
const MANIFEST_TABLE: TableDefinition<&str, &str> = TableDefinition::new("manifest");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Complete,
    Failed,
}

/// Indexing record of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub document_id: String,
    pub fingerprint: DocumentFingerprint,
    pub chunk_ids: Vec<String>,
    /// Unix milliseconds
    pub indexed_at: u64,
    pub status: EntryStatus,
    /// Embedding model the chunks were produced with
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    pub fn complete(
        fingerprint: DocumentFingerprint,
        chunk_ids: Vec<String>,
        embedding_model: &str,
    ) -> Self {
        Self {
            document_id: fingerprint.document_id.clone(),
            fingerprint,
            chunk_ids,
            indexed_at: now_millis(),
            status: EntryStatus::Complete,
            embedding_model: embedding_model.to_string(),
            error: None,
        }
    }

    pub fn failed(fingerprint: DocumentFingerprint, error: String, embedding_model: &str) -> Self {
        Self {
            document_id: fingerprint.document_id.clone(),
            fingerprint,
            chunk_ids: Vec::new(),
            indexed_at: now_millis(),
            status: EntryStatus::Failed,
            embedding_model: embedding_model.to_string(),
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Complete
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Database(format!("Failed to serialize manifest entry: {}", e)))
    }

    fn from_json(document_id: &str, json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::ManifestCorruption(format!("entry for {} is unreadable: {}", document_id, e))
        })
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Storage interface for the manifest.
///
/// Every entry is committed on its own as soon as its document is processed,
/// so an interrupted pass loses at most the document in flight.
pub trait ManifestStore: Send + Sync {
    fn load(&self) -> Result<BTreeMap<String, ManifestEntry>>;

    fn get(&self, document_id: &str) -> Result<Option<ManifestEntry>>;

    /// Upsert one entry durably
    fn commit(&self, entry: &ManifestEntry) -> Result<()>;

    fn remove(&self, document_id: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Open the manifest backend selected in the settings
pub fn open_manifest(config: &Config) -> Result<Box<dyn ManifestStore>> {
    std::fs::create_dir_all(&config.state_dir)?;
    let path = config.manifest_path();
    match config.settings.manifest_backend {
        ManifestBackend::Redb => Ok(Box::new(RedbManifest::open(&path)?)),
        ManifestBackend::Json => Ok(Box::new(JsonManifest::open(&path)?)),
    }
}

/// Manifest stored in a redb database, one transaction per entry
pub struct RedbManifest {
    file: DatabaseFile,
}

impl RedbManifest {
    pub fn open(path: &Path) -> Result<Self> {
        let manifest = Self {
            file: DatabaseFile::new(path)?,
        };

        let db = manifest.file.open()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::Database(format!("Failed to begin write transaction: {}", e)))?;
        {
            let _table = write_txn
                .open_table(MANIFEST_TABLE)
                .map_err(|e| Error::Database(format!("Failed to open table: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("Failed to commit transaction: {}", e)))?;

        Ok(manifest)
    }
}

impl ManifestStore for RedbManifest {
    fn load(&self) -> Result<BTreeMap<String, ManifestEntry>> {
        let db = self.file.open()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::Database(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(MANIFEST_TABLE)
            .map_err(|e| Error::ManifestCorruption(format!("Failed to open table: {}", e)))?;

        let mut entries = BTreeMap::new();
        for item in table
            .iter()
            .map_err(|e| Error::ManifestCorruption(format!("Failed to iterate table: {}", e)))?
        {
            let (key, value) = item
                .map_err(|e| Error::ManifestCorruption(format!("Failed to read entry: {}", e)))?;
            let document_id = key.value().to_string();
            let entry = ManifestEntry::from_json(&document_id, value.value())?;
            if entry.document_id != document_id {
                return Err(Error::ManifestCorruption(format!(
                    "entry stored under {} names {}",
                    document_id, entry.document_id
                )));
            }
            entries.insert(document_id, entry);
        }
        Ok(entries)
    }

    fn get(&self, document_id: &str) -> Result<Option<ManifestEntry>> {
        let db = self.file.open()?;
        let read_txn = db
            .begin_read()
            .map_err(|e| Error::Database(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(MANIFEST_TABLE)
            .map_err(|e| Error::Database(format!("Failed to open table: {}", e)))?;

        let guard = table
            .get(document_id)
            .map_err(|e| Error::Database(format!("Failed to get manifest entry: {}", e)))?;
        match guard {
            Some(guard) => {
                let json = guard.value().to_string();
                ManifestEntry::from_json(document_id, &json).map(Some)
            }
            None => Ok(None),
        }
    }

    fn commit(&self, entry: &ManifestEntry) -> Result<()> {
        let json = entry.to_json()?;
        let db = self.file.open()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::Database(format!("Failed to begin write transaction: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(MANIFEST_TABLE)
                .map_err(|e| Error::Database(format!("Failed to open table: {}", e)))?;
            table
                .insert(entry.document_id.as_str(), json.as_str())
                .map_err(|e| Error::Database(format!("Failed to insert manifest entry: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    fn remove(&self, document_id: &str) -> Result<()> {
        let db = self.file.open()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::Database(format!("Failed to begin write transaction: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(MANIFEST_TABLE)
                .map_err(|e| Error::Database(format!("Failed to open table: {}", e)))?;
            table
                .remove(document_id)
                .map_err(|e| Error::Database(format!("Failed to remove manifest entry: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let db = self.file.open()?;
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::Database(format!("Failed to begin write transaction: {}", e)))?;
        write_txn
            .delete_table(MANIFEST_TABLE)
            .map_err(|e| Error::Database(format!("Failed to delete table: {}", e)))?;
        {
            let _table = write_txn
                .open_table(MANIFEST_TABLE)
                .map_err(|e| Error::Database(format!("Failed to open table: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }
}

/// Manifest kept as a JSON file, rewritten through a rename on every commit.
///
/// The file is re-read on every call so entries committed by another process
/// are never overwritten with a stale copy.
pub struct JsonManifest {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonManifest {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manifest = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(()),
        };
        manifest.read()?;
        Ok(manifest)
    }

    fn read(&self) -> Result<BTreeMap<String, ManifestEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| {
            Error::ManifestCorruption(format!("{} is unreadable: {}", self.path.display(), e))
        })
    }

    fn persist(&self, entries: &BTreeMap<String, ManifestEntry>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Database(format!("Failed to serialize manifest: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read, change and rewrite the file while holding the writer lock
    fn update(&self, change: impl FnOnce(&mut BTreeMap<String, ManifestEntry>)) -> Result<()> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| Error::Database(format!("Failed to lock manifest: {}", e)))?;
        let mut entries = self.read()?;
        change(&mut entries);
        self.persist(&entries)
    }
}

impl ManifestStore for JsonManifest {
    fn load(&self) -> Result<BTreeMap<String, ManifestEntry>> {
        self.read()
    }

    fn get(&self, document_id: &str) -> Result<Option<ManifestEntry>> {
        Ok(self.read()?.remove(document_id))
    }

    fn commit(&self, entry: &ManifestEntry) -> Result<()> {
        self.update(|entries| {
            entries.insert(entry.document_id.clone(), entry.clone());
        })
    }

    fn remove(&self, document_id: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(document_id);
        })
    }

    fn clear(&self) -> Result<()> {
        self.update(|entries| entries.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fingerprint(id: &str, hash: &str) -> DocumentFingerprint {
        DocumentFingerprint {
            document_id: id.to_string(),
            byte_size: 42,
            modified_time: 1_700_000_000,
            content_hash: hash.to_string(),
        }
    }

    fn exercise(store: &dyn ManifestStore) {
        assert!(store.load().unwrap().is_empty());
        assert!(store.get("a.pdf").unwrap().is_none());

        let entry = ManifestEntry::complete(
            fingerprint("a.pdf", "h1"),
            vec!["a.pdf@h1#00000".to_string()],
            "model",
        );
        store.commit(&entry).unwrap();
        store
            .commit(&ManifestEntry::failed(fingerprint("b.pdf", "h2"), "bad".to_string(), "model"))
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a.pdf"], entry);
        assert_eq!(loaded["b.pdf"].status, EntryStatus::Failed);
        assert!(loaded["b.pdf"].chunk_ids.is_empty());

        store.remove("a.pdf").unwrap();
        store.remove("missing.pdf").unwrap();
        assert!(store.get("a.pdf").unwrap().is_none());
        assert!(store.get("b.pdf").unwrap().is_some());

        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_redb_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbManifest::open(&temp_dir.path().join("state").join("manifest.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_json_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonManifest::open(&temp_dir.path().join("manifest.json")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let redb_path = temp_dir.path().join("manifest.redb");
        let json_path = temp_dir.path().join("manifest.json");
        let entry = ManifestEntry::complete(fingerprint("a.pdf", "h1"), vec![], "model");

        {
            RedbManifest::open(&redb_path).unwrap().commit(&entry).unwrap();
            JsonManifest::open(&json_path).unwrap().commit(&entry).unwrap();
        }

        assert_eq!(RedbManifest::open(&redb_path).unwrap().get("a.pdf").unwrap(), Some(entry.clone()));
        assert_eq!(JsonManifest::open(&json_path).unwrap().get("a.pdf").unwrap(), Some(entry));
        assert!(!json_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_handles_see_each_others_commits() {
        let temp_dir = TempDir::new().unwrap();
        let redb_path = temp_dir.path().join("manifest.redb");
        let json_path = temp_dir.path().join("manifest.json");
        let pairs: Vec<(Box<dyn ManifestStore>, Box<dyn ManifestStore>)> = vec![
            (
                Box::new(RedbManifest::open(&redb_path).unwrap()),
                Box::new(RedbManifest::open(&redb_path).unwrap()),
            ),
            (
                Box::new(JsonManifest::open(&json_path).unwrap()),
                Box::new(JsonManifest::open(&json_path).unwrap()),
            ),
        ];

        for (first, second) in pairs {
            first
                .commit(&ManifestEntry::complete(fingerprint("a.pdf", "h1"), vec![], "model"))
                .unwrap();
            second
                .commit(&ManifestEntry::complete(fingerprint("b.pdf", "h2"), vec![], "model"))
                .unwrap();

            let keys: Vec<String> = first.load().unwrap().into_keys().collect();
            assert_eq!(keys, vec!["a.pdf".to_string(), "b.pdf".to_string()]);
            assert!(second.get("a.pdf").unwrap().is_some());
        }
    }

    #[test]
    fn test_corrupt_json_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("manifest.json");
        std::fs::write(&path, "{\"a.pdf\": {\"document_id\": 3}}").unwrap();
        assert!(matches!(JsonManifest::open(&path), Err(Error::ManifestCorruption(_))));
    }

    #[test]
    fn test_failed_entry_records_error() {
        let entry = ManifestEntry::failed(fingerprint("x.pdf", "h"), "parse error".to_string(), "m");
        assert!(!entry.is_complete());
        assert_eq!(entry.error.as_deref(), Some("parse error"));
        assert!(entry.indexed_at > 0);
    }
}
