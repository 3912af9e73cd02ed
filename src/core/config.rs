use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which manifest implementation backs the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManifestBackend {
    #[default]
    Redb,
    Json,
}

/// Which embedding provider produces vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local BERT model via candle
    #[default]
    Local,
    /// OpenAI-compatible HTTP endpoint
    OpenAi,
}

/// Embedding provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    /// Model name (HuggingFace repo for local, API model name for remote)
    pub model: String,
    /// Base URL of the remote API
    pub api_base: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Timeout for a single embedding request
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            model: "BAAI/bge-small-en-v1.5".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Persisted indexing settings (`config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Folder holding the source documents
    pub source_dir: PathBuf,
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks
    pub chunk_overlap: usize,
    /// Documents extracted and embedded in parallel
    pub concurrency: usize,
    pub manifest_backend: ManifestBackend,
    pub embedding: EmbeddingSettings,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("arch_pdfs"),
            chunk_size: 800,
            chunk_overlap: 300,
            concurrency: 4,
            manifest_backend: ManifestBackend::Redb,
            embedding: EmbeddingSettings::default(),
        }
    }
}

impl IndexSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(Error::Config("embedding.timeout_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Configuration for normo-index
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for normo-index data
    pub base_dir: PathBuf,
    /// Directory for the vector database
    pub database_dir: PathBuf,
    /// Directory for cached models
    pub models_dir: PathBuf,
    /// Directory for the manifest
    pub state_dir: PathBuf,
    /// Lock file guarding sync passes
    pub lock_path: PathBuf,
    /// Path of the persisted settings
    pub settings_path: PathBuf,
    pub settings: IndexSettings,
}

impl Config {
    /// Get the default configuration directory
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
            .map(|home| home.join(".normo-index"))
    }

    /// Create a new configuration with default settings
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => Self::default_base_dir()?,
        };

        Ok(Self {
            database_dir: base_dir.join("database"),
            models_dir: base_dir.join("models"),
            state_dir: base_dir.join("state"),
            lock_path: base_dir.join("sync.lock"),
            settings_path: base_dir.join("config.json"),
            settings: IndexSettings::default(),
            base_dir,
        })
    }

    /// Create a configuration and read `config.json` if one exists
    pub fn load(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::new(base_dir)?;
        if config.settings_path.exists() {
            let raw = std::fs::read_to_string(&config.settings_path)?;
            config.settings = serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!(
                    "Invalid settings in {}: {}",
                    config.settings_path.display(),
                    e
                ))
            })?;
        }
        config.settings.validate()?;
        Ok(config)
    }

    /// Initialize the configuration directories and persist the settings
    pub fn init(&self) -> Result<()> {
        self.settings.validate()?;
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.database_dir)?;
        std::fs::create_dir_all(&self.models_dir)?;
        std::fs::create_dir_all(&self.state_dir)?;
        self.save_settings()
    }

    pub fn save_settings(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(&self.settings_path, json)?;
        Ok(())
    }

    /// Check if the configuration is already initialized
    pub fn is_initialized(&self) -> bool {
        self.base_dir.exists() && self.database_dir.exists() && self.state_dir.exists()
    }

    /// Point the index at a source folder. Relative paths are made absolute
    /// against the current directory so later runs from elsewhere agree.
    pub fn set_source_dir(&mut self, path: &Path) -> Result<()> {
        self.settings.source_dir = std::path::absolute(path)?;
        Ok(())
    }

    /// Source folder, resolved against the current directory when relative
    pub fn source_dir(&self) -> PathBuf {
        resolve(&self.settings.source_dir)
    }

    pub fn manifest_path(&self) -> PathBuf {
        match self.settings.manifest_backend {
            ManifestBackend::Redb => self.state_dir.join("manifest.redb"),
            ManifestBackend::Json => self.state_dir.join("manifest.json"),
        }
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.database_dir.join("vectors.redb")
    }
}

fn resolve(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let config = Config::new(Some(PathBuf::from("/data/normo"))).unwrap();
        assert_eq!(config.database_dir, PathBuf::from("/data/normo/database"));
        assert_eq!(config.lock_path, PathBuf::from("/data/normo/sync.lock"));
        assert_eq!(
            config.manifest_path(),
            PathBuf::from("/data/normo/state/manifest.redb")
        );
    }

    #[test]
    fn test_init_persists_settings() {
        let temp_dir = TempDir::new().unwrap();
        let base_dir = temp_dir.path().join("normo");
        let mut config = Config::new(Some(base_dir.clone())).unwrap();
        config.settings.chunk_size = 1200;
        config.settings.manifest_backend = ManifestBackend::Json;
        config.init().unwrap();
        assert!(config.is_initialized());

        let loaded = Config::load(Some(base_dir)).unwrap();
        assert_eq!(loaded.settings.chunk_size, 1200);
        assert_eq!(loaded.settings.manifest_backend, ManifestBackend::Json);
        assert!(loaded.manifest_path().ends_with("manifest.json"));
    }

    #[test]
    fn test_partial_settings_use_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        std::fs::write(&config.settings_path, r#"{"chunk_size": 400, "chunk_overlap": 50}"#)
            .unwrap();

        let loaded = Config::load(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(loaded.settings.chunk_size, 400);
        assert_eq!(loaded.settings.chunk_overlap, 50);
        assert_eq!(loaded.settings.concurrency, 4);
        assert_eq!(loaded.settings.embedding.provider, EmbeddingProvider::Local);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let settings = IndexSettings {
            chunk_size: 100,
            chunk_overlap: 100,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_source_dir_is_stored_absolute() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        config.set_source_dir(Path::new("laws/arch_pdfs")).unwrap();
        config.init().unwrap();

        let expected = std::env::current_dir().unwrap().join("laws/arch_pdfs");
        let loaded = Config::load(Some(temp_dir.path().to_path_buf())).unwrap();
        assert!(loaded.settings.source_dir.is_absolute());
        assert_eq!(loaded.settings.source_dir, expected);
        assert_eq!(loaded.source_dir(), expected);

        config.set_source_dir(Path::new("/srv/docs")).unwrap();
        assert_eq!(config.settings.source_dir, PathBuf::from("/srv/docs"));
    }

    #[test]
    fn test_invalid_settings_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        std::fs::write(&config.settings_path, "{not json").unwrap();
        assert!(Config::load(Some(temp_dir.path().to_path_buf())).is_err());
    }
}
