use crate::core::error::{Error, Result};
use redb::{Database, DatabaseError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// A redb file that is opened for one operation at a time.
///
/// redb locks the file for as long as a `Database` handle lives, so stores
/// keep only the path and open a handle per call. Another process holding the
/// file is waited for until the timeout, then reported as `Error::Locked`.
#[derive(Debug, Clone)]
pub struct DatabaseFile {
    path: PathBuf,
    timeout: Duration,
}

impl DatabaseFile {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            timeout: OPEN_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (or create) the database, waiting while another handle holds it
    pub fn open(&self) -> Result<Database> {
        let started = Instant::now();
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    if started.elapsed() >= self.timeout {
                        return Err(Error::Locked(self.path.clone()));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(Error::Database(format!(
                        "Failed to open {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_and_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = DatabaseFile::new(&temp_dir.path().join("nested").join("x.redb")).unwrap();
        drop(file.open().unwrap());
        assert!(file.path().exists());
    }

    #[test]
    fn test_busy_file_reports_locked() {
        let temp_dir = TempDir::new().unwrap();
        let file = DatabaseFile::new(&temp_dir.path().join("x.redb"))
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let held = file.open().unwrap();
        assert!(matches!(file.open(), Err(Error::Locked(path)) if path == file.path()));

        drop(held);
        assert!(file.open().is_ok());
    }

    #[test]
    fn test_waits_for_release() {
        let temp_dir = TempDir::new().unwrap();
        let file = DatabaseFile::new(&temp_dir.path().join("x.redb")).unwrap();

        let held = file.open().unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(held);
        });

        assert!(file.open().is_ok());
        releaser.join().unwrap();
    }
}
