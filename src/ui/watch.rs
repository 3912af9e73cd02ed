use crate::core::error::{Error, Result};
use crate::indexing::discovery::is_supported_document;
use crate::sync::orchestrator::{Indexer, SyncReport, SyncRequest};
use notify_debouncer_full::{
    new_debouncer,
    notify::{
        event::{CreateKind, ModifyKind, RemoveKind},
        EventKind, RecursiveMode, Watcher,
    },
    DebounceEventResult, DebouncedEvent,
};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs a full sync whenever a supported document changes on disk
pub struct FileWatcher<'a> {
    indexer: &'a Indexer,
    debounce: Duration,
}

impl<'a> FileWatcher<'a> {
    pub fn new(indexer: &'a Indexer) -> Self {
        Self {
            indexer,
            debounce: Duration::from_secs(2),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Watch until the event channel closes, calling `on_sync` after every pass
    pub fn watch<F>(&self, mut on_sync: F) -> Result<()>
    where
        F: FnMut(&SyncReport),
    {
        let root = self.indexer.source_dir();
        let (tx, rx) = mpsc::channel();

        let mut debouncer = new_debouncer(self.debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let _ = tx.send(events);
                }
                Err(errors) => {
                    for error in errors {
                        warn!(%error, "File watcher error");
                    }
                }
            }
        })
        .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to create file watcher: {}", e))))?;

        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to watch directory: {}", e))))?;
        info!(path = %root.display(), "Watching for changes");

        // Catch up on anything that changed while nobody was watching
        self.run_pass(&mut on_sync)?;

        while let Ok(events) = rx.recv() {
            if !touches_documents(&events, root) {
                continue;
            }
            self.run_pass(&mut on_sync)?;
        }

        Ok(())
    }

    fn run_pass<F>(&self, on_sync: &mut F) -> Result<()>
    where
        F: FnMut(&SyncReport),
    {
        match self.indexer.sync(&SyncRequest::default()) {
            Ok(report) => {
                on_sync(&report);
                Ok(())
            }
            // A manual sync is running; its result covers these events
            Err(Error::Locked(path)) => {
                warn!(lock = %path.display(), "Sync skipped, index is locked");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Sync pass failed");
                Ok(())
            }
        }
    }
}

/// Whether any event below `root` concerns a PDF or text file, or a folder
/// that may hold some (a moved folder produces a single event)
pub fn touches_documents(events: &[DebouncedEvent], root: &Path) -> bool {
    events.iter().any(|event| {
        event
            .paths
            .iter()
            .any(|path| path.starts_with(root) && is_relevant(&event.kind, path))
    })
}

fn is_relevant(kind: &EventKind, path: &Path) -> bool {
    if is_supported_document(path) {
        return true;
    }
    match kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => true,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            path.is_dir() || path.extension().is_none()
        }
        _ => false,
    }
}
