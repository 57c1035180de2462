//! Adapter over the external file watcher's event stream.
//!
//! The watcher itself lives in the embedding server; the core consumes its
//! `notify` events, classified into the three kinds the HMR propagator
//! distinguishes, and registers files of interest back through
//! [`WatchHandle`].

use notify::EventKind;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kind of file-system change, as seen by the propagator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    /// File content modified in place.
    Modify,
    /// File created (or renamed into place).
    Add,
    /// File removed (or renamed away).
    Unlink,
}

impl From<&EventKind> for FileChangeKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => Self::Add,
            EventKind::Remove(_) => Self::Unlink,
            _ => Self::Modify,
        }
    }
}

/// A single change event handed to the propagator.
#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// Seam through which the core asks the external watcher to track a file.
///
/// The transform pipeline calls this for every file it serves so later
/// edits reach the propagator.
pub trait WatchHandle: Send + Sync {
    fn watch_file(&self, path: &Path);
}

/// A no-op handle for contexts without a watcher (tests, one-shot tools).
pub struct NullWatchHandle;

impl WatchHandle for NullWatchHandle {
    fn watch_file(&self, _path: &Path) {}
}

/// Read poll interval for [`read_modified_file`].
const RETRY_INTERVAL: Duration = Duration::from_millis(10);
const RETRY_COUNT: u32 = 10;

/// Read a just-changed file, tolerating editors that signal the change
/// before flushing content.
///
/// If the first read comes back empty, the file's mtime is polled up to ten
/// times at 10 ms intervals; the file is re-read once the mtime moves (or
/// the retries run out).
pub async fn read_modified_file(path: &Path) -> io::Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    if !content.is_empty() {
        return Ok(content);
    }

    let mtime = tokio::fs::metadata(path).await?.modified()?;
    for _ in 0..RETRY_COUNT {
        tokio::time::sleep(RETRY_INTERVAL).await;
        let new_mtime = tokio::fs::metadata(path).await?.modified()?;
        if new_mtime != mtime {
            break;
        }
    }
    tokio::fs::read_to_string(path).await
}
