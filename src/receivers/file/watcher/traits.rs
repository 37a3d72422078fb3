// SPDX-License-Identifier: Apache-2.0

//! Traits and types for directory watchers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the notification backend while running
    #[error("backend error: {0}")]
    Backend(String),

    #[error("channel error: {0}")]
    Channel(String),
}

/// Kind of file event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    /// Content or name changed
    Modify,
    Remove,
    Other,
}

/// A file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub paths: Vec<PathBuf>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, paths: Vec<PathBuf>) -> Self {
        Self { kind, paths }
    }

    pub fn create(path: PathBuf) -> Self {
        Self::new(FileEventKind::Create, vec![path])
    }

    pub fn modify(path: PathBuf) -> Self {
        Self::new(FileEventKind::Modify, vec![path])
    }

    pub fn remove(path: PathBuf) -> Self {
        Self::new(FileEventKind::Remove, vec![path])
    }
}

/// Source of create and write notifications for one directory.
pub trait FileWatcher: Send {
    /// Start watching `dir` (non-recursive).
    fn watch(&mut self, dir: &Path) -> Result<(), WatcherError>;

    /// Wait up to `timeout` for events. An empty batch means the timeout
    /// expired.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>, WatcherError>;

    /// True for OS notifications, false for polling.
    fn is_native(&self) -> bool;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
