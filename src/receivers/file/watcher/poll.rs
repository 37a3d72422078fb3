// SPDX-License-Identifier: Apache-2.0

//! Polling directory watcher, for file systems where native notifications
//! are unavailable or unreliable (e.g. NFS).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::traits::{FileEvent, FileWatcher, WatcherError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    modified: Option<SystemTime>,
    size: u64,
}

impl FileState {
    fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            size: metadata.len(),
        }
    }
}

/// Rescans the watched directory every `poll_interval` and reports files
/// that appeared, changed size or mtime, or disappeared.
pub struct PollWatcher {
    dir: Option<PathBuf>,
    file_states: HashMap<PathBuf, FileState>,
    poll_interval: Duration,
    last_poll: Instant,
}

impl PollWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            dir: None,
            file_states: HashMap::new(),
            poll_interval,
            last_poll: Instant::now(),
        }
    }

    fn scan(&mut self) -> Result<Vec<FileEvent>, WatcherError> {
        let Some(dir) = self.dir.clone() else {
            return Ok(Vec::new());
        };
        self.last_poll = Instant::now();

        let mut events = Vec::new();
        let mut current = HashMap::with_capacity(self.file_states.len());
        for entry in fs::read_dir(&dir)?.flatten() {
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let path = entry.path();
            let state = FileState::from_metadata(&metadata);

            match self.file_states.get(&path) {
                None => events.push(FileEvent::create(path.clone())),
                Some(previous) if *previous != state => {
                    events.push(FileEvent::modify(path.clone()))
                }
                Some(_) => {}
            }
            current.insert(path, state);
        }

        for path in self.file_states.keys() {
            if !current.contains_key(path) {
                events.push(FileEvent::remove(path.clone()));
            }
        }
        self.file_states = current;
        Ok(events)
    }
}

impl FileWatcher for PollWatcher {
    /// Records the current directory content without reporting it, so only
    /// later changes produce events.
    fn watch(&mut self, dir: &Path) -> Result<(), WatcherError> {
        if !fs::metadata(dir)?.is_dir() {
            return Err(WatcherError::Watch(format!("{:?} is not a directory", dir)));
        }
        self.dir = Some(dir.to_path_buf());
        self.file_states.clear();
        self.scan()?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>, WatcherError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.last_poll.elapsed() >= self.poll_interval {
                let events = self.scan()?;
                if !events.is_empty() {
                    return Ok(events);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let next_poll = self.poll_interval.saturating_sub(self.last_poll.elapsed());
            let sleep = next_poll.min(deadline - now);
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
    }

    fn is_native(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}
